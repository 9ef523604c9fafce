//! Render orchestration.
//!
//! One call to [`RenderEngine::render`] runs: admission, session dial,
//! isolated target setup, domain enabling, the readiness batch (watchdog
//! listeners + waiter), the ledger check, the print batch (crash listener
//! + printer), and teardown in reverse order. The wall-clock deadline is
//! `wait_timeout + wait_delay`; its expiry dominates whatever error was in
//! flight when it fired.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::admission::Admission;
use crate::config::{EngineConfig, RenderRequest};
use crate::error::{is_cancellation, RenderError, RenderErrorKind};
use crate::ledger::RequestLedger;
use crate::print;
use crate::ready;
use crate::session::Session;
use crate::target::{self, TargetHandle};
use crate::transport::SubscriptionCloser;
use crate::watch;

/// Drives a shared headless browser to print URLs as PDF files.
///
/// The admission state (active-connection count and rendezvous slot) lives
/// here rather than in process globals, so independent engines stay
/// hermetic.
pub struct RenderEngine {
    cfg: EngineConfig,
    admission: Admission,
}

impl RenderEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            admission: Admission::new(),
        }
    }

    /// Loads `req.url`, waits for the page to be rendered enough, and
    /// writes the PDF to `dest` (create-or-truncate, mode 0600).
    pub async fn render(&self, req: &RenderRequest, dest: &Path) -> Result<(), RenderError> {
        const OP: &str = "render";

        debug!(target: "render", options = ?req, "render requested");
        let total_wait = Duration::from_secs_f64(req.wait_timeout + req.wait_delay);
        let deadline = Instant::now() + total_wait;

        let permit = self
            .admission
            .acquire(deadline, req.max_connections, req.wait_for_connection)
            .await?;
        let outcome = self.resolve(req, dest, deadline).await;
        drop(permit);

        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                // The deadline dominates whatever failed while it expired.
                if err.kind != RenderErrorKind::DeadlineExceeded && Instant::now() >= deadline {
                    warn!(target: "render", cause = %err, "render hit the wall-clock deadline");
                    return Err(RenderError::new(RenderErrorKind::DeadlineExceeded, OP)
                        .with_detail(format!(
                            "wait timeout of {:.2}s exceeded ({err})",
                            req.wait_timeout + req.wait_delay
                        )));
                }
                Err(err)
            }
        }
    }

    async fn resolve(
        &self,
        req: &RenderRequest,
        dest: &Path,
        deadline: Instant,
    ) -> Result<(), RenderError> {
        let root = CancellationToken::new();
        let expiry = root.clone();
        let expiry_task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => expiry.cancel(),
                _ = expiry.cancelled() => {}
            }
        });

        let session = Session::open(&self.cfg.endpoint, deadline, req.rpcc_buffer_size).await;
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                root.cancel();
                let _ = expiry_task.await;
                return Err(err);
            }
        };

        let target = TargetHandle::create(&session, deadline, req.rpcc_buffer_size).await;
        let outcome = match target {
            Ok(target) => {
                let outcome = self.drive(&target, req, dest, &root, deadline).await;
                // Teardown always runs, on its own grace deadline.
                target.dispose(&session).await;
                outcome
            }
            Err(err) => Err(err),
        };

        session.close().await;
        root.cancel();
        let _ = expiry_task.await;
        outcome
    }

    async fn drive(
        &self,
        target: &TargetHandle,
        req: &RenderRequest,
        dest: &Path,
        root: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), RenderError> {
        const OP: &str = "render.drive";

        let conn = Arc::clone(target.conn());
        target::enable_domains(&conn, deadline).await?;
        target::set_extra_http_headers(&conn, &req.custom_http_headers, deadline).await?;

        // Watchdog subscriptions open before navigation so nothing is
        // missed; the waiter closes them when the readiness stage ends.
        let crash_events = conn.subscribe("Inspector.targetCrashed");
        let exception_events = conn.subscribe("Runtime.exceptionThrown");
        let console_events = conn.subscribe("Runtime.consoleAPICalled");
        let request_events = conn.subscribe("Network.requestWillBeSent");
        let response_events = conn.subscribe("Network.responseReceived");
        let failed_events = conn.subscribe("Network.loadingFailed");
        let watchdog_subs = SubscriptionCloser::new(
            Arc::clone(&conn),
            vec![
                "Inspector.targetCrashed",
                "Runtime.exceptionThrown",
                "Runtime.consoleAPICalled",
                "Network.requestWillBeSent",
                "Network.responseReceived",
                "Network.loadingFailed",
            ],
        );

        let ledger = Arc::new(RequestLedger::new());
        let scope = root.child_token();
        let mut batch = JoinSet::new();
        batch.spawn(watch::crash_listener(crash_events, scope.clone()));
        batch.spawn(watch::exception_listener(exception_events, scope.clone()));
        batch.spawn(watch::console_listener(console_events));
        batch.spawn(watch::request_listener(request_events, Arc::clone(&ledger)));
        batch.spawn(watch::response_listener(
            response_events,
            Arc::clone(&ledger),
            scope.clone(),
        ));
        batch.spawn(watch::loading_failed_listener(
            failed_events,
            Arc::clone(&ledger),
            scope.clone(),
        ));
        batch.spawn(ready::waiter(
            Arc::clone(&conn),
            req.clone(),
            scope.clone(),
            deadline,
            watchdog_subs,
        ));
        run_batch(batch, &scope).await?;

        if let Some(report) = ledger.failure_report() {
            return Err(
                RenderError::new(RenderErrorKind::ResourceError, OP).with_detail(report)
            );
        }

        // Print phase: a fresh crash listener rides along with the printer.
        let crash_events = conn.subscribe("Inspector.targetCrashed");
        let print_scope = root.child_token();
        let mut batch = JoinSet::new();
        batch.spawn(watch::crash_listener(crash_events, print_scope.clone()));
        batch.spawn(print_phase(
            Arc::clone(&conn),
            req.clone(),
            dest.to_path_buf(),
            print_scope.clone(),
            deadline,
        ));
        run_batch(batch, &print_scope).await
    }
}

/// The printer side of the print batch: whichever way it exits, it closes
/// the crash subscription so the listener ends too.
async fn print_phase(
    conn: Arc<crate::transport::Conn>,
    req: RenderRequest,
    dest: std::path::PathBuf,
    cancel: CancellationToken,
    deadline: Instant,
) -> Result<(), RenderError> {
    let result = print::printer(Arc::clone(&conn), req, dest, cancel, deadline).await;
    conn.unsubscribe("Inspector.targetCrashed");
    result
}

/// Waits for every sibling of a batch. The first failure cancels the scope;
/// a real failure beats the cancellation sentinel when both arrive.
async fn run_batch(
    mut batch: JoinSet<Result<(), RenderError>>,
    scope: &CancellationToken,
) -> Result<(), RenderError> {
    const OP: &str = "render.run_batch";

    let mut first_real: Option<RenderError> = None;
    let mut first_any: Option<RenderError> = None;

    while let Some(joined) = batch.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(join_err) => {
                RenderError::new(RenderErrorKind::Unexpected, OP).with_detail(join_err.to_string())
            }
        };
        scope.cancel();
        if first_real.is_none() && !is_cancellation(&failure) {
            first_real = Some(failure.clone());
        }
        if first_any.is_none() {
            first_any = Some(failure);
        }
    }

    match first_real.or(first_any) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
