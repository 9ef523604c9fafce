//! Per-render isolated browser context and target.
//!
//! Every render gets a fresh browser context (its own cookie/storage
//! partition) with one blank target inside it, plus a dedicated WebSocket
//! to that target. Disposal runs with a fresh deadline so the browser is
//! cleaned up even when the render scope is already cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RenderError, RenderErrorKind};
use crate::session::Session;
use crate::transport::Conn;

/// Grace period for teardown commands issued after the render scope ended.
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBrowserContextReply {
    browser_context_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTargetReply {
    target_id: String,
}

/// Scoped handle over a browser context, the target inside it, and the
/// target-scoped connection. If construction fails partway, the
/// sub-resources acquired so far are released before the error returns.
pub(crate) struct TargetHandle {
    context_id: String,
    target_id: String,
    conn: Arc<Conn>,
}

impl TargetHandle {
    pub(crate) async fn create(
        session: &Session,
        deadline: Instant,
        rpcc_buffer_size: usize,
    ) -> Result<Self, RenderError> {
        const OP: &str = "target.create";

        let reply = session
            .call("Target.createBrowserContext", json!({}), deadline)
            .await?;
        let context: CreateBrowserContextReply =
            serde_json::from_value(reply).map_err(|err| {
                RenderError::new(RenderErrorKind::Unexpected, OP)
                    .with_detail(format!("createBrowserContext reply: {err}"))
            })?;
        let context_id = context.browser_context_id;

        let created = session
            .call(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": context_id }),
                deadline,
            )
            .await;
        let target_id = match created.and_then(|reply| {
            serde_json::from_value::<CreateTargetReply>(reply).map_err(|err| {
                RenderError::new(RenderErrorKind::Unexpected, OP)
                    .with_detail(format!("createTarget reply: {err}"))
            })
        }) {
            Ok(reply) => reply.target_id,
            Err(err) => {
                dispose_context(session, &context_id).await;
                return Err(err);
            }
        };

        let ws_url = format!(
            "ws://{}/devtools/page/{}",
            session.ws_authority(),
            target_id
        );
        let conn = match Conn::connect(&ws_url, rpcc_buffer_size, deadline).await {
            Ok(conn) => conn,
            Err(err) => {
                close_target(session, &target_id).await;
                dispose_context(session, &context_id).await;
                return Err(err);
            }
        };
        debug!(
            target: "target",
            context_id = %context_id,
            target_id = %target_id,
            "isolated target ready"
        );

        Ok(Self {
            context_id,
            target_id,
            conn,
        })
    }

    pub(crate) fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// Releases everything in LIFO order: target socket, target, browser
    /// context. Errors are logged and discarded so the render's primary
    /// outcome survives.
    pub(crate) async fn dispose(self, session: &Session) {
        self.conn.close().await;
        close_target(session, &self.target_id).await;
        dispose_context(session, &self.context_id).await;
    }
}

async fn close_target(session: &Session, target_id: &str) {
    let grace = Instant::now() + TEARDOWN_GRACE;
    if let Err(err) = session
        .call("Target.closeTarget", json!({ "targetId": target_id }), grace)
        .await
    {
        warn!(target: "target", %err, target_id, "closeTarget failed");
    }
}

async fn dispose_context(session: &Session, context_id: &str) {
    let grace = Instant::now() + TEARDOWN_GRACE;
    if let Err(err) = session
        .call(
            "Target.disposeBrowserContext",
            json!({ "browserContextId": context_id }),
            grace,
        )
        .await
    {
        warn!(target: "target", %err, context_id, "disposeBrowserContext failed");
    }
}

/// Enables the devtools domains the render listens on. All five must
/// succeed; they are issued in parallel.
pub(crate) async fn enable_domains(conn: &Arc<Conn>, deadline: Instant) -> Result<(), RenderError> {
    const OP: &str = "target.enable_domains";

    tokio::try_join!(
        conn.call("DOM.enable", json!({}), deadline),
        conn.call("Network.enable", json!({}), deadline),
        conn.call("Page.enable", json!({}), deadline),
        conn.call(
            "Page.setLifecycleEventsEnabled",
            json!({ "enabled": true }),
            deadline,
        ),
        conn.call("Runtime.enable", json!({}), deadline),
    )
    .map(|_| ())
    .map_err(|err| {
        RenderError::new(RenderErrorKind::SetupFailed, OP).with_detail(err.to_string())
    })
}

/// Applies extra HTTP headers to every request the page makes. Must run
/// after `Network.enable`; an empty map skips the call entirely.
pub(crate) async fn set_extra_http_headers(
    conn: &Arc<Conn>,
    headers: &HashMap<String, String>,
    deadline: Instant,
) -> Result<(), RenderError> {
    const OP: &str = "target.set_extra_http_headers";

    if headers.is_empty() {
        debug!(target: "target", "no custom HTTP headers to apply");
        return Ok(());
    }
    for (name, value) in headers {
        debug!(target: "target", header = %name, value = %value, "custom HTTP header");
    }
    conn.call(
        "Network.setExtraHTTPHeaders",
        json!({ "headers": headers }),
        deadline,
    )
    .await
    .map(|_| ())
    .map_err(|err| {
        RenderError::new(RenderErrorKind::SetupFailed, OP).with_detail(err.to_string())
    })
}
