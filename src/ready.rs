//! Readiness evaluation: navigation, the four ready gates, the optional
//! fixed delay, and the JS render-status sentinel.
//!
//! The waiter owns subscription teardown for the whole readiness batch:
//! whichever way it exits, it closes the watchdog subscriptions so the
//! sibling listeners end on the stream-closing sentinel.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RenderRequest;
use crate::error::{is_cancellation, RenderError, RenderErrorKind};
use crate::transport::{Conn, EventStream, SubscriptionCloser};

const POLL_TICK: Duration = Duration::from_millis(100);

/// Lifecycle event marking a quiet network for the idle window.
const NETWORK_IDLE: &str = "networkIdle";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LifecycleEventParams {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateReply {
    #[serde(default)]
    result: EvaluateResult,
    exception_details: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateResult {
    value: Option<Value>,
}

/// Runs the readiness stage. A cancelled scope is a non-error return here;
/// the cause that cancelled it wins the batch.
pub(crate) async fn waiter(
    conn: Arc<Conn>,
    req: RenderRequest,
    cancel: CancellationToken,
    deadline: Instant,
    watchdog_subs: SubscriptionCloser,
) -> Result<(), RenderError> {
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        outcome = drive_ready(&conn, &req, &cancel, deadline) => outcome,
    };
    watchdog_subs.close_all();
    result
}

async fn drive_ready(
    conn: &Arc<Conn>,
    req: &RenderRequest,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), RenderError> {
    // Subscribe before navigating so no gate event can be missed. The
    // streams close when they drop at the end of this block.
    let dom_content = conn.subscribe("Page.domContentEventFired");
    let load_event = conn.subscribe("Page.loadEventFired");
    let lifecycle = conn.subscribe("Page.lifecycleEvent");
    let loading_finished = conn.subscribe("Network.loadingFinished");

    conn.call("Page.navigate", json!({ "url": req.url }), deadline)
        .await?;

    tokio::try_join!(
        gate(dom_content),
        gate(load_event),
        lifecycle_gate(lifecycle),
        gate(loading_finished),
    )?;

    if req.wait_delay > 0.0 {
        debug!(target: "ready", delay = req.wait_delay, "applying wait delay");
        tokio::time::sleep(Duration::from_secs_f64(req.wait_delay)).await;
    } else {
        debug!(target: "ready", "no wait delay to apply");
    }

    if let Some(status) = req
        .wait_js_render_status
        .as_deref()
        .filter(|status| !status.is_empty())
    {
        debug!(target: "ready", %status, "waiting for the JS render status");
        let expr = format!("window.status === '{status}'");
        if let Err(err) = wait(conn, &expr, cancel, deadline).await {
            if is_cancellation(&err) {
                return Ok(());
            }
            return Err(err);
        }
    }

    Ok(())
}

/// Waits for exactly one event on the stream.
async fn gate(mut events: EventStream) -> Result<(), RenderError> {
    events.recv().await?;
    debug!(target: "ready", event = events.method(), "gate fired");
    Ok(())
}

/// Drains lifecycle events until the network-idle one arrives.
async fn lifecycle_gate(mut events: EventStream) -> Result<(), RenderError> {
    loop {
        let params = events.recv().await?;
        let name = serde_json::from_value::<LifecycleEventParams>(params)
            .map(|event| event.name)
            .unwrap_or_default();
        debug!(target: "ready", event = %name, "lifecycle event received");
        if name == NETWORK_IDLE {
            return Ok(());
        }
    }
}

/// `Runtime.evaluate` with the result decoded by value. A reply carrying
/// exception details is an error.
pub(crate) async fn eval<T: DeserializeOwned>(
    conn: &Arc<Conn>,
    expr: &str,
    deadline: Instant,
) -> Result<T, RenderError> {
    evaluate(conn, expr, true, false, deadline)
        .await
        .and_then(|value| decode_value(value.unwrap_or(Value::Null)))
}

/// `Runtime.evaluate` for side effects only; the result is discarded.
#[allow(dead_code)]
pub(crate) async fn eval_unit(
    conn: &Arc<Conn>,
    expr: &str,
    deadline: Instant,
) -> Result<(), RenderError> {
    evaluate(conn, expr, false, false, deadline).await.map(|_| ())
}

/// Like [`eval`], but resolves the expression's promise first.
#[allow(dead_code)]
pub(crate) async fn eval_promise<T: DeserializeOwned>(
    conn: &Arc<Conn>,
    expr: &str,
    deadline: Instant,
) -> Result<T, RenderError> {
    evaluate(conn, expr, true, true, deadline)
        .await
        .and_then(|value| decode_value(value.unwrap_or(Value::Null)))
}

async fn evaluate(
    conn: &Arc<Conn>,
    expr: &str,
    by_value: bool,
    await_promise: bool,
    deadline: Instant,
) -> Result<Option<Value>, RenderError> {
    const OP: &str = "ready.evaluate";

    let mut params = json!({ "expression": expr, "returnByValue": by_value });
    if await_promise {
        params["awaitPromise"] = json!(true);
    }
    let reply = conn.call("Runtime.evaluate", params, deadline).await?;
    let reply: EvaluateReply = serde_json::from_value(reply).map_err(|err| {
        RenderError::new(RenderErrorKind::Unexpected, OP)
            .with_detail(format!("evaluate reply: {err}"))
    })?;
    if let Some(details) = reply.exception_details {
        return Err(RenderError::new(RenderErrorKind::RuntimeException, OP)
            .with_detail(details.to_string()));
    }
    Ok(reply.result.value)
}

fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T, RenderError> {
    serde_json::from_value(value).map_err(|err| {
        RenderError::new(RenderErrorKind::Unexpected, "ready.evaluate")
            .with_detail(format!("evaluate result: {err}"))
    })
}

/// Polls `expr` until it evaluates to `true`.
pub(crate) async fn wait(
    conn: &Arc<Conn>,
    expr: &str,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), RenderError> {
    poll(cancel, deadline, || eval::<bool>(conn, expr, deadline)).await
}

/// Samples `f` until it reports `true`. The first sample happens
/// immediately, later samples every 100 ms; the enclosing scope and the
/// deadline interrupt the wait between samples.
pub(crate) async fn poll<F, Fut>(
    cancel: &CancellationToken,
    deadline: Instant,
    mut f: F,
) -> Result<(), RenderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, RenderError>>,
{
    const OP: &str = "ready.poll";

    let mut ticker = interval(POLL_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Biased so an already-signalled cancellation or deadline beats the
        // interval's immediately-ready first tick.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RenderError::cancelled(OP)),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(RenderError::new(RenderErrorKind::DeadlineExceeded, OP)
                    .with_detail("condition still false at the deadline"))
            }
            _ = ticker.tick() => {}
        }
        if f().await? {
            return Ok(());
        }
    }
}
