//! Watchdog listeners that preempt a render.
//!
//! Each listener loops on one event subscription. A crash or an uncaught
//! exception cancels the readiness scope and becomes the render's error; a
//! failing subresource is recorded in the ledger and cancels the scope so
//! the ready gates stop waiting. Console output is observed for diagnostics
//! only. Listeners end quietly when their subscription closes under them.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{is_benign_interrupt, RenderError, RenderErrorKind};
use crate::ledger::RequestLedger;
use crate::transport::EventStream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionThrownParams {
    exception_details: ExceptionDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionDetails {
    text: Option<String>,
    exception: Option<RemoteObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteObject {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsoleCalledParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSentParams {
    request_id: String,
    request: RequestPayload,
}

#[derive(Debug, Deserialize)]
struct RequestPayload {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceivedParams {
    request_id: String,
    response: ResponsePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePayload {
    status: i64,
    #[serde(default)]
    status_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFailedParams {
    request_id: String,
    error_text: String,
}

/// Converts a subscription ending into a clean listener exit.
fn settle(err: RenderError) -> Result<(), RenderError> {
    if is_benign_interrupt(&err) {
        Ok(())
    } else {
        Err(err)
    }
}

pub(crate) async fn crash_listener(
    mut events: EventStream,
    cancel: CancellationToken,
) -> Result<(), RenderError> {
    const OP: &str = "watch.crash";

    match events.recv().await {
        Ok(_) => {
            debug!(target: "watch", "event 'targetCrashed' received");
            cancel.cancel();
            Err(RenderError::new(RenderErrorKind::TargetCrashed, OP)
                .with_detail("target has crashed"))
        }
        Err(err) => settle(err),
    }
}

pub(crate) async fn exception_listener(
    mut events: EventStream,
    cancel: CancellationToken,
) -> Result<(), RenderError> {
    const OP: &str = "watch.exception";

    match events.recv().await {
        Ok(params) => {
            let detail = serde_json::from_value::<ExceptionThrownParams>(params)
                .ok()
                .and_then(|thrown| {
                    thrown
                        .exception_details
                        .exception
                        .and_then(|exception| exception.description)
                        .or(thrown.exception_details.text)
                })
                .unwrap_or_else(|| "uncaught exception".to_string());
            debug!(target: "watch", %detail, "event 'exceptionThrown' received");
            cancel.cancel();
            Err(RenderError::new(RenderErrorKind::RuntimeException, OP).with_detail(detail))
        }
        Err(err) => settle(err),
    }
}

pub(crate) async fn console_listener(mut events: EventStream) -> Result<(), RenderError> {
    loop {
        match events.recv().await {
            Ok(params) => {
                if let Ok(message) = serde_json::from_value::<ConsoleCalledParams>(params) {
                    debug!(
                        target: "watch",
                        kind = %message.kind,
                        args = ?message.args,
                        "event 'consoleAPICalled' received"
                    );
                }
            }
            Err(err) => return settle(err),
        }
    }
}

pub(crate) async fn request_listener(
    mut events: EventStream,
    ledger: Arc<RequestLedger>,
) -> Result<(), RenderError> {
    loop {
        match events.recv().await {
            Ok(params) => {
                let Ok(sent) = serde_json::from_value::<RequestWillBeSentParams>(params) else {
                    continue;
                };
                debug!(
                    target: "watch",
                    request = %sent.request_id,
                    url = %sent.request.url,
                    "event 'requestWillBeSent' received"
                );
                ledger.record_request(&sent.request_id, &sent.request.url);
            }
            Err(err) => return settle(err),
        }
    }
}

pub(crate) async fn response_listener(
    mut events: EventStream,
    ledger: Arc<RequestLedger>,
    cancel: CancellationToken,
) -> Result<(), RenderError> {
    loop {
        match events.recv().await {
            Ok(params) => {
                let Ok(received) = serde_json::from_value::<ResponseReceivedParams>(params)
                else {
                    continue;
                };
                let message =
                    format!("{} {}", received.response.status, received.response.status_text);
                debug!(
                    target: "watch",
                    url = %ledger.url_for(&received.request_id),
                    %message,
                    "event 'responseReceived' received"
                );
                if received.response.status < 400 {
                    continue;
                }
                if ledger.record_response_error(&received.request_id, &message) {
                    cancel.cancel();
                }
            }
            Err(err) => return settle(err),
        }
    }
}

pub(crate) async fn loading_failed_listener(
    mut events: EventStream,
    ledger: Arc<RequestLedger>,
    cancel: CancellationToken,
) -> Result<(), RenderError> {
    loop {
        match events.recv().await {
            Ok(params) => {
                let Ok(failed) = serde_json::from_value::<LoadingFailedParams>(params) else {
                    continue;
                };
                debug!(
                    target: "watch",
                    url = %ledger.url_for(&failed.request_id),
                    error = %failed.error_text,
                    "event 'loadingFailed' received"
                );
                if ledger.record_load_failure(&failed.request_id, &failed.error_text) {
                    cancel.cancel();
                }
            }
            Err(err) => return settle(err),
        }
    }
}
