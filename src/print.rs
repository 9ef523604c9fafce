//! PDF printing and stream-to-file copy.
//!
//! `Page.printToPDF` runs in stream mode; the reply hands back an IO stream
//! handle that is read in chunks and copied to the destination file. Two
//! protocol failures get dedicated kinds: a rejected page-range expression
//! and a reply that exceeded the devtools frame cap.

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RenderRequest;
use crate::error::{
    is_message_too_large, is_page_range_syntax, RenderError, RenderErrorKind,
};
use crate::transport::Conn;

/// Bytes requested per `IO.read`. Kept well under the default frame cap so
/// the base64 expansion of a chunk still fits.
const STREAM_CHUNK: usize = 256 << 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrintToPdfReply {
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IoReadReply {
    #[serde(default)]
    data: String,
    #[serde(default)]
    base64_encoded: bool,
    #[serde(default)]
    eof: bool,
}

/// Prints the page and copies the resulting stream to `dest`. Runs inside
/// the print batch; scope cancellation surfaces as the cancellation
/// sentinel and lets the watchdog's error win.
pub(crate) async fn printer(
    conn: Arc<Conn>,
    req: RenderRequest,
    dest: std::path::PathBuf,
    cancel: CancellationToken,
    deadline: Instant,
) -> Result<(), RenderError> {
    const OP: &str = "print.printer";

    tokio::select! {
        _ = cancel.cancelled() => Err(RenderError::cancelled(OP)),
        result = print_to_file(&conn, &req, &dest, deadline) => result,
    }
}

async fn print_to_file(
    conn: &Arc<Conn>,
    req: &RenderRequest,
    dest: &std::path::Path,
    deadline: Instant,
) -> Result<(), RenderError> {
    const OP: &str = "print.print_to_file";

    debug!(target: "print", "starting printToPDF");
    let reply = conn
        .call("Page.printToPDF", print_params(req), deadline)
        .await
        .map_err(|err| classify_print_failure(err, req))?;
    let reply: PrintToPdfReply = serde_json::from_value(reply).map_err(|err| {
        RenderError::new(RenderErrorKind::Unexpected, OP)
            .with_detail(format!("printToPDF reply: {err}"))
    })?;
    let stream = reply.stream.ok_or_else(|| {
        RenderError::new(RenderErrorKind::Unexpected, OP)
            .with_detail("printToPDF reply missing the stream handle")
    })?;

    debug!(target: "print", %stream, dest = %dest.display(), "streaming PDF from the browser");
    copy_stream(conn, &stream, dest, deadline).await?;
    debug!(target: "print", "streaming complete");
    Ok(())
}

fn classify_print_failure(err: RenderError, req: &RenderRequest) -> RenderError {
    const OP: &str = "print.print_to_file";

    let text = err.to_string();
    if is_page_range_syntax(&text) {
        let ranges = req.page_ranges.as_deref().unwrap_or_default();
        return RenderError::new(RenderErrorKind::InvalidPageRange, OP)
            .with_detail(format!("'{ranges}' is not a valid page range expression"));
    }
    if is_message_too_large(&text) {
        return RenderError::new(RenderErrorKind::BufferTooSmall, OP).with_detail(format!(
            "'{}' bytes are not enough: increase the rpcc buffer size (up to 100 MB)",
            req.rpcc_buffer_size
        ));
    }
    err
}

fn print_params(req: &RenderRequest) -> Value {
    let mut params = json!({
        "transferMode": "ReturnAsStream",
        "paperWidth": req.paper_width,
        "paperHeight": req.paper_height,
        "marginTop": req.margin_top,
        "marginBottom": req.margin_bottom,
        "marginLeft": req.margin_left,
        "marginRight": req.margin_right,
        "landscape": req.landscape,
        "displayHeaderFooter": true,
        "headerTemplate": req.header_html,
        "footerTemplate": req.footer_html,
        "printBackground": true,
        "scale": req.scale,
    });
    if let Some(ranges) = req.page_ranges.as_deref().filter(|ranges| !ranges.is_empty()) {
        params["pageRanges"] = json!(ranges);
    }
    params
}

async fn copy_stream(
    conn: &Arc<Conn>,
    stream: &str,
    dest: &std::path::Path,
    deadline: Instant,
) -> Result<(), RenderError> {
    const OP: &str = "print.copy_stream";

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(dest).await.map_err(|err| {
        RenderError::new(RenderErrorKind::OutputFailed, OP)
            .with_detail(format!("open {}: {err}", dest.display()))
    })?;
    let mut writer = BufWriter::new(file);

    loop {
        let reply = conn
            .call(
                "IO.read",
                json!({ "handle": stream, "size": STREAM_CHUNK }),
                deadline,
            )
            .await?;
        let chunk: IoReadReply = serde_json::from_value(reply).map_err(|err| {
            RenderError::new(RenderErrorKind::Unexpected, OP)
                .with_detail(format!("IO.read reply: {err}"))
        })?;

        let bytes = if chunk.base64_encoded {
            STANDARD.decode(chunk.data.as_bytes()).map_err(|err| {
                RenderError::new(RenderErrorKind::Unexpected, OP)
                    .with_detail(format!("stream chunk decode: {err}"))
            })?
        } else {
            chunk.data.into_bytes()
        };
        if !bytes.is_empty() {
            writer.write_all(&bytes).await.map_err(|err| {
                RenderError::new(RenderErrorKind::OutputFailed, OP)
                    .with_detail(format!("write {}: {err}", dest.display()))
            })?;
        }
        if chunk.eof {
            break;
        }
    }

    writer.flush().await.map_err(|err| {
        RenderError::new(RenderErrorKind::OutputFailed, OP)
            .with_detail(format!("flush {}: {err}", dest.display()))
    })?;

    let grace = Instant::now() + std::time::Duration::from_secs(5);
    if let Err(err) = conn.call("IO.close", json!({ "handle": stream }), grace).await {
        debug!(target: "print", %err, "IO.close failed");
    }
    Ok(())
}
