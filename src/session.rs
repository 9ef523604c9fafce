//! Devtools endpoint discovery and the browser-level session.

use std::sync::Arc;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::error::{RenderError, RenderErrorKind};
use crate::transport::Conn;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    web_socket_debugger_url: String,
}

/// Connection to the browser itself (as opposed to one of its targets).
/// Browser contexts and targets are created and disposed through it.
pub(crate) struct Session {
    conn: Arc<Conn>,
    ws_authority: String,
}

impl Session {
    /// Discovers the browser's primary WebSocket URL via the HTTP debugger
    /// and dials it. Any failure to reach or decode the version endpoint,
    /// or to dial the socket, is `BrowserUnreachable`.
    pub(crate) async fn open(
        endpoint: &str,
        deadline: Instant,
        rpcc_buffer_size: usize,
    ) -> Result<Self, RenderError> {
        const OP: &str = "session.open";

        let version_url = format!("{}/json/version", endpoint.trim_end_matches('/'));
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RenderError::new(RenderErrorKind::DeadlineExceeded, OP)
                .with_detail("no time left to discover the debugger endpoint"));
        }

        let client = reqwest::Client::builder()
            .timeout(remaining)
            .build()
            .map_err(|err| {
                RenderError::new(RenderErrorKind::Unexpected, OP).with_detail(err.to_string())
            })?;
        let version: VersionInfo = client
            .get(&version_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| {
                RenderError::new(RenderErrorKind::BrowserUnreachable, OP)
                    .with_detail(format!("GET {version_url}: {err}"))
            })?
            .json()
            .await
            .map_err(|err| {
                RenderError::new(RenderErrorKind::BrowserUnreachable, OP)
                    .with_detail(format!("decode {version_url}: {err}"))
            })?;
        debug!(
            target: "session",
            ws_url = %version.web_socket_debugger_url,
            "discovered devtools debugger"
        );

        let ws_authority = authority_of(&version.web_socket_debugger_url, OP)?;
        let conn = Conn::connect(&version.web_socket_debugger_url, rpcc_buffer_size, deadline)
            .await?;

        Ok(Self { conn, ws_authority })
    }

    pub(crate) fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// `host:port` the per-target WebSocket URLs are addressed at.
    pub(crate) fn ws_authority(&self) -> &str {
        &self.ws_authority
    }

    pub(crate) async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        deadline: Instant,
    ) -> Result<serde_json::Value, RenderError> {
        self.conn.call(method, params, deadline).await
    }

    pub(crate) async fn close(&self) {
        self.conn.close().await;
    }
}

fn authority_of(ws_url: &str, op: &'static str) -> Result<String, RenderError> {
    let parsed = Url::parse(ws_url).map_err(|err| {
        RenderError::new(RenderErrorKind::BrowserUnreachable, op)
            .with_detail(format!("invalid debugger url {ws_url}: {err}"))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        RenderError::new(RenderErrorKind::BrowserUnreachable, op)
            .with_detail(format!("debugger url {ws_url} has no host"))
    })?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
