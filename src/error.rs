//! Render error taxonomy and the benign-signal classifier.
//!
//! The devtools client surface reports a handful of conditions only as
//! message text (stream shutdown, oversized frames, page-range rejection),
//! so every substring match lives here behind named predicates instead of
//! being scattered through the listeners.

use std::fmt;

use thiserror::Error;

/// High-level failure categories surfaced by a render.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RenderErrorKind {
    #[error("no available connections")]
    NoCapacity,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("browser unreachable")]
    BrowserUnreachable,
    #[error("setup failed")]
    SetupFailed,
    #[error("target crashed")]
    TargetCrashed,
    #[error("runtime exception")]
    RuntimeException,
    #[error("resource error")]
    ResourceError,
    #[error("invalid page range")]
    InvalidPageRange,
    #[error("rpcc buffer too small")]
    BufferTooSmall,
    #[error("output failed")]
    OutputFailed,
    #[error("unexpected failure")]
    Unexpected,
}

/// Error surfaced to the caller of [`crate::render::RenderEngine::render`].
///
/// Carries the failure category, the operation that raised it, and an
/// optional cause text.
#[derive(Clone, Debug)]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub op: &'static str,
    pub detail: Option<String>,
}

impl RenderError {
    pub fn new(kind: RenderErrorKind, op: &'static str) -> Self {
        Self {
            kind,
            op,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Internal sentinel for a cancelled scope. Never escapes to the caller:
    /// listeners either swallow it or the true cause wins the batch.
    pub(crate) fn cancelled(op: &'static str) -> Self {
        Self::new(RenderErrorKind::Unexpected, op).with_detail("context cancelled")
    }

    /// Internal sentinel for an event stream torn down under the consumer.
    pub(crate) fn stream_closing(op: &'static str) -> Self {
        Self::new(RenderErrorKind::Unexpected, op).with_detail("the stream is closing")
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.kind)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for RenderError {}

/// Recognizes the cooperative-cancellation sentinel in any error text.
pub(crate) fn is_cancellation(err: &RenderError) -> bool {
    let text = err.to_string();
    text.contains("context cancelled") || text.contains("context canceled")
}

/// Recognizes an event stream (or the whole connection) shutting down.
pub(crate) fn is_stream_closing(err: &RenderError) -> bool {
    err.to_string().contains("stream is closing")
}

/// A benign interrupt ends a listener without failing the render.
pub(crate) fn is_benign_interrupt(err: &RenderError) -> bool {
    is_cancellation(err) || is_stream_closing(err)
}

/// `Page.printToPDF` rejected the page-range expression.
pub(crate) fn is_page_range_syntax(text: &str) -> bool {
    text.contains("Page range syntax error")
}

/// The devtools frame cap was exceeded while printing.
pub(crate) fn is_message_too_large(text: &str) -> bool {
    text.contains("message too large")
}
