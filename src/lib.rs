//! presswork: a headless-browser PDF rendering engine.
//!
//! The engine drives an already-running Chromium over the DevTools
//! Protocol: it discovers the debugger endpoint, opens a fresh isolated
//! browser context and target per render, waits until the page is rendered
//! enough (DOM content + load + network-idle lifecycle + loading finished,
//! plus an optional fixed delay and an optional `window.status` sentinel),
//! then streams `Page.printToPDF` output to a destination file. Crashes,
//! uncaught exceptions and failing subresources preempt the wait, and a
//! permit gate caps how many renders may share the browser at once.
//!
//! ```no_run
//! use presswork::{EngineConfig, RenderEngine, RenderRequest};
//!
//! # async fn example() -> Result<(), presswork::RenderError> {
//! let engine = RenderEngine::new(EngineConfig::default());
//! let request = RenderRequest {
//!     url: "https://example.com".to_string(),
//!     ..RenderRequest::default()
//! };
//! engine.render(&request, "/tmp/example.pdf".as_ref()).await?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod config;
mod error;
mod ledger;
mod print;
mod ready;
mod render;
mod session;
mod target;
mod transport;
mod watch;

pub use config::{EngineConfig, RenderRequest};
pub use error::{RenderError, RenderErrorKind};
pub use render::RenderEngine;
