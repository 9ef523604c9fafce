//! Engine configuration and per-render request options.

use std::collections::HashMap;

/// Configuration for a [`crate::render::RenderEngine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base URL of the browser's HTTP debugger.
    pub endpoint: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9222".to_string(),
        }
    }
}

/// Immutable input for one render. The destination path is passed
/// separately to [`crate::render::RenderEngine::render`].
#[derive(Clone, Debug)]
pub struct RenderRequest {
    /// Page to load and print.
    pub url: String,

    /// Seconds to wait for the page to become ready.
    pub wait_timeout: f64,
    /// Extra fixed delay, in seconds, applied after the ready gates fire.
    pub wait_delay: f64,
    /// When set, readiness additionally requires `window.status` to equal
    /// this sentinel.
    pub wait_js_render_status: Option<String>,

    /// Header template markup.
    pub header_html: String,
    /// Footer template markup.
    pub footer_html: String,

    /// Paper width in inches.
    pub paper_width: f64,
    /// Paper height in inches.
    pub paper_height: f64,
    pub margin_top: f64,
    pub margin_bottom: f64,
    pub margin_left: f64,
    pub margin_right: f64,
    pub landscape: bool,
    /// Page-range expression, e.g. `"1-3,5"`.
    pub page_ranges: Option<String>,
    pub scale: f64,

    /// Extra HTTP headers applied to every request the page makes.
    pub custom_http_headers: HashMap<String, String>,

    /// Inbound devtools message cap in bytes. Streamed replies larger than
    /// the cap fail with `BufferTooSmall`; the cap may be raised up to 100 MB.
    pub rpcc_buffer_size: usize,

    /// Admission cap across concurrent renders sharing one engine.
    pub max_connections: i64,
    /// Whether an over-cap render queues for a slot (until the deadline) or
    /// fails immediately with `NoCapacity`.
    pub wait_for_connection: bool,
}

const DEFAULT_HEADER_FOOTER_HTML: &str = "<html><head></head><body></body></html>";

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            wait_timeout: 10.0,
            wait_delay: 0.0,
            wait_js_render_status: None,
            header_html: DEFAULT_HEADER_FOOTER_HTML.to_string(),
            footer_html: DEFAULT_HEADER_FOOTER_HTML.to_string(),
            paper_width: 8.27,
            paper_height: 11.7,
            margin_top: 1.0,
            margin_bottom: 1.0,
            margin_left: 1.0,
            margin_right: 1.0,
            landscape: false,
            page_ranges: None,
            scale: 1.0,
            custom_http_headers: HashMap::new(),
            rpcc_buffer_size: 1 << 20,
            max_connections: 10,
            wait_for_connection: true,
        }
    }
}
