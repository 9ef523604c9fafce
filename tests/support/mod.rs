//! Scriptable fake devtools server.
//!
//! Serves `GET /json/version` over plain HTTP and speaks CDP JSON-RPC over
//! server-side websockets on the same port. Scenario behavior is injected
//! per test: events emitted after navigation, scripted `Runtime.evaluate`
//! results, print failures, and the PDF bytes served through `IO.read`.
//! Counters track opened-versus-closed contexts, targets and sockets so
//! tests can assert the engine released everything it acquired.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// One devtools event pushed to the client some time after `Page.navigate`.
#[derive(Clone)]
pub struct ScriptedEvent {
    pub after: Duration,
    pub method: &'static str,
    pub params: Value,
}

/// Per-scenario behavior of the fake browser.
#[derive(Clone)]
pub struct Behavior {
    /// Events emitted (in order, with delays) after a navigation.
    pub nav_events: Vec<ScriptedEvent>,
    /// Scripted `Runtime.evaluate` boolean results; an empty queue answers
    /// `true`.
    pub evaluate_results: Arc<Mutex<VecDeque<bool>>>,
    /// Error message `Page.printToPDF` fails with, if any.
    pub print_error: Option<String>,
    /// When set, `Page.printToPDF` never answers; a crash event is pushed
    /// instead.
    pub crash_on_print: bool,
    /// Bytes served through `IO.read`.
    pub pdf_bytes: Vec<u8>,
    /// Captures the headers map passed to `Network.setExtraHTTPHeaders`.
    pub seen_headers: Arc<Mutex<Option<Value>>>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            nav_events: Vec::new(),
            evaluate_results: Arc::new(Mutex::new(VecDeque::new())),
            print_error: None,
            crash_on_print: false,
            pdf_bytes: sample_pdf(10 * 1024),
            seen_headers: Arc::new(Mutex::new(None)),
        }
    }
}

impl Behavior {
    /// All four ready gates, each delayed by `after`.
    pub fn with_ready_gates(mut self, after: Duration) -> Self {
        self.nav_events.extend(ready_gates(after));
        self
    }

    pub fn with_event(mut self, event: ScriptedEvent) -> Self {
        self.nav_events.push(event);
        self
    }

    pub fn with_evaluate_results(self, results: impl IntoIterator<Item = bool>) -> Self {
        self.evaluate_results.lock().extend(results);
        self
    }

    pub fn print_failure(mut self, message: &str) -> Self {
        self.print_error = Some(message.to_string());
        self
    }
}

/// The four signals the readiness stage waits on.
pub fn ready_gates(after: Duration) -> Vec<ScriptedEvent> {
    vec![
        ScriptedEvent {
            after,
            method: "Page.domContentEventFired",
            params: json!({ "timestamp": 1.0 }),
        },
        ScriptedEvent {
            after: Duration::ZERO,
            method: "Page.loadEventFired",
            params: json!({ "timestamp": 2.0 }),
        },
        ScriptedEvent {
            after: Duration::ZERO,
            method: "Page.lifecycleEvent",
            params: json!({ "frameId": "frame-1", "loaderId": "loader-1", "name": "networkIdle", "timestamp": 3.0 }),
        },
        ScriptedEvent {
            after: Duration::ZERO,
            method: "Network.loadingFinished",
            params: json!({ "requestId": "1", "timestamp": 4.0, "encodedDataLength": 0 }),
        },
    ]
}

/// A payload that looks enough like a PDF: magic header plus filler.
pub fn sample_pdf(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.4\n".to_vec();
    while bytes.len() < len {
        bytes.push(b'a' + (bytes.len() % 23) as u8);
    }
    bytes.truncate(len);
    bytes
}

#[derive(Default)]
pub struct Counters {
    pub contexts: AtomicI64,
    pub targets: AtomicI64,
    pub sockets: AtomicI64,
}

impl Counters {
    pub fn all_released(&self) -> bool {
        self.contexts.load(Ordering::SeqCst) == 0
            && self.targets.load(Ordering::SeqCst) == 0
            && self.sockets.load(Ordering::SeqCst) == 0
    }
}

pub struct FakeChrome {
    addr: SocketAddr,
    pub counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl FakeChrome {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake devtools server");
        let addr = listener.local_addr().expect("local addr");
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let accept_counters = Arc::clone(&counters);
        let accept_shutdown = shutdown.clone();
        let ids = Arc::new(AtomicU64::new(0));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let behavior = behavior.clone();
                        let counters = Arc::clone(&accept_counters);
                        let ids = Arc::clone(&ids);
                        tokio::spawn(async move {
                            let _ = serve_conn(stream, addr, behavior, counters, ids).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            counters,
            shutdown,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Waits until every resource the engine acquired has been released
    /// server-side. The engine closes sockets slightly before the server
    /// loop observes the close frame.
    pub async fn assert_drained(&self) {
        for _ in 0..200 {
            if self.counters.all_released() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "fake browser resources leaked: contexts={} targets={} sockets={}",
            self.counters.contexts.load(Ordering::SeqCst),
            self.counters.targets.load(Ordering::SeqCst),
            self.counters.sockets.load(Ordering::SeqCst),
        );
    }
}

impl Drop for FakeChrome {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_conn(
    stream: TcpStream,
    addr: SocketAddr,
    behavior: Behavior,
    counters: Arc<Counters>,
    ids: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    // Sniff the request head to tell a plain HTTP probe from a websocket
    // upgrade.
    let mut head = vec![0u8; 4096];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut head).await?;
        if n == 0 {
            return Ok(());
        }
        if head[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == head.len() {
            seen = n;
            break;
        }
        if n == seen {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        seen = n;
    }

    let request = String::from_utf8_lossy(&head[..seen]).to_string();
    if request.to_ascii_lowercase().contains("upgrade: websocket") {
        serve_ws(stream, behavior, counters, ids).await
    } else {
        serve_version(stream, addr, request).await
    }
}

async fn serve_version(
    mut stream: TcpStream,
    addr: SocketAddr,
    request: String,
) -> anyhow::Result<()> {
    use tokio::io::AsyncReadExt;

    // Drain the request bytes we only peeked at.
    let mut sink = vec![0u8; request.len()];
    stream.read_exact(&mut sink).await?;

    let body = json!({
        "Browser": "FakeChrome/1.0",
        "Protocol-Version": "1.3",
        "webSocketDebuggerUrl": format!("ws://{addr}/devtools/browser/fake"),
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn serve_ws(
    stream: TcpStream,
    behavior: Behavior,
    counters: Arc<Counters>,
    ids: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    counters.sockets.fetch_add(1, Ordering::SeqCst);
    let result = drive_ws(stream, behavior, counters.clone(), ids).await;
    counters.sockets.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn drive_ws(
    stream: TcpStream,
    behavior: Behavior,
    counters: Arc<Counters>,
    ids: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let mut offsets: HashMap<String, usize> = HashMap::new();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else { break };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_rpc(&text, &out_tx, &behavior, &counters, &ids, &mut offsets);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = out_tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    Ok(())
}

fn handle_rpc(
    text: &str,
    out_tx: &mpsc::UnboundedSender<Message>,
    behavior: &Behavior,
    counters: &Arc<Counters>,
    ids: &Arc<AtomicU64>,
    offsets: &mut HashMap<String, usize>,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        return;
    };
    let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
    let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));

    let reply = |result: Value| {
        let _ = out_tx.send(Message::Text(
            json!({ "id": id, "result": result }).to_string(),
        ));
    };

    match method {
        "Target.createBrowserContext" => {
            counters.contexts.fetch_add(1, Ordering::SeqCst);
            let n = ids.fetch_add(1, Ordering::SeqCst);
            reply(json!({ "browserContextId": format!("ctx-{n}") }));
        }
        "Target.createTarget" => {
            counters.targets.fetch_add(1, Ordering::SeqCst);
            let n = ids.fetch_add(1, Ordering::SeqCst);
            reply(json!({ "targetId": format!("tgt-{n}") }));
        }
        "Target.closeTarget" => {
            counters.targets.fetch_sub(1, Ordering::SeqCst);
            reply(json!({ "success": true }));
        }
        "Target.disposeBrowserContext" => {
            counters.contexts.fetch_sub(1, Ordering::SeqCst);
            reply(json!({}));
        }
        "Network.setExtraHTTPHeaders" => {
            *behavior.seen_headers.lock() = params.get("headers").cloned();
            reply(json!({}));
        }
        "Page.navigate" => {
            reply(json!({ "frameId": "frame-1", "loaderId": "loader-1" }));
            let events = behavior.nav_events.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                for event in events {
                    if !event.after.is_zero() {
                        tokio::time::sleep(event.after).await;
                    }
                    let frame = json!({ "method": event.method, "params": event.params });
                    if out_tx.send(Message::Text(frame.to_string())).is_err() {
                        return;
                    }
                }
            });
        }
        "Runtime.evaluate" => {
            let value = behavior.evaluate_results.lock().pop_front().unwrap_or(true);
            reply(json!({ "result": { "type": "boolean", "value": value } }));
        }
        "Page.printToPDF" => {
            if behavior.crash_on_print {
                let crash = json!({ "method": "Inspector.targetCrashed", "params": {} });
                let _ = out_tx.send(Message::Text(crash.to_string()));
                return;
            }
            if let Some(message) = &behavior.print_error {
                let _ = out_tx.send(Message::Text(
                    json!({ "id": id, "error": { "code": -32000, "message": message } })
                        .to_string(),
                ));
                return;
            }
            reply(json!({ "stream": "stream-1" }));
        }
        "IO.read" => {
            let handle = params
                .get("handle")
                .and_then(Value::as_str)
                .unwrap_or("stream-1")
                .to_string();
            let offset = offsets.entry(handle).or_insert(0);
            let bytes = &behavior.pdf_bytes;
            if *offset >= bytes.len() {
                reply(json!({ "data": "", "base64Encoded": true, "eof": true }));
            } else {
                let end = (*offset + 3000).min(bytes.len());
                let chunk = &bytes[*offset..end];
                *offset = end;
                use base64::Engine as _;
                let data = base64::engine::general_purpose::STANDARD.encode(chunk);
                reply(json!({
                    "data": data,
                    "base64Encoded": true,
                    "eof": end >= bytes.len(),
                }));
            }
        }
        _ => reply(json!({})),
    }
}
