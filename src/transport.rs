//! WebSocket JSON-RPC client for the Chrome DevTools Protocol.
//!
//! One [`Conn`] wraps one devtools WebSocket. A background loop owns the
//! socket and multiplexes two flows: request/response pairs matched by call
//! id, and event frames fanned out to per-method subscriptions. The inbound
//! message cap is configurable because `Page.printToPDF` replies can exceed
//! any fixed default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{RenderError, RenderErrorKind};

/// Grace period for closing a connection; a wedged socket must not hang
/// teardown past it.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<Result<Value, RenderError>>;
type Routes = Arc<DashMap<String, Route>>;

struct Route {
    seq: u64,
    tx: mpsc::UnboundedSender<Value>,
}

enum Command {
    Call {
        method: String,
        params: Value,
        responder: Responder,
    },
    Shutdown,
}

/// Handle to one devtools WebSocket connection.
pub(crate) struct Conn {
    command_tx: mpsc::Sender<Command>,
    routes: Routes,
    route_seq: AtomicU64,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Conn {
    /// Dials `ws_url` with `max_inbound` as the message/frame cap. A dial
    /// failure means the browser endpoint is not reachable.
    pub(crate) async fn connect(
        ws_url: &str,
        max_inbound: usize,
        deadline: Instant,
    ) -> Result<Arc<Self>, RenderError> {
        const OP: &str = "transport.connect";

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_inbound);
        config.max_frame_size = Some(max_inbound);

        let dial = connect_async_with_config(ws_url, Some(config), false);
        let (socket, _response) = match timeout_at(deadline, dial).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => {
                return Err(
                    RenderError::new(RenderErrorKind::BrowserUnreachable, OP)
                        .with_detail(format!("dial {ws_url}: {err}")),
                )
            }
            Err(_) => {
                return Err(RenderError::new(RenderErrorKind::DeadlineExceeded, OP)
                    .with_detail(format!("dial {ws_url} timed out")))
            }
        };
        debug!(target: "transport", url = %ws_url, "devtools connection established");

        let (command_tx, command_rx) = mpsc::channel(64);
        let routes: Routes = Arc::new(DashMap::new());
        let loop_routes = Arc::clone(&routes);
        let loop_task = tokio::spawn(async move {
            run_loop(socket, command_rx, loop_routes, max_inbound).await;
        });

        Ok(Arc::new(Self {
            command_tx,
            routes,
            route_seq: AtomicU64::new(0),
            loop_task: Mutex::new(Some(loop_task)),
        }))
    }

    /// Issues one CDP command and waits for its reply until `deadline`.
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Value,
        deadline: Instant,
    ) -> Result<Value, RenderError> {
        const OP: &str = "transport.call";

        let (responder, reply_rx) = oneshot::channel();
        let command = Command::Call {
            method: method.to_string(),
            params,
            responder,
        };
        if self.command_tx.send(command).await.is_err() {
            return Err(RenderError::stream_closing(OP));
        }

        match timeout_at(deadline, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RenderError::stream_closing(OP)),
            Err(_) => Err(RenderError::new(RenderErrorKind::DeadlineExceeded, OP)
                .with_detail(format!("command {method} timed out"))),
        }
    }

    /// Opens the event subscription for one CDP method. One consumer per
    /// method; a second subscription to the same method displaces the first.
    pub(crate) fn subscribe(&self, method: &'static str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let seq = self.route_seq.fetch_add(1, Ordering::Relaxed);
        self.routes.insert(method.to_string(), Route { seq, tx });
        EventStream {
            method,
            rx,
            seq,
            routes: Arc::clone(&self.routes),
        }
    }

    /// Closes the named subscription; its consumer observes the
    /// stream-closing sentinel on the next receive.
    pub(crate) fn unsubscribe(&self, method: &str) {
        self.routes.remove(method);
    }

    /// Closes the socket and waits for the background loop to finish, for
    /// at most the grace period. A loop stuck on a dead peer is aborted so
    /// teardown stays bounded.
    pub(crate) async fn close(&self) {
        let task = self.loop_task.lock().take();
        let Some(task) = task else { return };
        let abort = task.abort_handle();

        let shutdown = async {
            let _ = self.command_tx.send(Command::Shutdown).await;
            let _ = task.await;
        };
        if timeout(CLOSE_GRACE, shutdown).await.is_err() {
            warn!(target: "transport", "close timed out; aborting the connection loop");
            abort.abort();
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
    }
}

/// Named lazy sequence of events of one CDP method. Finite and not
/// restartable: once the route is closed the stream only reports the
/// stream-closing sentinel.
pub(crate) struct EventStream {
    method: &'static str,
    rx: mpsc::UnboundedReceiver<Value>,
    seq: u64,
    routes: Routes,
}

impl EventStream {
    pub(crate) fn method(&self) -> &'static str {
        self.method
    }

    pub(crate) async fn recv(&mut self) -> Result<Value, RenderError> {
        match self.rx.recv().await {
            Some(params) => Ok(params),
            None => Err(RenderError::stream_closing("transport.recv")),
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        // Remove only our own route; a successor subscription under the
        // same method must survive this drop.
        self.routes
            .remove_if(self.method, |_, route| route.seq == self.seq);
    }
}

/// Close handles for the subscriptions a readiness waiter must tear down
/// when it finishes, ending the sibling listener loops.
pub(crate) struct SubscriptionCloser {
    conn: Arc<Conn>,
    methods: Vec<&'static str>,
}

impl SubscriptionCloser {
    pub(crate) fn new(conn: Arc<Conn>, methods: Vec<&'static str>) -> Self {
        Self { conn, methods }
    }

    pub(crate) fn close_all(&self) {
        for method in &self.methods {
            self.conn.unsubscribe(method);
        }
    }
}

async fn run_loop(
    mut socket: Socket,
    mut command_rx: mpsc::Receiver<Command>,
    routes: Routes,
    max_inbound: usize,
) {
    let mut inflight: HashMap<u64, Responder> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(Command::Call { method, params, responder }) => {
                    let id = next_id;
                    next_id += 1;
                    let frame = json!({ "id": id, "method": method, "params": params });
                    match socket.send(Message::Text(frame.to_string())).await {
                        Ok(()) => {
                            inflight.insert(id, responder);
                        }
                        Err(err) => {
                            let _ = responder.send(Err(describe_ws_error(err, max_inbound)));
                            break;
                        }
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), &mut inflight, &routes),
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        dispatch(text, &mut inflight, &routes);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let failure = describe_ws_error(err, max_inbound);
                    warn!(target: "transport", error = %failure, "devtools socket failed");
                    for (_, responder) in inflight.drain() {
                        let _ = responder.send(Err(failure.clone()));
                    }
                    break;
                }
            },
        }
    }

    // Anything still pending observes the stream-closing sentinel; routed
    // subscribers end on their next receive.
    for (_, responder) in inflight.drain() {
        let _ = responder.send(Err(RenderError::stream_closing("transport.run_loop")));
    }
    routes.clear();
    debug!(target: "transport", "devtools connection closed");
}

fn dispatch(text: &str, inflight: &mut HashMap<u64, Responder>, routes: &Routes) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: "transport", %err, "undecodable devtools frame");
            return;
        }
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let Some(responder) = inflight.remove(&id) else {
            debug!(target: "transport", id, "reply without a pending call");
            return;
        };
        let reply = extract_payload(frame);
        let _ = responder.send(reply);
        return;
    }

    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));
        match routes.get(method) {
            Some(route) => {
                let _ = route.tx.send(params);
            }
            None => debug!(target: "transport", method, "unrouted devtools event"),
        }
    }
}

fn extract_payload(frame: Value) -> Result<Value, RenderError> {
    const OP: &str = "transport.dispatch";

    if let Some(error) = frame.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown devtools error");
        return Err(RenderError::new(RenderErrorKind::Unexpected, OP)
            .with_detail(format!("devtools error {code}: {message}")));
    }
    Ok(frame.get("result").cloned().unwrap_or_else(|| json!({})))
}

fn describe_ws_error(err: WsError, max_inbound: usize) -> RenderError {
    const OP: &str = "transport.socket";

    match err {
        WsError::Capacity(_) => RenderError::new(RenderErrorKind::Unexpected, OP).with_detail(
            format!("devtools message too large (cap {max_inbound} bytes)"),
        ),
        other => {
            RenderError::new(RenderErrorKind::Unexpected, OP).with_detail(other.to_string())
        }
    }
}
