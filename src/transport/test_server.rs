//! In-process envelope endpoint with a toy STOMP broker behind it.
//!
//! Serves `websocket`, `xhr`, `xhr_streaming` and `xhr_send` under `/stomp`,
//! plus `/info` (also under `/stomp`), `/info/settings` and an OAuth token
//! endpoint, on `127.0.0.1:0`.
//!
//! Broker replies:
//! - CONNECT → CONNECTED (after `refuse_logins` "Access refused" errors)
//! - SUBSCRIBE → nothing, or a close frame if `close_after_subscribe` is set
//! - SEND → MESSAGE on `/exchange/<channel>.messages` with the same body and
//!   `action` rewritten to `ack`
//!
//! XHR sessions open once. Later streaming requests get the prelude only.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use frames::stomp;
use serde_json::{Value, json};
use tokio::sync::Notify;

/// How long an idle poll is held before answering with a heartbeat.
const POLL_WAIT: Duration = Duration::from_millis(100);

pub(crate) const GOOD_PASSWORD: &str = "secret";

#[derive(Clone, Debug, Default)]
pub(crate) struct Behavior {
    pub refuse_logins: usize,
    pub close_after_subscribe: Option<(u16, String)>,
    /// Answer with an empty body once this many polls followed the open.
    pub end_after_polls: Option<usize>,
    /// Never answer polls that follow the open.
    pub hold_polls: bool,
    /// End each streaming response after this many batches.
    pub stream_batches: Option<usize>,
}

pub(crate) struct TestServer {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
}

impl TestServer {
    pub(crate) async fn spawn(behavior: Behavior) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(Shared {
            addr,
            behavior,
            refused: AtomicUsize::new(0),
            stream_opens: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/info", get(info))
            .route("/stomp/info", get(info))
            .route("/stomp/{server}/{session}/websocket", get(websocket))
            .route("/stomp/{server}/{session}/xhr", post(xhr))
            .route("/stomp/{server}/{session}/xhr_streaming", post(xhr_streaming))
            .route("/stomp/{server}/{session}/xhr_send", post(xhr_send))
            .route("/oauth/token", post(token))
            .route("/info/settings", get(settings))
            .with_state(Arc::clone(&shared));

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, shared }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// STOMP frames received from clients, in arrival order.
    pub(crate) fn received(&self) -> Vec<String> {
        self.shared.received.lock().expect("received lock").clone()
    }

    /// Streaming receive requests served so far.
    pub(crate) fn stream_opens(&self) -> usize {
        self.shared.stream_opens.load(Ordering::SeqCst)
    }

    /// Commands of [`received`](Self::received).
    pub(crate) fn commands(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|raw| raw.split('\n').next().map(str::to_owned))
            .collect()
    }
}

struct Shared {
    addr: SocketAddr,
    behavior: Behavior,
    refused: AtomicUsize,
    stream_opens: AtomicUsize,
    received: Mutex<Vec<String>>,
    sessions: Mutex<HashMap<String, Arc<XhrSession>>>,
}

impl Shared {
    fn session(&self, id: &str) -> Arc<XhrSession> {
        let mut sessions = self.sessions.lock().expect("sessions lock");
        Arc::clone(sessions.entry(id.to_owned()).or_default())
    }

    /// Broker logic: one client STOMP frame in, envelope chunks out.
    fn respond(&self, frame: &str) -> Vec<String> {
        self.received
            .lock()
            .expect("received lock")
            .push(frame.to_owned());
        let Ok(parsed) = stomp::decode(frame) else {
            return Vec::new();
        };

        match parsed.command.as_str() {
            "CONNECT" => {
                if self.refused.fetch_add(1, Ordering::SeqCst) < self.behavior.refuse_logins {
                    vec![array("ERROR\nmessage:Bad CONNECT\n\nAccess refused for user\n\0")]
                } else {
                    vec![array("CONNECTED\nversion:1.1\n\n\0")]
                }
            }
            "SUBSCRIBE" => match &self.behavior.close_after_subscribe {
                Some((code, reason)) => vec![format!("c[{code},{}]", json!(reason))],
                None => Vec::new(),
            },
            "SEND" => {
                let channel = parsed
                    .header("destination")
                    .and_then(|d| d.rsplit('/').next())
                    .and_then(|last| last.strip_suffix(".messages"))
                    .unwrap_or_default()
                    .to_owned();
                let mut body: Value = serde_json::from_str(&parsed.body).unwrap_or_default();
                body["action"] = json!("ack");
                vec![array(&format!(
                    "MESSAGE\ndestination:/exchange/{channel}.messages\n\n{body}\0"
                ))]
            }
            _ => Vec::new(),
        }
    }
}

fn array(frame: &str) -> String {
    format!("a{}", json!([frame]))
}

#[derive(Default)]
struct XhrSession {
    opened: AtomicBool,
    polls: AtomicUsize,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl XhrSession {
    fn push(&self, chunks: Vec<String>) {
        if chunks.is_empty() {
            return;
        }
        self.queue.lock().expect("queue lock").extend(chunks);
        self.notify.notify_one();
    }

    async fn next_batch(&self) -> Vec<String> {
        loop {
            let batch: Vec<String> = self.queue.lock().expect("queue lock").drain(..).collect();
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn info(State(shared): State<Arc<Shared>>) -> Json<Value> {
    Json(json!({
        "websocket": true,
        "max.oauth_server": format!("http://{}/oauth", shared.addr),
    }))
}

async fn websocket(State(shared): State<Arc<Shared>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, shared))
}

async fn run_socket(mut socket: WebSocket, shared: Arc<Shared>) {
    if socket.send(Message::Text("o".into())).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frames: Vec<String> = serde_json::from_str(text.as_str()).unwrap_or_default();
        for frame in frames {
            for chunk in shared.respond(&frame) {
                let closing = chunk.starts_with('c');
                if socket.send(Message::Text(chunk.into())).await.is_err() || closing {
                    return;
                }
            }
        }
    }
}

async fn xhr(
    State(shared): State<Arc<Shared>>,
    Path((_server, session)): Path<(String, String)>,
) -> String {
    let session = shared.session(&session);
    if !session.opened.swap(true, Ordering::SeqCst) {
        return "o\n".to_owned();
    }
    let behavior = &shared.behavior;
    if behavior.hold_polls {
        std::future::pending::<()>().await;
    }
    let polls = session.polls.fetch_add(1, Ordering::SeqCst);
    if behavior.end_after_polls.is_some_and(|limit| polls >= limit) {
        return String::new();
    }
    match tokio::time::timeout(POLL_WAIT, session.next_batch()).await {
        Ok(batch) => format!("{}\n", batch.join("\n")),
        Err(_) => "h\n".to_owned(),
    }
}

struct StreamState {
    prelude: Option<String>,
    done: bool,
    batches_left: Option<usize>,
    session: Arc<XhrSession>,
}

async fn xhr_streaming(
    State(shared): State<Arc<Shared>>,
    Path((_server, session)): Path<(String, String)>,
) -> Response {
    let session = shared.session(&session);
    shared.stream_opens.fetch_add(1, Ordering::SeqCst);
    let open = if session.opened.swap(true, Ordering::SeqCst) {
        ""
    } else {
        "o\n"
    };
    let state = StreamState {
        prelude: Some(format!("{}\n{open}", "h".repeat(2048))),
        done: false,
        batches_left: shared.behavior.stream_batches,
        session,
    };
    let stream = futures_util::stream::unfold(state, |mut state| async move {
        if let Some(prelude) = state.prelude.take() {
            return Some((Ok::<_, Infallible>(Bytes::from(prelude)), state));
        }
        if state.done || state.batches_left == Some(0) {
            return None;
        }
        let batch = state.session.next_batch().await;
        state.done = batch.iter().any(|chunk| chunk.starts_with('c'));
        state.batches_left = state.batches_left.map(|left| left - 1);
        Some((Ok(Bytes::from(format!("{}\n", batch.join("\n")))), state))
    });
    Body::from_stream(stream).into_response()
}

async fn xhr_send(
    State(shared): State<Arc<Shared>>,
    Path((_server, session)): Path<(String, String)>,
    body: String,
) -> StatusCode {
    let Ok(frames) = serde_json::from_str::<Vec<String>>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    let session = shared.session(&session);
    for frame in frames {
        session.push(shared.respond(&frame));
    }
    StatusCode::NO_CONTENT
}

async fn token(Form(form): Form<HashMap<String, String>>) -> Response {
    let field = |key: &str| form.get(key).map_or("", String::as_str);
    if field("grant_type") != "password" || field("client_id") != "MAX" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_request", "error_description": "bad client" })),
        )
            .into_response();
    }
    if field("password") != GOOD_PASSWORD {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_grant", "error_description": "Bad credentials" })),
        )
            .into_response();
    }
    Json(json!({ "access_token": format!("token-{}", field("username")) })).into_response()
}

async fn settings(headers: axum::http::HeaderMap) -> Response {
    let token = headers
        .get("X-Oauth-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token.is_empty() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "max": { "domain": "demo" }, "token": token })).into_response()
}
