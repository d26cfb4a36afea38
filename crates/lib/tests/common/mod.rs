//! In-process mock gateway for integration tests: an axum WebSocket endpoint
//! that speaks the req/res/event framing on a free port.
//!
//! Methods understood after `connect`:
//! - `echo`: replies with the params
//! - `delay` `{ms, value}`: replies `{value}` after `ms`
//! - `never`: never replies
//! - `fail`: replies `ok: false`
//! - `emit` `{events: [..]}`: pushes each entry as an event frame, then replies
//! - `drop`: closes the socket without replying

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use perch::gateway::{ClientOptions, Credential, GatewayClient};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TOKEN: &str = "test-token";

#[derive(Clone)]
pub struct MockOptions {
    /// Token the handshake must carry.
    pub token: String,
    /// Sleep before answering `connect`.
    pub hello_delay: Duration,
    pub tick_interval_ms: Option<u64>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            token: TOKEN.to_string(),
            hello_delay: Duration::ZERO,
            tick_interval_ms: None,
        }
    }
}

#[derive(Clone)]
struct MockState {
    options: MockOptions,
    connections: Arc<AtomicUsize>,
    connect_params: Arc<Mutex<Vec<Value>>>,
}

pub struct MockGateway {
    pub url: String,
    state: MockState,
    handle: tokio::task::JoinHandle<()>,
}

impl MockGateway {
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock gateway");
        let addr = listener.local_addr().expect("local_addr");
        let state = MockState {
            options,
            connections: Arc::new(AtomicUsize::new(0)),
            connect_params: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(state.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("ws://{}", addr),
            state,
            handle,
        }
    }

    /// Sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Params of every `connect` request received, oldest first.
    pub fn connect_params(&self) -> Vec<Value> {
        self.state.connect_params.lock().expect("lock").clone()
    }

    /// Client options pointing at this mock with a short reconnect floor.
    pub fn options(&self) -> ClientOptions {
        let mut options = ClientOptions::new(self.url.clone(), Credential::Token(TOKEN.to_string()));
        options.handshake_timeout = Duration::from_secs(2);
        options.request_timeout = Duration::from_secs(2);
        options.reconnect_floor = Duration::from_millis(50);
        options.reconnect_ceiling = Duration::from_millis(200);
        options
    }

    pub fn client(&self) -> GatewayClient {
        GatewayClient::new(self.options())
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockState>) -> impl IntoResponse {
    state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

fn res_ok(id: &str, payload: Value) -> Message {
    Message::Text(json!({ "type": "res", "id": id, "ok": true, "payload": payload }).to_string())
}

fn res_err(id: &str, code: &str, message: &str, details: Value) -> Message {
    Message::Text(
        json!({
            "type": "res", "id": id, "ok": false,
            "error": { "code": code, "message": message, "details": details }
        })
        .to_string(),
    )
}

async fn serve_socket(socket: WebSocket, state: MockState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut authed = false;
    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if frame["type"] != "req" {
            continue;
        }
        let id = frame["id"].as_str().unwrap_or_default().to_string();
        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let params = frame["params"].clone();

        if !authed {
            if method != "connect" {
                let _ = tx.send(res_err(&id, "NOT_CONNECTED", "connect first", Value::Null));
                break;
            }
            state.connect_params.lock().expect("lock").push(params.clone());
            if params["auth"]["token"].as_str() != Some(state.options.token.as_str()) {
                let _ = tx.send(res_err(&id, "UNAUTHORIZED", "bad token", Value::Null));
                break;
            }
            tokio::time::sleep(state.options.hello_delay).await;
            let mut hello = json!({ "type": "hello-ok", "protocol": 3 });
            if let Some(tick) = state.options.tick_interval_ms {
                hello["policy"] = json!({ "tickIntervalMs": tick });
            }
            let _ = tx.send(res_ok(&id, hello));
            authed = true;
            continue;
        }

        match method.as_str() {
            "echo" => {
                let _ = tx.send(res_ok(&id, params));
            }
            "delay" => {
                let ms = params["ms"].as_u64().unwrap_or(0);
                let value = params["value"].clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = tx.send(res_ok(&id, json!({ "value": value })));
                });
            }
            "never" => {}
            "fail" => {
                let _ = tx.send(res_err(&id, "BAD_REQUEST", "nope", json!({ "field": "x" })));
            }
            "emit" => {
                if let Some(events) = params["events"].as_array() {
                    for event in events {
                        let mut frame = event.clone();
                        frame["type"] = json!("event");
                        let _ = tx.send(Message::Text(frame.to_string()));
                    }
                }
                let _ = tx.send(res_ok(&id, json!({})));
            }
            "drop" => break,
            other => {
                let _ = tx.send(res_err(&id, "UNKNOWN_METHOD", other, Value::Null));
            }
        }
    }
    drop(tx);
    // Give queued replies (e.g. a rejection) a moment to flush, then drop the socket.
    let abort = writer.abort_handle();
    let _ = tokio::time::timeout(Duration::from_millis(100), writer).await;
    abort.abort();
}

/// Poll `f` every 10ms until it returns true or `within` elapses.
pub async fn eventually(within: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
