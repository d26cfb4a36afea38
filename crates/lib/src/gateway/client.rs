//! Gateway client: one persistent, authenticated WebSocket to the gateway,
//! multiplexing RPCs and pushed events.
//!
//! The connection moves through `Disconnected -> Connecting -> Connected`, back to
//! `Disconnected` when the socket closes (pending calls are rejected and a
//! reconnect is scheduled with exponential backoff), and ends in `Destroyed`.
//! Concurrent `ensure_connected` calls share a single in-flight connect attempt.

use crate::config::{self, Config};
use super::error::GatewayError;
use super::lock;
use super::pending::PendingCalls;
use super::protocol::{
    ConnectAuth, ConnectClient, ConnectParams, EventFrame, Frame, HelloOk, RequestFrame,
};
use super::router::{EventRouter, Subscription};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectAttempt = Shared<BoxFuture<'static, Result<(), GatewayError>>>;

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";
pub const PROTOCOL_VERSION: u32 = 3;

/// Upstream credential. Exactly one is sent with the handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Token(String),
    Password(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Token(_) => f.write_str("Token(..)"),
            Credential::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Validated settings for a `GatewayClient`. Build with `ClientOptions::new` or
/// `ClientOptions::from_config`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub credential: Credential,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_floor: Duration,
    pub reconnect_ceiling: Duration,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ConnectClient,
    pub role: String,
    pub scopes: Vec<String>,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>, credential: Credential) -> Self {
        Self {
            url: url.into(),
            credential,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reconnect_floor: Duration::from_secs(1),
            reconnect_ceiling: Duration::from_secs(30),
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ConnectClient {
                id: "perch".to_string(),
                display_name: Some("Perch".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: "webchat".to_string(),
                instance_id: Some(uuid::Uuid::new_v4().to_string()),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
        }
    }

    /// Build from loaded config plus environment. Fails when no credential is
    /// configured or the timing settings are inconsistent.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let credential = config::resolve_gateway_credential(config).ok_or_else(|| {
            GatewayError::Configuration(format!(
                "no gateway credential: set {} or {} (or gateway.auth.token / gateway.auth.password)",
                config::ENV_GATEWAY_TOKEN,
                config::ENV_GATEWAY_PASSWORD
            ))
        })?;
        let g = &config.gateway;
        if g.reconnect_floor_ms == 0 || g.reconnect_ceiling_ms < g.reconnect_floor_ms {
            return Err(GatewayError::Configuration(format!(
                "invalid reconnect delays: floor {}ms, ceiling {}ms",
                g.reconnect_floor_ms, g.reconnect_ceiling_ms
            )));
        }
        if g.handshake_timeout_ms == 0 || g.request_timeout_ms == 0 {
            return Err(GatewayError::Configuration(
                "handshake and request timeouts must be positive".to_string(),
            ));
        }
        if g.min_protocol > g.max_protocol {
            return Err(GatewayError::Configuration(format!(
                "minProtocol {} exceeds maxProtocol {}",
                g.min_protocol, g.max_protocol
            )));
        }

        let mut options = Self::new(config::resolve_gateway_url(config), credential);
        options.handshake_timeout = Duration::from_millis(g.handshake_timeout_ms);
        options.request_timeout = Duration::from_millis(g.request_timeout_ms);
        options.reconnect_floor = Duration::from_millis(g.reconnect_floor_ms);
        options.reconnect_ceiling = Duration::from_millis(g.reconnect_ceiling_ms);
        options.min_protocol = g.min_protocol;
        options.max_protocol = g.max_protocol;
        options.role = g.role.clone();
        options.scopes = g.scopes.clone();
        if let Some(id) = &g.client.id {
            options.client.id = id.clone();
        }
        if let Some(name) = &g.client.display_name {
            options.client.display_name = Some(name.clone());
        }
        if let Some(mode) = &g.client.mode {
            options.client.mode = mode.clone();
        }
        if let Some(instance_id) = &g.client.instance_id {
            options.client.instance_id = Some(instance_id.clone());
        }
        Ok(options)
    }

    fn connect_params(&self) -> ConnectParams {
        let auth = match &self.credential {
            Credential::Token(t) => ConnectAuth {
                token: Some(t.clone()),
                password: None,
            },
            Credential::Password(p) => ConnectAuth {
                token: None,
                password: Some(p.clone()),
            },
        };
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            auth,
            role: self.role.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

/// Live socket. Dropping it closes the socket and stops its reader.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    _shutdown: oneshot::Sender<()>,
}

enum ConnState {
    Disconnected,
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
        abort: AbortHandle,
    },
    Connected {
        generation: u64,
        conn: Connection,
    },
    Destroyed,
}

impl ConnState {
    fn generation(&self) -> Option<u64> {
        match self {
            ConnState::Connecting { generation, .. } | ConnState::Connected { generation, .. } => {
                Some(*generation)
            }
            _ => None,
        }
    }
}

struct Core {
    state: ConnState,
    next_generation: u64,
    reconnect_delay: Duration,
    reconnect_timer: Option<JoinHandle<()>>,
    hello: Option<HelloOk>,
}

struct Inner {
    options: ClientOptions,
    shared: Mutex<Core>,
    pending: PendingCalls,
    router: EventRouter,
}

/// Handle to the gateway connection. Clones share one connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    /// Create a client. Nothing connects until the first `ensure_connected` or `rpc`.
    pub fn new(options: ClientOptions) -> Self {
        let floor = options.reconnect_floor;
        Self {
            inner: Arc::new(Inner {
                options,
                shared: Mutex::new(Core {
                    state: ConnState::Disconnected,
                    next_generation: 0,
                    reconnect_delay: floor,
                    reconnect_timer: None,
                    hello: None,
                }),
                pending: PendingCalls::new(),
                router: EventRouter::new(),
            }),
        }
    }

    /// Connect unless already connected. Callers arriving while a connect is in
    /// flight wait on that same attempt.
    pub async fn ensure_connected(&self) -> Result<(), GatewayError> {
        let attempt = {
            let mut g = lock(&self.inner.shared);
            match &g.state {
                ConnState::Connected { .. } => return Ok(()),
                ConnState::Destroyed => return Err(GatewayError::Destroyed),
                ConnState::Connecting { attempt, .. } => attempt.clone(),
                ConnState::Disconnected => {
                    let generation = g.next_generation;
                    g.next_generation += 1;
                    let task = tokio::spawn(run_connect(self.inner.clone(), generation));
                    let abort = task.abort_handle();
                    let attempt = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) if e.is_cancelled() => Err(GatewayError::Destroyed),
                            Err(e) => Err(GatewayError::Connection(format!(
                                "connect task failed: {}",
                                e
                            ))),
                        }
                    }
                    .boxed()
                    .shared();
                    g.state = ConnState::Connecting {
                        generation,
                        attempt: attempt.clone(),
                        abort,
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Send `method` with `params` and wait for the matching response.
    /// `timeout` defaults to the configured request timeout.
    pub async fn rpc(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        self.ensure_connected().await?;
        let (generation, outbound) = {
            let g = lock(&self.inner.shared);
            match &g.state {
                ConnState::Connected { generation, conn } => (*generation, conn.outbound.clone()),
                ConnState::Destroyed => return Err(GatewayError::Destroyed),
                _ => return Err(GatewayError::Closed),
            }
        };
        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        self.inner
            .call(generation, &outbound, method, params, timeout)
            .await
    }

    /// Close for good: the socket, the reconnect timer, every pending call, every listener.
    pub fn destroy(&self) {
        let (previous, timer) = {
            let mut g = lock(&self.inner.shared);
            if matches!(g.state, ConnState::Destroyed) {
                return;
            }
            g.hello = None;
            (
                std::mem::replace(&mut g.state, ConnState::Destroyed),
                g.reconnect_timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let ConnState::Connecting { abort, .. } = &previous {
            abort.abort();
        }
        drop(previous);
        let rejected = self.inner.pending.reject_all(GatewayError::Closed);
        self.inner.router.clear();
        log::info!(
            "gateway client destroyed ({} pending call(s) rejected)",
            rejected
        );
    }

    pub fn subscribe<F>(&self, key: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(key, listener)
    }

    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_all(listener)
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn status(&self) -> ConnectionStatus {
        match lock(&self.inner.shared).state {
            ConnState::Disconnected => ConnectionStatus::Disconnected,
            ConnState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnState::Connected { .. } => ConnectionStatus::Connected,
            ConnState::Destroyed => ConnectionStatus::Destroyed,
        }
    }

    /// Payload of the last successful handshake.
    pub fn hello(&self) -> Option<HelloOk> {
        lock(&self.inner.shared).hello.clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Inner {
    /// Register, send, and await one request on the connection `generation`.
    async fn call(
        &self,
        generation: u64,
        outbound: &mpsc::UnboundedSender<Message>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let request = RequestFrame::new(method, params);
        let call = self.pending.register(&request.id)?;
        // A close that raced the registration has already drained the map.
        if lock(&self.shared).state.generation() != Some(generation) {
            return Err(GatewayError::Closed);
        }
        let text = Frame::Request(request)
            .encode()
            .map_err(|e| GatewayError::Encode(e.to_string()))?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| GatewayError::Closed)?;
        call.wait(method, timeout).await
    }

    fn handle_frame(&self, text: &str) {
        match Frame::decode(text) {
            Ok(Frame::Response(res)) => {
                let id = res.id.clone();
                if !self.pending.resolve(res) {
                    log::debug!("ignoring response for unknown request {}", id);
                }
            }
            Ok(Frame::Event(event)) => self.router.dispatch(&event),
            Ok(Frame::Request(req)) => {
                log::debug!("ignoring {} request sent by gateway", req.method);
            }
            Err(e) => log::debug!("discarding frame: {}", e),
        }
    }

    /// Tear down connection `generation` if it is still current: reject pending
    /// calls and schedule a reconnect. Stale generations are ignored.
    fn on_disconnect(self: &Arc<Self>, generation: u64, reason: &str) {
        let previous = {
            let mut g = lock(&self.shared);
            if g.state.generation() != Some(generation) {
                return;
            }
            g.hello = None;
            std::mem::replace(&mut g.state, ConnState::Disconnected)
        };
        drop(previous);
        log::warn!("gateway connection lost: {}", reason);
        let rejected = self.pending.reject_all(GatewayError::Closed);
        if rejected > 0 {
            log::debug!("rejected {} pending call(s)", rejected);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut g = lock(&self.shared);
        if matches!(g.state, ConnState::Destroyed) {
            return;
        }
        if g
            .reconnect_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
        {
            return;
        }
        let delay = g.reconnect_delay;
        g.reconnect_delay = (delay * 2).min(self.options.reconnect_ceiling);
        log::info!("reconnecting to gateway in {}ms", delay.as_millis());
        let weak = Arc::downgrade(self);
        g.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            lock(&inner.shared).reconnect_timer = None;
            let client = GatewayClient { inner };
            if let Err(e) = client.ensure_connected().await {
                log::debug!("reconnect attempt failed: {}", e);
            }
        }));
    }
}

/// Body of a connect attempt; runs as its own task so cancelled waiters don't abandon it.
async fn run_connect(inner: Arc<Inner>, generation: u64) -> Result<(), GatewayError> {
    match handshake(&inner, generation).await {
        Ok((conn, hello)) => {
            let mut g = lock(&inner.shared);
            if matches!(g.state, ConnState::Destroyed) {
                return Err(GatewayError::Destroyed);
            }
            let still_current = matches!(g.state, ConnState::Connecting { .. })
                && g.state.generation() == Some(generation);
            if !still_current {
                return Err(GatewayError::Connection(
                    "connection closed during handshake".to_string(),
                ));
            }
            log::info!(
                "connected to gateway {} (protocol {})",
                inner.options.url,
                hello.protocol
            );
            g.state = ConnState::Connected { generation, conn };
            g.reconnect_delay = inner.options.reconnect_floor;
            g.hello = Some(hello);
            Ok(())
        }
        Err(e) => {
            log::warn!("gateway connect to {} failed: {}", inner.options.url, e);
            inner.on_disconnect(generation, &e.to_string());
            Err(e)
        }
    }
}

/// Open the socket, start its reader and writer, and perform the `connect` exchange.
async fn handshake(
    inner: &Arc<Inner>,
    generation: u64,
) -> Result<(Connection, HelloOk), GatewayError> {
    let options = &inner.options;
    let ws = match tokio::time::timeout(
        options.handshake_timeout,
        tokio_tungstenite::connect_async(options.url.as_str()),
    )
    .await
    {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            return Err(GatewayError::Connection(format!(
                "opening {}: {}",
                options.url, e
            )))
        }
        Err(_) => {
            return Err(GatewayError::Connection(format!(
                "opening {} timed out",
                options.url
            )))
        }
    };

    let (write, read) = ws.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (watchdog_tx, watchdog_rx) = watch::channel(None);
    inner.router.reset_seq();
    tokio::spawn(write_loop(write, outbound_rx));
    tokio::spawn(read_loop(
        Arc::downgrade(inner),
        generation,
        read,
        shutdown_rx,
        watchdog_rx,
    ));
    let conn = Connection {
        outbound,
        _shutdown: shutdown_tx,
    };

    let params = serde_json::to_value(options.connect_params())
        .map_err(|e| GatewayError::Encode(e.to_string()))?;
    let payload = inner
        .call(
            generation,
            &conn.outbound,
            "connect",
            params,
            options.handshake_timeout,
        )
        .await
        .map_err(|e| match e {
            GatewayError::Rpc { code, message, .. } => {
                GatewayError::Connection(format!("handshake rejected ({}): {}", code, message))
            }
            GatewayError::RpcTimeout { timeout, .. } => GatewayError::Connection(format!(
                "handshake timed out after {}ms",
                timeout.as_millis()
            )),
            GatewayError::Closed => {
                GatewayError::Connection("socket closed during handshake".to_string())
            }
            other => other,
        })?;

    let hello: HelloOk = serde_json::from_value(payload).unwrap_or_default();
    if let Some(tick) = hello
        .policy
        .as_ref()
        .and_then(|p| p.tick_interval_ms)
        .filter(|tick| *tick > 0)
    {
        watchdog_tx.send_replace(Some(Duration::from_millis(tick.saturating_mul(2))));
    }
    Ok((conn, hello))
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = write.send(msg).await {
            log::warn!("gateway write failed: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}

/// Decode and dispatch inbound frames until the socket closes, the liveness
/// watchdog fires, or the connection is dropped locally.
async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut read: SplitStream<WsStream>,
    mut shutdown: oneshot::Receiver<()>,
    mut watchdog: watch::Receiver<Option<Duration>>,
) {
    let reason = loop {
        let limit = *watchdog.borrow_and_update();
        let idle = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = &mut shutdown => return,
            Ok(()) = watchdog.changed() => continue,
            _ = idle => {
                break format!("no frames for {}ms", limit.map_or(0, |d| d.as_millis()));
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Some(inner) = inner.upgrade() else { return };
                    let handled = catch_unwind(AssertUnwindSafe(|| inner.handle_frame(&text)));
                    if handled.is_err() {
                        log::warn!("panic while handling gateway frame, dropping connection");
                        break "frame handler panicked".to_string();
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => format!("closed by gateway ({}): {}", u16::from(f.code), f.reason),
                        None => "closed by gateway".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("gateway socket error: {}", e);
                    break e.to_string();
                }
                None => break "socket ended".to_string(),
            }
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.on_disconnect(generation, &reason);
    }
}
