//! Browser-facing HTTP server: health, RPC passthrough, and per-conversation SSE streams.

use crate::config::Config;
use crate::gateway::{
    bridge_stream, BridgeMessage, ClientOptions, ConnectionStatus, GatewayClient, GatewayError,
    StreamBridge,
};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub client: GatewayClient,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerState {
    pub fn new(config: Config, client: GatewayClient) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            client,
            shutdown: Arc::new(shutdown),
        }
    }

    /// End every open stream and destroy the gateway client.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.client.destroy();
    }

    async fn shutting_down(mut rx: watch::Receiver<bool>) {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Body of POST /api/rpc.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBody {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub timeout_ms: Option<u64>,
}

/// Routes without binding; used by `run_server` and tests.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/api/rpc", post(rpc_http))
        .route("/api/sessions/:session_key/stream", get(stream_sse))
        .with_state(state)
}

/// Run the server on config.server.bind:config.server.port until Ctrl+C / SIGTERM.
/// Fails before binding when no gateway credential is configured.
pub async fn run_server(config: Config) -> Result<()> {
    let options = ClientOptions::from_config(&config)?;
    let client = GatewayClient::new(options);
    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let state = ServerState::new(config, client.clone());

    let warm = client;
    tokio::spawn(async move {
        if let Err(e) = warm.ensure_connected().await {
            log::warn!("initial gateway connect failed: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("listening on {}", bind_addr);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("server exited")?;
    log::info!("server stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM, then shuts the state down so open streams
/// and pending calls finish.
async fn shutdown_signal(state: ServerState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing gateway connection");
    state.shutdown();
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "runtime": "running",
        "gateway": state.client.status(),
        "protocol": state.client.hello().map(|h| h.protocol),
        "port": state.config.server.port,
    }))
}

fn error_status(e: &GatewayError) -> (StatusCode, &'static str) {
    match e {
        GatewayError::Rpc { .. } => (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR"),
        GatewayError::RpcTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        GatewayError::Connection(_) | GatewayError::Closed | GatewayError::Destroyed => {
            (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
        }
        GatewayError::Configuration(_)
        | GatewayError::Encode(_)
        | GatewayError::DuplicateRequestId(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    }
}

/// POST /api/rpc forwards one request to the gateway.
async fn rpc_http(
    State(state): State<ServerState>,
    Json(body): Json<RpcBody>,
) -> (StatusCode, Json<Value>) {
    let method = body.method.trim();
    if method.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": { "code": "INVALID_REQUEST", "message": "method is required" } })),
        );
    }
    let timeout = body.timeout_ms.map(Duration::from_millis);
    match state.client.rpc(method, body.params, timeout).await {
        Ok(payload) => (StatusCode::OK, Json(json!({ "ok": true, "payload": payload }))),
        Err(e) => {
            let (status, fallback_code) = error_status(&e);
            let error = match e {
                GatewayError::Rpc {
                    code,
                    message,
                    details,
                } => json!({ "code": code, "message": message, "details": details }),
                other => json!({ "code": fallback_code, "message": other.to_string() }),
            };
            (status, Json(json!({ "ok": false, "error": error })))
        }
    }
}

fn to_sse(message: BridgeMessage) -> Result<Event, axum::Error> {
    Event::default().event(message.kind()).json_data(&message)
}

/// GET /api/sessions/:session_key/stream opens a stream bridge for one conversation.
/// A destroyed client gets `connected` then `done { status: "error" }` right away.
async fn stream_sse(
    State(state): State<ServerState>,
    Path(session_key): Path<String>,
) -> Sse<BoxStream<'static, Result<Event, axum::Error>>> {
    if state.client.status() == ConnectionStatus::Destroyed {
        log::debug!("refusing stream for {}: gateway client destroyed", session_key);
        let messages = vec![
            BridgeMessage::Connected {
                session_key: session_key.clone(),
            },
            BridgeMessage::Done {
                session_key,
                status: "error".to_string(),
                error: Some(GatewayError::Destroyed.to_string()),
            },
        ];
        return Sse::new(futures_util::stream::iter(messages).map(to_sse).boxed());
    }

    let client = state.client.clone();
    tokio::spawn(async move {
        if let Err(e) = client.ensure_connected().await {
            log::debug!("gateway not connected for stream: {}", e);
        }
    });
    log::debug!("opening stream for {}", session_key);
    let (bridge, rx) = StreamBridge::channel(state.client.router(), session_key);
    let stream = bridge_stream(bridge, rx, state.config.server.stream_idle_timeout())
        .take_until(ServerState::shutting_down(state.shutdown.subscribe()))
        .map(to_sse)
        .boxed();
    Sse::new(stream).keep_alive(KeepAlive::default())
}
