//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.perch/config.json`) and environment.
//! The gateway credential and URL may come from either; environment wins.

use crate::gateway::Credential;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "PERCH_CONFIG_PATH";
pub const ENV_GATEWAY_URL: &str = "PERCH_GATEWAY_URL";
pub const ENV_GATEWAY_TOKEN: &str = "PERCH_GATEWAY_TOKEN";
pub const ENV_GATEWAY_PASSWORD: &str = "PERCH_GATEWAY_PASSWORD";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Upstream gateway connection.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Browser-facing HTTP server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Upstream gateway URL, credential, timeouts, and the identity sent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// WebSocket URL. Overridden by PERCH_GATEWAY_URL. Default ws://127.0.0.1:18789.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub auth: GatewayAuthConfig,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Default per-request timeout when the caller gives none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// First reconnect delay; doubles per failed attempt up to the ceiling.
    #[serde(default = "default_reconnect_floor_ms")]
    pub reconnect_floor_ms: u64,

    #[serde(default = "default_reconnect_ceiling_ms")]
    pub reconnect_ceiling_ms: u64,

    #[serde(default = "default_protocol")]
    pub min_protocol: u32,

    #[serde(default = "default_protocol")]
    pub max_protocol: u32,

    #[serde(default)]
    pub client: ClientIdentityConfig,

    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

/// Gateway credential: token or password. Overridden by PERCH_GATEWAY_TOKEN / PERCH_GATEWAY_PASSWORD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    pub token: Option<String>,
    pub password: Option<String>,
}

/// Overrides for the client identity descriptor; unset fields use built-in values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentityConfig {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub mode: Option<String>,
    pub instance_id: Option<String>,
}

/// Browser-facing server bind, port, and stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP (default 3210).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Finish a browser stream after this long without gateway activity. 0 disables.
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_floor_ms() -> u64 {
    1_000
}

fn default_reconnect_ceiling_ms() -> u64 {
    30_000
}

fn default_protocol() -> u32 {
    crate::gateway::PROTOCOL_VERSION
}

fn default_role() -> String {
    "operator".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["operator.read".to_string(), "operator.write".to_string()]
}

fn default_server_port() -> u16 {
    3210
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_stream_idle_timeout_ms() -> u64 {
    120_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth: GatewayAuthConfig::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_floor_ms: default_reconnect_floor_ms(),
            reconnect_ceiling_ms: default_reconnect_ceiling_ms(),
            min_protocol: default_protocol(),
            max_protocol: default_protocol(),
            client: ClientIdentityConfig::default(),
            role: default_role(),
            scopes: default_scopes(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_ms > 0).then(|| Duration::from_millis(self.stream_idle_timeout_ms))
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Resolve the gateway URL: env PERCH_GATEWAY_URL, then config, then the loopback default.
pub fn resolve_gateway_url(config: &Config) -> String {
    resolve_gateway_url_with(config, env_var)
}

fn resolve_gateway_url_with(config: &Config, env: impl Fn(&str) -> Option<String>) -> String {
    non_empty(env(ENV_GATEWAY_URL))
        .or_else(|| non_empty(config.gateway.url.clone()))
        .unwrap_or_else(|| crate::gateway::DEFAULT_GATEWAY_URL.to_string())
}

/// Resolve the gateway credential. Token beats password; env beats config.
/// None when neither is configured anywhere.
pub fn resolve_gateway_credential(config: &Config) -> Option<Credential> {
    resolve_gateway_credential_with(config, env_var)
}

fn resolve_gateway_credential_with(
    config: &Config,
    env: impl Fn(&str) -> Option<String>,
) -> Option<Credential> {
    let auth = &config.gateway.auth;
    let token = non_empty(env(ENV_GATEWAY_TOKEN)).or_else(|| non_empty(auth.token.clone()));
    if let Some(token) = token {
        return Some(Credential::Token(token));
    }
    non_empty(env(ENV_GATEWAY_PASSWORD))
        .or_else(|| non_empty(auth.password.clone()))
        .map(Credential::Password)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var(ENV_CONFIG_PATH).map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".perch").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, else PERCH_CONFIG_PATH, else the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
