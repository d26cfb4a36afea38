//! Gateway error taxonomy.

use std::time::Duration;

/// Errors surfaced by the gateway client. `Clone` so one failed connect attempt
/// can be handed to every caller that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid configuration (e.g. no credential). Not retried.
    #[error("gateway configuration error: {0}")]
    Configuration(String),

    /// Transport open or handshake failed. A reconnect is scheduled.
    #[error("gateway connection failed: {0}")]
    Connection(String),

    #[error("gateway request `{method}` timed out after {}ms", timeout.as_millis())]
    RpcTimeout { method: String, timeout: Duration },

    /// The gateway answered with `ok: false`.
    #[error("gateway error {code}: {message}")]
    Rpc {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// The connection went away while the call was pending.
    #[error("gateway connection closed")]
    Closed,

    #[error("gateway client destroyed")]
    Destroyed,

    #[error("failed to encode gateway frame: {0}")]
    Encode(String),

    /// A request id was registered while another call with the same id was outstanding.
    #[error("duplicate request id {0}")]
    DuplicateRequestId(String),
}

impl GatewayError {
    /// True for errors a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection(_) | GatewayError::RpcTimeout { .. } | GatewayError::Closed
        )
    }
}
