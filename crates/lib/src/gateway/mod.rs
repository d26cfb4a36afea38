//! Gateway connection layer: one authenticated WebSocket to the agent gateway.
//!
//! Requests and responses are correlated by id; pushed events are routed to
//! listeners by conversation key; stream bridges turn those events into
//! per-browser message streams.

mod bridge;
mod client;
mod error;
mod pending;
mod protocol;
mod router;

pub use bridge::{bridge_stream, BridgeMessage, StreamBridge};
pub use client::{
    ClientOptions, ConnectionStatus, Credential, GatewayClient, DEFAULT_GATEWAY_URL,
    PROTOCOL_VERSION,
};
pub use error::GatewayError;
pub use protocol::{
    ConnectAuth, ConnectClient, ConnectParams, DecodeError, ErrorShape, EventFrame, Frame,
    HelloOk, HelloPolicy, RequestFrame, ResponseFrame,
};
pub use router::{conversation_key, EventRouter, Listener, Subscription};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ignoring poisoning; a panicking listener must not wedge the connection.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
