//! Pending calls: request id -> waiting caller.
//!
//! Each entry is completed exactly once: by its response, by `reject_all` on
//! connection loss, or removed when the caller times out or goes away.

use super::error::GatewayError;
use super::lock;
use super::protocol::ResponseFrame;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<Value, GatewayError>>;

#[derive(Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<HashMap<String, Completion>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a caller under `id`. Fails if `id` is already outstanding.
    pub fn register(&self, id: &str) -> Result<PendingCall<'_>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        let mut g = lock(&self.inner);
        if g.contains_key(id) {
            return Err(GatewayError::DuplicateRequestId(id.to_string()));
        }
        g.insert(id.to_string(), tx);
        Ok(PendingCall {
            calls: self,
            id: id.to_string(),
            rx,
        })
    }

    /// Complete the call matching `res.id`. Returns false when nothing was waiting
    /// (the caller timed out, went away, or was already rejected).
    pub fn resolve(&self, res: ResponseFrame) -> bool {
        let Some(tx) = lock(&self.inner).remove(&res.id) else {
            return false;
        };
        let outcome = if res.ok {
            Ok(res.payload.unwrap_or(Value::Null))
        } else {
            let err = res.error.unwrap_or_default();
            Err(GatewayError::Rpc {
                code: err.code,
                message: err.message,
                details: err.details,
            })
        };
        let _ = tx.send(outcome);
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        lock(&self.inner).remove(id).is_some()
    }

    /// Reject every outstanding call with `err`; returns how many were rejected.
    pub fn reject_all(&self, err: GatewayError) -> usize {
        let drained: Vec<Completion> = lock(&self.inner).drain().map(|(_, tx)| tx).collect();
        let n = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }
}

/// A registered call. Dropping it unregisters the id, so a caller that is cancelled
/// or times out can never be completed later.
pub(crate) struct PendingCall<'a> {
    calls: &'a PendingCalls,
    id: String,
    rx: oneshot::Receiver<Result<Value, GatewayError>>,
}

impl PendingCall<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome. On timeout the entry is removed before returning.
    pub async fn wait(mut self, method: &str, timeout: Duration) -> Result<Value, GatewayError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => {
                self.calls.remove(&self.id);
                Err(GatewayError::RpcTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.calls.remove(&self.id);
    }
}
