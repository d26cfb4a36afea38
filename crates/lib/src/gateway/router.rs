//! Event router: fan inbound gateway events out to listeners by conversation key.
//!
//! Listeners registered for a key receive only events carrying that key; global
//! listeners receive everything. Registries are snapshotted before each dispatch,
//! so a listener may unsubscribe itself (or anyone else) while being invoked.

use super::lock;
use super::protocol::EventFrame;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

/// Callback invoked for each routed event. Runs on the connection's reader task,
/// so it must not block.
pub type Listener = Arc<dyn Fn(&EventFrame) + Send + Sync>;

type ListenerId = u64;

#[derive(Default)]
struct Registry {
    next_id: ListenerId,
    by_key: HashMap<String, Vec<(ListenerId, Listener)>>,
    global: Vec<(ListenerId, Listener)>,
    last_seq: Option<u64>,
}

/// Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct EventRouter {
    inner: Arc<Mutex<Registry>>,
}

/// Extract the conversation key: top-level `sessionKey`, then `session`,
/// then `data.sessionKey`. Only string values count.
pub fn conversation_key(payload: &Value) -> Option<&str> {
    payload
        .get("sessionKey")
        .and_then(Value::as_str)
        .or_else(|| payload.get("session").and_then(Value::as_str))
        .or_else(|| {
            payload
                .get("data")
                .and_then(|d| d.get("sessionKey"))
                .and_then(Value::as_str)
        })
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events whose conversation key equals `key`.
    pub fn subscribe<F>(&self, key: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        let key = key.into();
        let mut g = lock(&self.inner);
        let id = g.next_id;
        g.next_id += 1;
        g.by_key
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: Some(key),
            id,
        }
    }

    /// Register `listener` for every event regardless of key.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        let mut g = lock(&self.inner);
        let id = g.next_id;
        g.next_id += 1;
        g.global.push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: None,
            id,
        }
    }

    /// Deliver one event: global listeners first, then listeners for its key.
    /// A panicking listener is logged and skipped.
    pub fn dispatch(&self, event: &EventFrame) {
        let key = conversation_key(&event.payload);
        let (global, keyed) = {
            let mut g = lock(&self.inner);
            if let Some(seq) = event.seq {
                if let Some(next) = g.last_seq.and_then(|last| last.checked_add(1)) {
                    if seq > next {
                        log::warn!(
                            "gateway event gap: expected seq {}, got {} ({} lost)",
                            next,
                            seq,
                            seq - next
                        );
                    }
                }
                g.last_seq = Some(seq);
            }
            let global: Vec<Listener> = g.global.iter().map(|(_, l)| l.clone()).collect();
            let keyed: Vec<Listener> = key
                .and_then(|k| g.by_key.get(k))
                .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            (global, keyed)
        };

        for listener in global.iter().chain(keyed.iter()) {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::warn!("listener panicked while handling event {}", event.name);
            }
        }
    }

    /// Forget the last seen `seq`; called when a new connection starts.
    pub fn reset_seq(&self) {
        lock(&self.inner).last_seq = None;
    }

    /// Drop every listener.
    pub fn clear(&self) {
        let removed = {
            let mut g = lock(&self.inner);
            g.last_seq = None;
            (std::mem::take(&mut g.by_key), std::mem::take(&mut g.global))
        };
        drop(removed);
    }

    pub fn listener_count(&self) -> usize {
        let g = lock(&self.inner);
        g.global.len() + g.by_key.values().map(Vec::len).sum::<usize>()
    }
}

/// Capability returned by `subscribe` / `subscribe_all`. Removes exactly its own
/// listener on `unsubscribe()` or drop; removing twice is a no-op.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: Option<String>,
    id: ListenerId,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut g = lock(&registry);
        match &self.key {
            Some(key) => {
                if let Some(ls) = g.by_key.get_mut(key) {
                    ls.retain(|(id, _)| *id != self.id);
                    if ls.is_empty() {
                        g.by_key.remove(key);
                    }
                }
            }
            None => g.global.retain(|(id, _)| *id != self.id),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
