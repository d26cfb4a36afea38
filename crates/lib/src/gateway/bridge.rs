//! Stream bridge: turn routed gateway events for one conversation into a
//! cancellable stream of browser-facing messages.
//!
//! A bridge writes a `connected` marker on open, then forwards assistant text
//! deltas, tool status updates, and a terminal `done`. Once raw token events
//! (`agent` / `stream: "assistant"`) have been seen, buffered `chat` deltas are
//! dropped for the rest of the bridge's life so text is never sent twice.

use super::lock;
use super::protocol::EventFrame;
use super::router::{EventRouter, Subscription};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One message pushed to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeMessage {
    Connected {
        #[serde(rename = "sessionKey")]
        session_key: String,
    },
    Delta {
        text: String,
        #[serde(rename = "sessionKey")]
        session_key: String,
    },
    Tool {
        name: String,
        status: String,
        id: Option<String>,
        #[serde(rename = "sessionKey")]
        session_key: String,
    },
    Done {
        #[serde(rename = "sessionKey")]
        session_key: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl BridgeMessage {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::Connected { .. } => "connected",
            BridgeMessage::Delta { .. } => "delta",
            BridgeMessage::Tool { .. } => "tool",
            BridgeMessage::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeMessage::Done { .. })
    }
}

/// What an upstream event means to a bridge.
#[derive(Debug, Clone, PartialEq)]
enum Update {
    /// Fine-grained token text from an `agent` assistant stream.
    RawDelta(String),
    /// Coarse accumulated text from a `chat` delta.
    BufferedDelta(String),
    Tool {
        name: String,
        status: String,
        id: Option<String>,
    },
    Done {
        status: String,
        error: Option<String>,
    },
}

fn str_field<'a>(v: &'a Value, name: &str) -> Option<&'a str> {
    v.get(name).and_then(Value::as_str)
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.is_empty()).map(str::to_string)
}

/// Text of a chat message: `text`, a string `content`, or the text parts of a content array.
fn message_text(message: &Value) -> Option<String> {
    if let Some(text) = non_empty(str_field(message, "text")) {
        return Some(text);
    }
    match message.get("content")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let joined: String = parts
                .iter()
                .filter(|p| str_field(p, "type").map_or(true, |t| t == "text"))
                .filter_map(|p| str_field(p, "text"))
                .collect();
            non_empty(Some(&joined))
        }
        _ => None,
    }
}

fn tool_status(data: &Value) -> String {
    if let Some(status) = str_field(data, "status") {
        return status.to_string();
    }
    match str_field(data, "phase") {
        Some("start") | Some("update") => "running".to_string(),
        Some("result") | Some("end") => {
            if data.get("isError").and_then(Value::as_bool).unwrap_or(false) {
                "error".to_string()
            } else {
                "done".to_string()
            }
        }
        Some(other) => other.to_string(),
        None => "running".to_string(),
    }
}

fn classify(event: &EventFrame) -> Option<Update> {
    let payload = &event.payload;
    match event.name.as_str() {
        "agent" => {
            let data = payload.get("data").unwrap_or(payload);
            match str_field(payload, "stream")? {
                "assistant" => non_empty(str_field(data, "delta"))
                    .or_else(|| non_empty(str_field(payload, "delta")))
                    .or_else(|| non_empty(str_field(data, "text")))
                    .or_else(|| non_empty(str_field(payload, "text")))
                    .map(Update::RawDelta),
                "tool" => {
                    let name = str_field(data, "name").or_else(|| str_field(data, "tool"))?;
                    let id = str_field(data, "toolCallId")
                        .or_else(|| str_field(data, "id"))
                        .map(str::to_string);
                    Some(Update::Tool {
                        name: name.to_string(),
                        status: tool_status(data),
                        id,
                    })
                }
                "lifecycle" => match str_field(data, "phase")? {
                    "end" => Some(Update::Done {
                        status: "ok".to_string(),
                        error: None,
                    }),
                    "error" => Some(Update::Done {
                        status: "error".to_string(),
                        error: non_empty(str_field(data, "error")),
                    }),
                    _ => None,
                },
                _ => None,
            }
        }
        "chat" => {
            let state = str_field(payload, "state").or_else(|| str_field(payload, "kind"))?;
            match state {
                "delta" => non_empty(str_field(payload, "text"))
                    .or_else(|| payload.get("message").and_then(message_text))
                    .map(Update::BufferedDelta),
                "final" => Some(Update::Done {
                    status: "ok".to_string(),
                    error: None,
                }),
                "aborted" => Some(Update::Done {
                    status: "aborted".to_string(),
                    error: None,
                }),
                "error" => Some(Update::Done {
                    status: "error".to_string(),
                    error: non_empty(str_field(payload, "errorMessage"))
                        .or_else(|| non_empty(str_field(payload, "error"))),
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

struct BridgeState {
    /// None once closed; nothing is written after that.
    sink: Option<mpsc::UnboundedSender<BridgeMessage>>,
    subscription: Option<Subscription>,
    saw_raw_tokens: bool,
}

impl BridgeState {
    fn close(&mut self) -> Option<Subscription> {
        self.sink = None;
        self.subscription.take()
    }
}

struct BridgeInner {
    key: String,
    state: Mutex<BridgeState>,
}

impl BridgeInner {
    fn handle(&self, event: &EventFrame) {
        let Some(update) = classify(event) else {
            return;
        };
        let mut st = lock(&self.state);
        if st.sink.is_none() {
            return;
        }
        let session_key = self.key.clone();
        let message = match update {
            Update::RawDelta(text) => {
                st.saw_raw_tokens = true;
                BridgeMessage::Delta { text, session_key }
            }
            Update::BufferedDelta(text) => {
                if st.saw_raw_tokens {
                    return;
                }
                BridgeMessage::Delta { text, session_key }
            }
            Update::Tool { name, status, id } => BridgeMessage::Tool {
                name,
                status,
                id,
                session_key,
            },
            Update::Done { status, error } => BridgeMessage::Done {
                session_key,
                status,
                error,
            },
        };
        let terminal = message.is_terminal();
        let delivered = st.sink.as_ref().is_some_and(|s| s.send(message).is_ok());
        if terminal || !delivered {
            let subscription = st.close();
            drop(st);
            drop(subscription);
        }
    }
}

/// Per-client adapter from the event router to a message sink. Closing (or
/// dropping) it unsubscribes synchronously; the sink is never written afterward.
pub struct StreamBridge {
    inner: Arc<BridgeInner>,
}

impl StreamBridge {
    /// Write the `connected` marker to `sink`, then subscribe to `key` on `router`.
    pub fn open(
        router: &EventRouter,
        key: impl Into<String>,
        sink: mpsc::UnboundedSender<BridgeMessage>,
    ) -> Self {
        let key = key.into();
        let _ = sink.send(BridgeMessage::Connected {
            session_key: key.clone(),
        });
        let inner = Arc::new(BridgeInner {
            key: key.clone(),
            state: Mutex::new(BridgeState {
                sink: Some(sink),
                subscription: None,
                saw_raw_tokens: false,
            }),
        });
        let weak = Arc::downgrade(&inner);
        let subscription = router.subscribe(key, move |event: &EventFrame| {
            if let Some(inner) = weak.upgrade() {
                inner.handle(event);
            }
        });
        let leftover = {
            let mut st = lock(&inner.state);
            if st.sink.is_some() {
                st.subscription = Some(subscription);
                None
            } else {
                Some(subscription)
            }
        };
        drop(leftover);
        Self { inner }
    }

    /// Open a bridge with a fresh channel; returns the bridge and the consumer end.
    pub fn channel(
        router: &EventRouter,
        key: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::open(router, key, tx), rx)
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn close(&self) {
        let subscription = lock(&self.inner.state).close();
        drop(subscription);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).sink.is_none()
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.close();
    }
}

struct StreamState {
    bridge: StreamBridge,
    rx: mpsc::UnboundedReceiver<BridgeMessage>,
    idle_timeout: Option<Duration>,
    finished: bool,
}

/// Consumer side of a bridge. Ends after `done`; with `idle_timeout`, yields
/// `done { status: "timeout" }` and ends when nothing arrives in time. Dropping
/// the stream closes the bridge.
pub fn bridge_stream(
    bridge: StreamBridge,
    rx: mpsc::UnboundedReceiver<BridgeMessage>,
    idle_timeout: Option<Duration>,
) -> impl Stream<Item = BridgeMessage> + Send + 'static {
    let state = StreamState {
        bridge,
        rx,
        idle_timeout,
        finished: false,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        let next = match st.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, st.rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    log::debug!(
                        "stream for {} idle for {}ms, finishing",
                        st.bridge.key(),
                        idle.as_millis()
                    );
                    st.bridge.close();
                    st.finished = true;
                    let done = BridgeMessage::Done {
                        session_key: st.bridge.key().to_string(),
                        status: "timeout".to_string(),
                        error: Some("no activity from gateway".to_string()),
                    };
                    return Some((done, st));
                }
            },
            None => st.rx.recv().await,
        };
        next.map(|message| (message, st))
    })
}
