//! Transport Traits
//!
//! The lifecycle contract every wire mechanism implements, plus the request
//! and event types that cross it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{StreamError, TransportError};
use crate::messages::{Chunk, Message, MessageRole};

use super::config::TransportKind;

/// Lifecycle state of one logical connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not connected
    #[default]
    Idle,
    /// Open in progress
    Connecting,
    /// Delivering events
    Open,
    /// Manager is re-establishing after a fault
    Reconnecting,
    /// Closed cleanly (stream finished or close() called)
    Closed,
    /// Unrecoverable fault; needs a fresh open
    Failed,
}

impl TransportState {
    /// Whether a read is in progress
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared, cheaply clonable state cell
///
/// Reader tasks update it as the stream progresses; owners read it without
/// awaiting.
#[derive(Clone, Debug, Default)]
pub struct StateCell(Arc<RwLock<TransportState>>);

impl StateCell {
    /// Create a cell in `Idle`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub fn get(&self) -> TransportState {
        *self.0.read()
    }

    /// Replace the state
    pub fn set(&self, state: TransportState) {
        *self.0.write() = state;
    }

    /// Set `to` only if the current state is `from`
    pub fn transition(&self, from: TransportState, to: TransportState) -> bool {
        let mut guard = self.0.write();
        if *guard == from {
            *guard = to;
            true
        } else {
            false
        }
    }
}

/// Last time a transport saw traffic
///
/// Shared between the transport and its reader task.
#[derive(Clone, Debug)]
pub struct ActivityClock(Arc<parking_lot::Mutex<Instant>>);

impl Default for ActivityClock {
    fn default() -> Self {
        Self(Arc::new(parking_lot::Mutex::new(Instant::now())))
    }
}

impl ActivityClock {
    /// Record activity now
    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

/// A conversation-shaped request to the completion endpoint
///
/// Model, temperature and max tokens are passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Endpoint URL
    pub endpoint: String,
    /// Conversation so far, including the new user message
    pub messages: Vec<Message>,
    /// Model identifier
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token limit
    pub max_tokens: Option<u32>,
    /// Last event id to resume from (SSE only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<String>,
}

impl StreamRequest {
    /// Create a request for an endpoint and conversation
    pub fn new(endpoint: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            endpoint: endpoint.into(),
            messages,
            ..Default::default()
        }
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// JSON body sent to the endpoint
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = self
            .messages
            .iter()
            .map(|m| {
                let mut value = serde_json::json!({
                    "role": role_name(m.role),
                    "content": m.content,
                });
                if !m.tool_calls.is_empty() {
                    value["tool_calls"] = serde_json::json!(m.tool_calls);
                }
                if let Some(ref id) = m.tool_call_id {
                    value["tool_call_id"] = serde_json::json!(id);
                }
                value
            })
            .collect();

        let mut body = serde_json::json!({
            "messages": messages,
            "stream": true,
        });
        if let Some(ref model) = self.model {
            body["model"] = serde_json::json!(model);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

/// A decoded chunk with its wire position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    /// The decoded chunk
    pub chunk: Chunk,
    /// SSE event id, when the endpoint supplies one
    pub event_id: Option<String>,
}

impl TransportEvent {
    /// Event without an id
    #[must_use]
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            event_id: None,
        }
    }
}

/// Item delivered by an open transport
///
/// `Err(StreamError::Transport(_))` is a connection fault the manager may
/// reconnect from; `Err(StreamError::Protocol(_))` is terminal.
pub type TransportResult = Result<TransportEvent, StreamError>;

/// Lifecycle contract for a wire mechanism
///
/// `open` spawns a reader that decodes the wire framing and sends events on
/// the returned channel. The channel closes after `Done`, after an error
/// item, or after `close()`. A transport never retries on its own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which mechanism this is
    fn kind(&self) -> TransportKind;

    /// Shared state cell, also updated by the manager while reconnecting
    fn state_cell(&self) -> &StateCell;

    /// Current lifecycle state
    fn state(&self) -> TransportState {
        self.state_cell().get()
    }

    /// Whether a dropped stream can continue from the last event id
    fn supports_resume(&self) -> bool {
        false
    }

    /// Open a stream for `request`
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the connection cannot be established or
    /// the endpoint rejects the request (non-2xx). State becomes `Failed`.
    async fn open(
        &mut self,
        request: &StreamRequest,
    ) -> Result<mpsc::Receiver<TransportResult>, TransportError>;

    /// Stop delivering events and release the underlying connection
    ///
    /// Safe to call in any state and more than once.
    fn close(&mut self);

    /// Check a kept-open connection
    ///
    /// Transports without persistent connections report whether they are
    /// usable (not `Failed`).
    async fn health_check(&mut self) -> bool {
        self.state() != TransportState::Failed
    }

    /// How long since the transport last saw traffic
    fn idle_for(&self) -> Duration;

    /// Return to `Idle` after a failure so the next open starts fresh
    fn recycle(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_transition() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), TransportState::Idle);
        assert!(cell.transition(TransportState::Idle, TransportState::Connecting));
        assert!(!cell.transition(TransportState::Idle, TransportState::Open));
        assert_eq!(cell.get(), TransportState::Connecting);
        assert!(cell.get().is_active());
    }

    #[test]
    fn test_request_body_shape() {
        let request = StreamRequest::new(
            "http://localhost/chat",
            vec![Message::system("be brief"), Message::user("Hi")],
        )
        .with_model("test-model")
        .with_max_tokens(64);

        let body = request.body();
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hi");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransportState::Reconnecting.to_string(), "reconnecting");
    }
}
