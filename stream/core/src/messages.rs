//! Conversation Data Model
//!
//! Messages, usage counters and the decoded chunk union that flows from a
//! transport, through the buffer, into a session.
//!
//! # Ownership
//!
//! Messages are created and mutated only by `StreamSession`. The in-flight
//! assistant message is the only one whose content changes after creation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("msg_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Model output
    Assistant,
    /// System instructions
    System,
    /// Tool result fed back to the model
    Tool,
}

/// A fully or partially assembled tool invocation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Position of this call within the assistant turn
    pub index: u32,
    /// Provider-assigned call id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function name
    #[serde(default)]
    pub name: String,
    /// JSON arguments, accumulated from fragments
    #[serde(default)]
    pub arguments: String,
}

/// One streamed fragment of a tool call
///
/// Accepts both the flat shape (`{"index":0,"name":"f","arguments":"{"}`)
/// and the OpenAI nested shape (`{"index":0,"function":{"name":"f"}}`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Which call this fragment belongs to
    #[serde(default)]
    pub index: u32,
    /// Call id (usually only on the first fragment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function name (usually only on the first fragment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arguments fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Nested function object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

/// Nested `function` object of a tool-call fragment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDelta {
    /// Function name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arguments fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    /// Function name from either shape
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.function.as_ref().and_then(|f| f.name.as_deref()))
    }

    /// Arguments fragment from either shape
    #[must_use]
    pub fn arguments(&self) -> Option<&str> {
        self.arguments
            .as_deref()
            .or_else(|| self.function.as_ref().and_then(|f| f.arguments.as_deref()))
    }
}

/// Token usage reported by the endpoint
///
/// Provider totals are authoritative and cumulative: a new report replaces
/// the previous one wholesale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Tokens in the request
    #[serde(default, alias = "prompt_tokens")]
    pub prompt_tokens: u64,
    /// Tokens generated so far
    #[serde(default, alias = "completion_tokens")]
    pub completion_tokens: u64,
    /// Sum reported by the endpoint
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
}

impl UsageStats {
    /// Build usage from prompt and completion counts
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Whether nothing has been reported
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// A message in the conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool call this message answers (role = tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Why generation stopped, when the endpoint said so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Message {
    /// Create a new message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            finish_reason: None,
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a tool result message
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    /// Append streamed text (plain concatenation)
    pub fn append(&mut self, text: &str) {
        self.content.push_str(text);
    }

    /// Merge a tool-call fragment into this message
    ///
    /// Fragments are keyed by `index`. Id and name are set by the first
    /// fragment that carries them; argument fragments concatenate.
    pub fn merge_tool_delta(&mut self, delta: &ToolCallDelta) -> &ToolCall {
        let pos = match self.tool_calls.iter().position(|c| c.index == delta.index) {
            Some(pos) => pos,
            None => {
                self.tool_calls.push(ToolCall {
                    index: delta.index,
                    ..Default::default()
                });
                self.tool_calls.len() - 1
            }
        };

        let call = &mut self.tool_calls[pos];
        if call.id.is_none() {
            call.id.clone_from(&delta.id);
        }
        if let Some(name) = delta.name() {
            if call.name.is_empty() {
                call.name = name.to_string();
            }
        }
        if let Some(args) = delta.arguments() {
            call.arguments.push_str(args);
        }
        &self.tool_calls[pos]
    }

    /// Drop streamed content and tool calls, keeping identity
    pub fn clear_streamed(&mut self) {
        self.content.clear();
        self.tool_calls.clear();
        self.finish_reason = None;
    }
}

/// One decoded unit of streamed protocol data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    /// Text to append to the assistant message
    Token(String),
    /// Cumulative usage report
    Usage(UsageStats),
    /// Tool-call fragments
    ToolCallDelta {
        /// Fragments in this chunk
        deltas: Vec<ToolCallDelta>,
        /// Why generation stopped, if this chunk ends the turn
        finish_reason: Option<String>,
    },
    /// Error reported by the endpoint inside the stream
    Error(String),
    /// Stream finished cleanly
    Done,
    /// Upstream was re-issued from scratch; partial content is stale
    Restart,
}

impl Chunk {
    /// Whether this chunk ends the turn
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Short label for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Usage(_) => "usage",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::Error(_) => "error",
            Self::Done => "done",
            Self::Restart => "restart",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
        assert!(MessageId::new().0.starts_with("msg_"));
    }

    #[test]
    fn test_append_concatenates() {
        let mut msg = Message::assistant("Hello");
        msg.append(" world");
        assert_eq!(msg.content, "Hello world");
    }

    #[test]
    fn test_merge_tool_deltas() {
        let mut msg = Message::assistant("");
        msg.merge_tool_delta(&ToolCallDelta {
            index: 0,
            id: Some("call_1".into()),
            function: Some(FunctionDelta {
                name: Some("get_weather".into()),
                arguments: Some("{\"city\":".into()),
            }),
            ..Default::default()
        });
        let call = msg.merge_tool_delta(&ToolCallDelta {
            index: 0,
            arguments: Some("\"Oslo\"}".into()),
            ..Default::default()
        });

        assert_eq!(call.id.as_deref(), Some("call_1"));
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, "{\"city\":\"Oslo\"}");
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn test_usage_accepts_both_casings() {
        let camel: UsageStats =
            serde_json::from_str(r#"{"promptTokens":1,"completionTokens":2,"totalTokens":3}"#)
                .unwrap();
        let snake: UsageStats =
            serde_json::from_str(r#"{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}"#)
                .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.total_tokens, 3);
    }

    #[test]
    fn test_message_serialization_shape() {
        let msg = Message::tool("call_9", "42");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["toolCallId"], "call_9");
        assert!(json.get("toolCalls").is_none());
    }

    #[test]
    fn test_terminal_chunks() {
        assert!(Chunk::Done.is_terminal());
        assert!(Chunk::Error("x".into()).is_terminal());
        assert!(!Chunk::Token("x".into()).is_terminal());
        assert!(!Chunk::Restart.is_terminal());
    }
}
