//! Frame Protocol
//!
//! Wire format shared by the SSE and HTTP-chunked transports:
//!
//! ```text
//! data: {"token":"Hel"}\n
//! \n
//! data: {"usage":{"promptTokens":3,"completionTokens":1,"totalTokens":4}}\n
//! \n
//! data: [DONE]\n
//! \n
//! ```
//!
//! Line framing (CRLF/LF, `:` keep-alives, multi-line `data:`, `id:`) is
//! left to `eventsource-stream`. [`decode_payload`] turns one event's data
//! into [`Chunk`]s. The `[DONE]` sentinel is recognised before JSON parsing
//! and never reaches serde.

use serde::Deserialize;

use crate::error::StreamError;
use crate::messages::{Chunk, ToolCallDelta, UsageStats};

/// Literal payload that terminates a stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Maximum size of one event's data (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// JSON payload shape sent by the endpoint
#[derive(Debug, Default, Deserialize)]
struct WirePayload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    usage: Option<UsageStats>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    done: Option<bool>,
}

/// Decode one frame payload into chunks
///
/// A payload may carry several kinds at once (`token` plus `usage`); they are
/// returned in the order token, tool calls, usage, error, done. Objects with
/// none of the known keys decode to an empty list.
///
/// # Errors
///
/// Returns `StreamError::Protocol` if the payload is not a JSON object of the
/// expected shape or is larger than [`MAX_FRAME_SIZE`].
pub fn decode_payload(payload: &str) -> Result<Vec<Chunk>, StreamError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(StreamError::Protocol(format!(
            "Payload exceeds {MAX_FRAME_SIZE} bytes"
        )));
    }
    let trimmed = payload.trim();
    if trimmed == DONE_SENTINEL {
        return Ok(vec![Chunk::Done]);
    }
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let wire: WirePayload = serde_json::from_str(trimmed).map_err(|e| {
        StreamError::Protocol(format!("Malformed chunk ({e}): {}", truncate(trimmed, 200)))
    })?;

    let mut chunks = Vec::new();

    if let Some(token) = wire.token {
        if !token.is_empty() {
            chunks.push(Chunk::Token(token));
        }
    }

    if let Some(deltas) = wire.tool_calls {
        chunks.push(Chunk::ToolCallDelta {
            deltas,
            finish_reason: wire.finish_reason,
        });
    }

    if let Some(usage) = wire.usage {
        chunks.push(Chunk::Usage(usage));
    }

    if let Some(error) = wire.error {
        chunks.push(Chunk::Error(error_message(&error)));
    }

    if wire.done == Some(true) {
        chunks.push(Chunk::Done);
    }

    if chunks.is_empty() {
        tracing::trace!(payload = %truncate(trimmed, 200), "Ignoring payload without known keys");
    }

    Ok(chunks)
}

/// Extract a readable message from an `error` value
fn error_message(value: &serde_json::Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    if let Some(msg) = value.get("message").and_then(serde_json::Value::as_str) {
        return msg.to_string();
    }
    value.to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_oversized_payload_rejected() {
        let big = format!("{{\"token\":\"{}\"}}", "x".repeat(MAX_FRAME_SIZE));
        assert!(matches!(
            decode_payload(&big),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn test_done_sentinel_not_parsed_as_json() {
        assert_eq!(decode_payload("[DONE]").unwrap(), vec![Chunk::Done]);
        assert_eq!(decode_payload(" [DONE] ").unwrap(), vec![Chunk::Done]);
    }

    #[test]
    fn test_decode_token_and_usage() {
        let chunks = decode_payload(
            r#"{"token":"x","usage":{"promptTokens":100,"completionTokens":200,"totalTokens":300}}"#,
        )
        .unwrap();
        assert_eq!(
            chunks,
            vec![
                Chunk::Token("x".into()),
                Chunk::Usage(UsageStats {
                    prompt_tokens: 100,
                    completion_tokens: 200,
                    total_tokens: 300,
                }),
            ]
        );
    }

    #[test]
    fn test_decode_tool_calls() {
        let chunks = decode_payload(
            r#"{"tool_calls":[{"index":0,"id":"c1","function":{"name":"f","arguments":"{}"}}],"finish_reason":"tool_calls"}"#,
        )
        .unwrap();
        match &chunks[0] {
            Chunk::ToolCallDelta {
                deltas,
                finish_reason,
            } => {
                assert_eq!(deltas[0].name(), Some("f"));
                assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_shapes() {
        assert_eq!(
            decode_payload(r#"{"error":"overloaded"}"#).unwrap(),
            vec![Chunk::Error("overloaded".into())]
        );
        assert_eq!(
            decode_payload(r#"{"error":{"message":"bad key","code":401}}"#).unwrap(),
            vec![Chunk::Error("bad key".into())]
        );
    }

    #[test]
    fn test_unknown_object_ignored() {
        assert!(decode_payload(r#"{"ping":1}"#).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_is_protocol_error() {
        assert!(matches!(
            decode_payload("{not json"),
            Err(StreamError::Protocol(_))
        ));
        assert!(matches!(
            decode_payload("[1,2,3]"),
            Err(StreamError::Protocol(_))
        ));
    }
}
