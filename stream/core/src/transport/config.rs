//! Transport Configuration
//!
//! Configuration types for selecting and tuning wire mechanisms.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire mechanism selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Server-sent events over a streaming HTTP response
    ///
    /// The common case. Supports resuming with `Last-Event-ID` when the
    /// endpoint assigns event ids.
    #[default]
    Sse,

    /// WebSocket (request sent as a text message, one payload per message)
    ///
    /// The connection stays open between turns and is health-checked with
    /// ping/pong.
    #[serde(rename = "websocket", alias = "ws")]
    WebSocket,

    /// Plain chunked HTTP read of `data:` frames
    ///
    /// Cannot resume; a reconnect re-issues the request.
    #[serde(alias = "chunked", alias = "http")]
    HttpChunked,
}

impl TransportKind {
    /// Short name used in logs and config files
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
            Self::HttpChunked => "http_chunked",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sse" | "eventsource" => Ok(Self::Sse),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "http" | "chunked" | "http_chunked" | "http-chunked" => Ok(Self::HttpChunked),
            other => Err(format!("unknown transport kind: {other}")),
        }
    }
}

/// Transport configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Primary transport
    pub kind: TransportKind,

    /// Extra kinds tried in order when the primary cannot open
    pub failover: Vec<TransportKind>,

    /// Connection timeout in milliseconds
    ///
    /// Also bounds the WebSocket pong wait during health checks.
    pub connect_timeout_ms: u64,

    /// Capacity of the channel between a transport's reader task and the
    /// manager
    pub channel_capacity: usize,

    /// Extra request headers
    pub headers: BTreeMap<String, String>,

    /// WebSocket URL (None = derive from the endpoint, http→ws)
    pub websocket_url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            failover: Vec::new(),
            connect_timeout_ms: 10_000,
            channel_capacity: 64,
            headers: BTreeMap::new(),
            websocket_url: None,
        }
    }
}

impl TransportConfig {
    /// Configuration for a single transport kind
    #[must_use]
    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `AISTREAM_TRANSPORT`: "sse", "websocket", "ws", "http", "chunked"
    /// - `AISTREAM_FAILOVER`: comma-separated kinds
    /// - `AISTREAM_CONNECT_TIMEOUT`: connection timeout in ms
    /// - `AISTREAM_WS_URL`: WebSocket URL
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables onto this configuration
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup` (keyed by environment variable name)
    ///
    /// Returns whether any value was applied.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> bool {
        let mut applied = false;
        if let Some(kind) = lookup("AISTREAM_TRANSPORT").and_then(|v| v.parse().ok()) {
            self.kind = kind;
            applied = true;
        }
        if let Some(list) = lookup("AISTREAM_FAILOVER") {
            self.failover = list.split(',').filter_map(|s| s.parse().ok()).collect();
            applied = true;
        }
        if let Some(ms) = lookup("AISTREAM_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = ms;
            applied = true;
        }
        if let Some(url) = lookup("AISTREAM_WS_URL") {
            self.websocket_url = Some(url);
            applied = true;
        }
        applied
    }

    /// Pool order: primary first, then failover kinds without duplicates
    #[must_use]
    pub fn pool(&self) -> Vec<TransportKind> {
        let mut kinds = vec![self.kind];
        for kind in &self.failover {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }

    /// Connect timeout as a duration
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Derive a WebSocket URL from an HTTP endpoint
#[must_use]
pub fn websocket_url_for(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("ws".parse::<TransportKind>(), Ok(TransportKind::WebSocket));
        assert_eq!("Chunked".parse::<TransportKind>(), Ok(TransportKind::HttpChunked));
        assert_eq!("sse".parse::<TransportKind>(), Ok(TransportKind::Sse));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_pool_deduplicates() {
        let config = TransportConfig {
            kind: TransportKind::WebSocket,
            failover: vec![
                TransportKind::Sse,
                TransportKind::WebSocket,
                TransportKind::HttpChunked,
            ],
            ..Default::default()
        };
        assert_eq!(
            config.pool(),
            vec![
                TransportKind::WebSocket,
                TransportKind::Sse,
                TransportKind::HttpChunked
            ]
        );
    }

    #[test]
    fn test_websocket_url_derivation() {
        assert_eq!(websocket_url_for("https://api.test/v1"), "wss://api.test/v1");
        assert_eq!(websocket_url_for("http://127.0.0.1:80"), "ws://127.0.0.1:80");
        assert_eq!(websocket_url_for("ws://x"), "ws://x");
    }

    #[test]
    fn test_config_from_toml() {
        let config: TransportConfig =
            toml::from_str("kind = \"http_chunked\"\nfailover = [\"sse\"]").unwrap();
        assert_eq!(config.kind, TransportKind::HttpChunked);
        assert_eq!(config.pool(), vec![TransportKind::HttpChunked, TransportKind::Sse]);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_env_overlay_from_lookup() {
        let mut config = TransportConfig::default();
        let applied = config.apply_env_with(|key| match key {
            "AISTREAM_TRANSPORT" => Some("ws".into()),
            "AISTREAM_FAILOVER" => Some("sse,bogus,chunked".into()),
            _ => None,
        });
        assert!(applied);
        assert_eq!(config.kind, TransportKind::WebSocket);
        assert_eq!(config.failover, vec![TransportKind::Sse, TransportKind::HttpChunked]);
        assert_eq!(config.connect_timeout_ms, 10_000);

        assert!(!TransportConfig::default().apply_env_with(|_| None));
    }
}
