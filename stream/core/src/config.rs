//! TOML Configuration File Support
//!
//! Loads a [`SessionConfig`] from `~/.config/aistream/aistream.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! Every key is optional; a missing file is not an error.
//!
//! # Example Configuration
//!
//! ```toml
//! [session]
//! endpoint = "https://llm.internal/v1/chat/stream"
//! model = "gpt-4o-mini"
//! system_prompt = "Answer briefly."
//! token_counter = "lexical"
//!
//! [retry]
//! max_retries = 3
//! backoff = "exponential"
//! base_delay_ms = 500
//!
//! [transport]
//! kind = "sse"
//! failover = ["http_chunked"]
//! connect_timeout_ms = 10000
//!
//! [buffer]
//! strategy = "capacity"
//! capacity = 256
//!
//! [manager]
//! max_reconnects = 3
//! health_check_interval_ms = 30000
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffStrategy;
use crate::buffer::BufferStrategy;
use crate::session::SessionConfig;
use crate::tokens::TokenCounterKind;
use crate::transport::TransportKind;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// At least one environment variable applied
    Env,
    /// TOML configuration file
    File,
    /// Default values only
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Completion endpoint URL
    pub endpoint: Option<String>,
    /// Model identifier
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token limit
    pub max_tokens: Option<u32>,
    /// Leading system message
    pub system_prompt: Option<String>,
    /// "heuristic" or "lexical"
    pub token_counter: Option<TokenCounterKind>,
}

/// `[retry]` section (request-level retry)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retries after the first attempt (0 = disabled)
    pub max_retries: Option<u32>,
    /// "linear" or "exponential"
    pub backoff: Option<BackoffStrategy>,
    /// Base delay in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Delay cap in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Randomize delays
    pub jitter: Option<bool>,
}

/// `[transport]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Primary transport kind
    pub kind: Option<TransportKind>,
    /// Extra kinds tried in order
    pub failover: Option<Vec<TransportKind>>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Reader channel capacity
    pub channel_capacity: Option<usize>,
    /// Explicit WebSocket URL
    pub websocket_url: Option<String>,
    /// Extra request headers
    pub headers: Option<BTreeMap<String, String>>,
}

/// `[buffer]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferToml {
    /// "circular", "sliding", "priority" or "capacity"
    pub strategy: Option<BufferStrategy>,
    /// Maximum buffered chunks
    pub capacity: Option<usize>,
}

/// `[manager]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerToml {
    /// Mid-stream reconnect attempts
    pub max_reconnects: Option<u32>,
    /// Reconnect delay growth
    pub reconnect_backoff: Option<BackoffStrategy>,
    /// Reconnect base delay in milliseconds
    pub reconnect_base_delay_ms: Option<u64>,
    /// Health check period in milliseconds (0 = disabled)
    pub health_check_interval_ms: Option<u64>,
    /// Idle time before a transport is recycled
    pub max_idle_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Session section
    pub session: SessionToml,
    /// Retry section
    pub retry: RetryToml,
    /// Transport section
    pub transport: TransportToml,
    /// Buffer section
    pub buffer: BufferToml,
    /// Manager section
    pub manager: ManagerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective configuration with provenance
#[derive(Clone, Debug)]
pub struct StreamConfigFile {
    /// Session configuration ready for `StreamSession::new`
    pub session: SessionConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for StreamConfigFile {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StreamConfigFile {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty endpoint or a zero
    /// buffer capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "session.endpoint must not be empty".into(),
            ));
        }
        if self.session.manager.buffer.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffer.capacity must be at least 1".into(),
            ));
        }
        if self.session.transport.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "transport.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/aistream/aistream.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("aistream").join("aistream.toml"))
}

/// Load configuration from the default path, defaults and environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation.
pub fn load_config() -> Result<StreamConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result fails
/// validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamConfigFile, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with environment values taken from `lookup`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_with_env(
    path: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<StreamConfigFile, ConfigError> {
    let mut config = StreamConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    if apply_env_config(&mut config, lookup) {
        config.source = ConfigSource::Env;
    }

    config.validate()?;
    Ok(config)
}

/// Apply TOML values to the config struct
fn apply_toml_config(config: &mut StreamConfigFile, toml: &StreamToml) {
    let session = &mut config.session;

    if let Some(ref endpoint) = toml.session.endpoint {
        session.endpoint.clone_from(endpoint);
    }
    if toml.session.model.is_some() {
        session.model.clone_from(&toml.session.model);
    }
    if toml.session.temperature.is_some() {
        session.temperature = toml.session.temperature;
    }
    if toml.session.max_tokens.is_some() {
        session.max_tokens = toml.session.max_tokens;
    }
    if toml.session.system_prompt.is_some() {
        session.system_prompt.clone_from(&toml.session.system_prompt);
    }
    if let Some(counter) = toml.session.token_counter {
        session.token_counter = counter;
    }

    // Request retry
    if let Some(n) = toml.retry.max_retries {
        session.retry.max_retries = n;
    }
    if let Some(backoff) = toml.retry.backoff {
        session.retry.backoff = backoff;
    }
    if let Some(ms) = toml.retry.base_delay_ms {
        session.retry.base_delay_ms = ms;
    }
    if toml.retry.max_delay_ms.is_some() {
        session.retry.max_delay_ms = toml.retry.max_delay_ms;
    }
    if let Some(jitter) = toml.retry.jitter {
        session.retry.jitter = jitter;
    }

    // Transport
    if let Some(kind) = toml.transport.kind {
        session.transport.kind = kind;
    }
    if let Some(ref failover) = toml.transport.failover {
        session.transport.failover.clone_from(failover);
    }
    if let Some(ms) = toml.transport.connect_timeout_ms {
        session.transport.connect_timeout_ms = ms;
    }
    if let Some(capacity) = toml.transport.channel_capacity {
        session.transport.channel_capacity = capacity;
    }
    if toml.transport.websocket_url.is_some() {
        session
            .transport
            .websocket_url
            .clone_from(&toml.transport.websocket_url);
    }
    if let Some(ref headers) = toml.transport.headers {
        session.transport.headers.extend(headers.clone());
    }

    // Buffer
    if let Some(strategy) = toml.buffer.strategy {
        session.manager.buffer.strategy = strategy;
    }
    if let Some(capacity) = toml.buffer.capacity {
        session.manager.buffer.capacity = capacity;
    }

    // Manager
    if let Some(n) = toml.manager.max_reconnects {
        session.manager.reconnect.max_retries = n;
    }
    if let Some(backoff) = toml.manager.reconnect_backoff {
        session.manager.reconnect.backoff = backoff;
    }
    if let Some(ms) = toml.manager.reconnect_base_delay_ms {
        session.manager.reconnect.base_delay_ms = ms;
    }
    if let Some(ms) = toml.manager.health_check_interval_ms {
        session.manager.health_check_interval_ms = ms;
    }
    if let Some(ms) = toml.manager.max_idle_ms {
        session.manager.max_idle_ms = ms;
    }
}

/// Apply environment overrides; returns whether any applied
fn apply_env_config(
    config: &mut StreamConfigFile,
    lookup: impl Fn(&str) -> Option<String>,
) -> bool {
    let session = &mut config.session;
    let mut applied = session.transport.apply_env_with(&lookup);

    if let Some(endpoint) = lookup("AISTREAM_ENDPOINT") {
        session.endpoint = endpoint;
        applied = true;
    }
    if let Some(model) = lookup("AISTREAM_MODEL") {
        session.model = Some(model);
        applied = true;
    }
    if let Some(n) = lookup("AISTREAM_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        session.retry.max_retries = n;
        applied = true;
    }
    if let Some(ms) = lookup("AISTREAM_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
        session.retry.base_delay_ms = ms;
        applied = true;
    }
    if let Some(strategy) = lookup("AISTREAM_BUFFER_STRATEGY").and_then(|v| v.parse().ok()) {
        session.manager.buffer.strategy = strategy;
        applied = true;
    }
    if let Some(capacity) = lookup("AISTREAM_BUFFER_CAPACITY").and_then(|v| v.parse().ok()) {
        session.manager.buffer.capacity = capacity;
        applied = true;
    }
    if let Some(n) = lookup("AISTREAM_MAX_RECONNECTS").and_then(|v| v.parse().ok()) {
        session.manager.reconnect.max_retries = n;
        applied = true;
    }

    applied
}

// =============================================================================
// Tests
// =============================================================================
