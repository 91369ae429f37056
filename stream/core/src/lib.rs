//! aistream Core - Streaming Engine for Incremental LLM Responses
//!
//! This crate turns a completion endpoint's streamed output into a live
//! conversation: messages assembled token by token, usage accounting, and a
//! typed event feed for whatever renders it. It has no UI dependencies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       StreamSession                          │
//! │   send / retry / stop / reset / destroy   ──►  SessionEvent  │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ StreamRequest
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                     TransportManager                         │
//! │   pool [kind, failover...]  reconnect (RetryPolicy)  health  │
//! │                              │                               │
//! │        ┌─────────┐   ┌───────┴──────┐   ┌─────────────┐      │
//! │        │   SSE   │   │ HTTP chunked │   │  WebSocket  │      │
//! │        └────┬────┘   └───────┬──────┘   └──────┬──────┘      │
//! │             └────────────────┼─────────────────┘             │
//! │                        Chunk │ pump                          │
//! │                     ┌────────┴────────┐                      │
//! │                     │  MessageBuffer  │ circular / sliding / │
//! │                     └─────────────────┘ priority / capacity  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamSession`]: the public engine, one per conversation
//! - [`Transport`]: lifecycle contract for a wire mechanism
//! - [`TransportManager`]: pool, failover, reconnect and health checks
//! - [`MessageBuffer`]: bounded hand-off between network and session
//! - [`RetryPolicy`]: shared backoff for reconnects and request retry
//!
//! # Quick Start
//!
//! ```ignore
//! use aistream_core::{SessionConfig, StreamSession};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     aistream_core::logging::init_tracing("aistream_core=info");
//!
//!     let config = aistream_core::config::load_config()?.session;
//!     let session = StreamSession::new(config)?;
//!
//!     let _tokens = session.on_token(|text| print!("{text}"));
//!     session.send("Explain backpressure in one paragraph").await?;
//!
//!     println!("\n{} tokens", session.usage().total_tokens);
//!     session.destroy();
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backoff`]: delay calculation for retries and reconnects
//! - [`buffer`]: buffering strategies between transport and session
//! - [`config`]: TOML configuration file support
//! - [`error`]: transport and stream error types
//! - [`logging`]: stock `tracing` subscriber setup
//! - [`manager`]: transport pool management
//! - [`messages`]: conversation messages, usage and decoded chunks
//! - [`persistence`]: conversation store boundary
//! - [`session`]: the streaming session and its events
//! - [`tokens`]: client-side token estimation
//! - [`transport`]: SSE, HTTP-chunked and WebSocket transports

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod persistence;
pub mod session;
pub mod tokens;
pub mod transport;

// Re-exports for convenience
pub use backoff::{next_delay, BackoffStrategy, RetryPolicy};
pub use buffer::{
    BufferConfig, BufferStats, BufferStrategy, BufferedChunk, Completion, MessageBuffer,
    Received,
};
pub use error::{StreamError, TransportError};
pub use manager::{ManagedStream, ManagerConfig, ManagerStats, TransportManager};
pub use messages::{Chunk, Message, MessageId, MessageRole, ToolCall, ToolCallDelta, UsageStats};
pub use persistence::{ConversationStore, MemoryStore};
pub use session::{
    SessionConfig, SessionEvent, SessionStats, StreamSession, StreamState, Subscription,
};
pub use tokens::{TokenCounter, TokenCounterKind};
pub use transport::{
    StreamRequest, Transport, TransportConfig, TransportKind, TransportState,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    StreamConfigFile, StreamToml,
};
