//! Transport Layer
//!
//! One implementation per wire mechanism, all behind the [`Transport`]
//! lifecycle contract:
//! - `Sse`: server-sent events over a streaming POST (resumable)
//! - `HttpChunked`: chunked read of `data:` frames (not resumable)
//! - `WebSocket`: request/response over a kept-open socket (feature
//!   `websocket`)
//!
//! # Design Philosophy
//!
//! Transports decode wire framing into [`Chunk`](crate::messages::Chunk)s
//! and report faults. They never retry: reconnection policy lives in the
//! [`TransportManager`](crate::manager::TransportManager) so every
//! mechanism degrades the same way.

pub mod config;
pub mod factory;
pub mod frame;
mod http;
pub mod http_chunked;
pub mod sse;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use config::{TransportConfig, TransportKind};
pub use factory::{create_pool, create_transport};
pub use frame::{decode_payload, DONE_SENTINEL, MAX_FRAME_SIZE};
pub use http_chunked::HttpChunkedTransport;
pub use sse::SseTransport;
pub use traits::{
    ActivityClock, StateCell, StreamRequest, Transport, TransportEvent, TransportResult,
    TransportState,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
