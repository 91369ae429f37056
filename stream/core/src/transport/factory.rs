//! Transport Factory
//!
//! Creates transport instances from configuration so the manager never
//! names a concrete transport type.

use crate::error::TransportError;

use super::config::{TransportConfig, TransportKind};
use super::http_chunked::HttpChunkedTransport;
use super::sse::SseTransport;
use super::traits::Transport;

#[cfg(feature = "websocket")]
use super::websocket::WebSocketTransport;

/// Create a transport of the given kind
///
/// # Errors
///
/// Returns `TransportError::Unsupported` if `WebSocket` is requested and the
/// crate was built without the `websocket` feature, or
/// `TransportError::ConnectionFailed` if the HTTP client cannot be built.
///
/// # Example
///
/// ```ignore
/// use aistream_core::transport::{create_transport, TransportConfig, TransportKind};
///
/// let config = TransportConfig::default();
/// let transport = create_transport(TransportKind::Sse, &config)?;
/// ```
pub fn create_transport(
    kind: TransportKind,
    config: &TransportConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    match kind {
        TransportKind::Sse => Ok(Box::new(SseTransport::new(config.clone())?)),
        TransportKind::HttpChunked => Ok(Box::new(HttpChunkedTransport::new(config.clone())?)),

        #[cfg(feature = "websocket")]
        TransportKind::WebSocket => Ok(Box::new(WebSocketTransport::new(config.clone()))),

        #[cfg(not(feature = "websocket"))]
        TransportKind::WebSocket => Err(TransportError::Unsupported(
            "WebSocket transport requires the `websocket` feature".into(),
        )),
    }
}

/// Create one transport per pool entry (`[kind, failover...]`)
///
/// Kinds that cannot be created are skipped with a warning; an error is
/// returned only if none can.
///
/// # Errors
///
/// Returns the last creation error when the pool would be empty.
pub fn create_pool(config: &TransportConfig) -> Result<Vec<Box<dyn Transport>>, TransportError> {
    let mut pool = Vec::new();
    let mut last_err = None;

    for kind in config.pool() {
        match create_transport(kind, config) {
            Ok(transport) => pool.push(transport),
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Skipping transport");
                last_err = Some(e);
            }
        }
    }

    match (pool.is_empty(), last_err) {
        (true, Some(e)) => Err(e),
        (true, None) => Err(TransportError::InvalidState("empty transport pool".into())),
        _ => Ok(pool),
    }
}
