//! Error Types
//!
//! Two layers of errors flow through the engine:
//!
//! - [`TransportError`]: faults raised by a wire mechanism (connect, HTTP
//!   status, socket reset). The `TransportManager` decides whether to
//!   reconnect.
//! - [`StreamError`]: what a session turn ends with. Wraps transport faults
//!   once they escalate, plus protocol, rate-limit, timeout and abort cases.
//!
//! Both are `Clone` so the same error can be stored in session state, handed
//! to every subscriber, and returned from `send()`.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a transport implementation
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish a connection (refused, DNS, TLS, timeout)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Endpoint answered the open request with a non-2xx status
    #[error("Endpoint returned HTTP {status}: {body}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
        /// `Retry-After` seconds, when the endpoint sent one
        retry_after: Option<u64>,
    },

    /// Connection closed by the peer before the stream finished
    #[error("Connection closed")]
    ConnectionClosed,

    /// Reading from an open connection failed (reset, broken pipe)
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Sending on an open connection failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Transport not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transport kind not compiled in or not usable for this endpoint
    #[error("Unsupported transport: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether reconnecting or re-issuing the request may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed
            | Self::ReceiveFailed(_)
            | Self::SendFailed(_) => true,
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::InvalidState(_) | Self::Unsupported(_) => false,
        }
    }
}

/// HTTP statuses worth retrying: request timeout, rate limit, server errors
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Terminal outcome of a session turn
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Transport fault that survived reconnection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unframeable chunk; never retried
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Endpoint signalled 429-class throttling
    #[error("Rate limited by endpoint")]
    RateLimited {
        /// Server-requested wait before retrying
        retry_after: Option<Duration>,
    },

    /// Caller-imposed timeout (delivered through stop)
    #[error("Stream timed out")]
    Timeout,

    /// Explicit stop() or destroy() mid-stream
    #[error("Stream aborted")]
    Aborted,

    /// Endpoint sent an error chunk inside the stream
    #[error("Endpoint error: {0}")]
    Remote(String),

    /// Session used after destroy()
    #[error("Session destroyed")]
    Destroyed,
}

impl StreamError {
    /// Whether a request-level retry may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retryable(),
            Self::RateLimited { .. } => true,
            Self::Protocol(_)
            | Self::Timeout
            | Self::Aborted
            | Self::Remote(_)
            | Self::Destroyed => false,
        }
    }

    /// Server-requested minimum wait, if any
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether the turn ended because the caller cancelled it
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted | Self::Timeout | Self::Destroyed)
    }
}

impl From<&TransportError> for StreamError {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::HttpStatus {
                status: 429,
                retry_after,
                ..
            } => Self::RateLimited {
                retry_after: retry_after.map(Duration::from_secs),
            },
            other => Self::Transport(other.clone()),
        }
    }
}

/// Classify a transport fault, mapping HTTP 429 to [`StreamError::RateLimited`]
#[must_use]
pub fn classify(err: TransportError) -> StreamError {
    StreamError::from(&err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(408));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = classify(TransportError::HttpStatus {
            status: 429,
            body: "slow down".into(),
            retry_after: Some(3),
        });
        assert_eq!(
            err,
            StreamError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_protocol_errors_not_retryable() {
        assert!(!StreamError::Protocol("bad json".into()).is_retryable());
        assert!(!StreamError::Remote("model overloaded".into()).is_retryable());
        assert!(!StreamError::Aborted.is_retryable());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::HttpStatus {
            status: 500,
            body: "boom".into(),
            retry_after: None,
        };
        assert!(err.to_string().contains("500"));
        assert!(StreamError::from(err).is_retryable());
    }

    #[test]
    fn test_cancellation_kinds() {
        assert!(StreamError::Aborted.is_cancellation());
        assert!(StreamError::Timeout.is_cancellation());
        assert!(!StreamError::Protocol(String::new()).is_cancellation());
    }
}
