//! Logging setup for binaries and tests embedding the engine
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedder's choice. [`init_tracing`] is the stock one.

use tracing_subscriber::EnvFilter;

/// Environment variable read before `RUST_LOG`
pub const LOG_ENV: &str = "AISTREAM_LOG";

/// Build the filter: `AISTREAM_LOG`, then `RUST_LOG`, then `default_directive`
#[must_use]
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a fmt subscriber
///
/// Returns false if a global subscriber was already set.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .with_target(true)
        .try_init()
        .is_ok()
}
