//! Backoff Policy
//!
//! Shared delay calculation for transport reconnection and request-level
//! retry. [`next_delay`] is a pure function of the attempt number and the
//! policy, so both subsystems degrade the same way under sustained failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Retry configuration
///
/// `max_retries = 0` disables retry entirely: the first failure is terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay growth strategy
    pub backoff: BackoffStrategy,
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for a single delay (None = uncapped)
    pub max_delay_ms: Option<u64>,
    /// Add up to 25% random jitter on top of the computed delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 500,
            max_delay_ms: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Exponential policy with the given retry count and base delay
    #[must_use]
    pub fn exponential(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms,
            ..Default::default()
        }
    }

    /// Linear policy with the given retry count and base delay
    #[must_use]
    pub fn linear(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Linear,
            base_delay_ms,
            ..Default::default()
        }
    }

    /// Whether any retry is allowed
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Whether another attempt may follow `attempt` failed retries
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry `attempt` (1-based), with jitter when enabled
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = next_delay(attempt, self);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter = rand::random::<f64>() * 0.25;
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter)).unwrap_or(delay)
    }
}

/// Delay before attempt `attempt` (1-based) under `policy`
///
/// - linear: `base_delay_ms * attempt`
/// - exponential: `base_delay_ms * 2^(attempt - 1)`
///
/// Attempt 0 yields no delay. Arithmetic saturates rather than overflowing,
/// then `max_delay_ms` caps the result when set.
#[must_use]
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base = policy.base_delay_ms;
    let ms = match policy.backoff {
        BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        }
    };

    let capped = match policy.max_delay_ms {
        Some(max) => ms.min(max),
        None => ms,
    };

    Duration::from_millis(capped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::linear(5, 100);
        assert_eq!(next_delay(1, &policy), Duration::from_millis(100));
        assert_eq!(next_delay(2, &policy), Duration::from_millis(200));
        assert_eq!(next_delay(5, &policy), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let d = 250;
        let policy = RetryPolicy::exponential(10, d);
        for k in 1..=20u32 {
            assert_eq!(
                next_delay(k, &policy),
                Duration::from_millis(d * 2u64.pow(k - 1)),
                "attempt {k}"
            );
        }
    }

    #[test]
    fn test_attempt_zero_is_immediate() {
        assert_eq!(next_delay(0, &RetryPolicy::default()), Duration::ZERO);
    }

    #[test]
    fn test_exponential_saturates() {
        let policy = RetryPolicy::exponential(100, 1000);
        assert_eq!(next_delay(80, &policy), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_max_delay_caps() {
        let policy = RetryPolicy {
            max_delay_ms: Some(1_000),
            ..RetryPolicy::exponential(10, 300)
        };
        assert_eq!(next_delay(2, &policy), Duration::from_millis(600));
        assert_eq!(next_delay(3, &policy), Duration::from_millis(1_000));
        assert_eq!(next_delay(9, &policy), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::exponential(3, 400)
        };
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(799));
            assert!(delay <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_disabled_policy() {
        let policy = RetryPolicy::disabled();
        assert!(!policy.enabled());
        assert!(!policy.allows(0));
    }

    #[test]
    fn test_policy_toml_roundtrip_defaults() {
        let policy: RetryPolicy = toml::from_str("max_retries = 2\nbackoff = \"linear\"").unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff, BackoffStrategy::Linear);
        assert_eq!(policy.base_delay_ms, 500);
    }
}
