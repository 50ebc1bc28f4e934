//! Backoff policy for transient store failures.
//!
//! Pollers use this when popping fails with a transient error (pool
//! exhausted, broken connection, I/O). It does not govern envelope retries,
//! which are counted on the envelope itself against the registration's
//! `retry_limit`.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the poller reports the error
    /// and starts over from `initial_backoff`.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fraction of each delay randomized in both directions, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.base_backoff_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.max_backoff)
    }

    /// Whether `attempt` consecutive failures have used up the policy.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
