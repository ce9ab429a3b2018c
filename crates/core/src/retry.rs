//! Retry and backoff policy.
//!
//! The same shape is used at two layers:
//! - queue level: how long a failed job waits before it is eligible again
//!   (`5 min × 2^attempts`, capped at one day);
//! - transport level: immediate retries inside a single send call
//!   (`1 s × 2^attempt` between tries).

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential retry policy: `delay(n) = min(base_delay × 2^n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts allowed (the first try included).
    pub max_attempts: u32,
    /// Delay unit multiplied by `2^n`.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::queue()
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Queue-level policy: 3 attempts, `5 min × 2^attempts`, capped at 24 h.
    pub fn queue() -> Self {
        Self::exponential(3, Duration::from_secs(5 * 60), Duration::from_secs(24 * 60 * 60))
    }

    /// Transport-level policy: 3 tries, `2^attempt` seconds between tries.
    pub fn transport() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Same attempt budget, zero delays (tests and local dry runs).
    pub fn without_delay(self) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..self
        }
    }

    /// Delay associated with attempt number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u128.checked_pow(attempt).unwrap_or(u128::MAX);
        let delay_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(factor)
            .min(self.max_delay.as_millis());

        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Earliest time a job that has already been tried `prior_attempts` times
    /// may be fetched again after failing now.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, prior_attempts: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(prior_attempts);
        now + chrono::Duration::from_std(delay).unwrap_or_default()
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
