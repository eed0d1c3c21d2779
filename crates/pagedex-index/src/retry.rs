//! Exponential backoff with jitter.
//!
//! Shared by the embedding client (per-request retries) and the job queue
//! (how long a failed job waits before it becomes claimable again).

use std::time::Duration;

use rand::Rng;

/// Backoff schedule for retried operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Give up once the next delay would push total elapsed time past this
    pub max_elapsed: Duration,
    /// Fraction of the delay randomly added or removed (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with no delays, for tests and local fakes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_elapsed: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    /// Delay to wait after `attempt` failures (1-based), before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay to wait after `attempt` failures, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }
}
