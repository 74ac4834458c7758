//! Bounded exponential backoff.
//!
//! One policy shape serves both sides of the service: the registry retries
//! retryable store failures inline, the anchor worker reschedules ledger
//! submits and confirmation polls on its queue.

use std::time::Duration;

use crate::store::StoreError;

/// A failure that may go away when the same call is made again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }
}

/// `base * 2^(attempt - 1)`, capped at `max_delay`, with a deterministic
/// spread of `jitter` around the nominal delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay (0.0-1.0).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay).without_jitter()
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay after the given failed attempt (1-indexed). Never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
        let nominal_ms = (self.base_delay.as_millis() as f64 * exp).min(max_ms);

        let spread = nominal_ms * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            let unit = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((nominal_ms + offset).clamp(0.0, max_ms) as u64)
    }

    /// Delay before the next attempt once `attempt` attempts were made, or
    /// `None` when the budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.delay_for_attempt(attempt))
    }

    /// Like [`next_delay`](Self::next_delay), but only for retryable failures.
    pub fn retry_after<E: Retryable + ?Sized>(&self, attempt: u32, err: &E) -> Option<Duration> {
        if err.is_retryable() { self.next_delay(attempt) } else { None }
    }
}
