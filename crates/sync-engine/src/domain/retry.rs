//! Retry and backoff policy.

use std::time::Duration;

use super::errors::SyncError;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `step * n`, capped at `max`.
    Linear {
        /// Added per retry
        step: Duration,
        /// Upper bound
        max: Duration,
    },
    /// `base * 2^(n-1)`, capped at `max`.
    Exponential {
        /// First delay
        base: Duration,
        /// Upper bound
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match *self {
            Backoff::Linear { step, max } => step.saturating_mul(retry).min(max),
            Backoff::Exponential { base, max } => {
                // 2^16 * base already exceeds any sane cap.
                let factor = 1u32 << (retry - 1).min(16);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Bounded retry policy for gateway calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay schedule.
    pub backoff: Backoff,
    retryable: fn(&SyncError) -> bool,
}

impl RetryPolicy {
    /// Policy retrying transient failures (5xx, transport).
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: SyncError::is_retryable,
        }
    }

    /// Replace the retryable predicate.
    pub fn with_predicate(mut self, retryable: fn(&SyncError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Linear {
            step: Duration::ZERO,
            max: Duration::ZERO,
        })
    }

    /// Whether a failure on attempt `attempt` (1-based) earns another try.
    pub fn should_retry(&self, attempt: u32, error: &SyncError) -> bool {
        attempt < self.max_attempts && (self.retryable)(error)
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_secs(4),
            },
        )
    }
}
