//! Retry logic with exponential backoff and jitter.

use std::time::Duration;

use crate::transport::{Classification, Failure};
use crate::ValidationError;

/// Exponent past which the doubled delay is always above any sane cap.
const MAX_EXPONENT: u32 = 30;

/// Configuration for the automatic retry mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each following retry.
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Multiply each delay by a uniform factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Where a logical call is within its retry budget.
///
/// Only the counters live here. Base and maximum delay come from the
/// [`RetryPolicy`] that judges the attempt, and the request itself is held by
/// the dispatcher, which clones it for every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    number: u32,
    max_attempts: u32,
}

impl RetryAttempt {
    pub const fn first(max_attempts: u32) -> Self {
        Self {
            number: 1,
            max_attempts,
        }
    }

    /// 1-based number of the attempt being made.
    pub const fn number(self) -> u32 {
        self.number
    }

    pub const fn max_attempts(self) -> u32 {
        self.max_attempts
    }

    pub const fn is_last(self) -> bool {
        self.number >= self.max_attempts
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            number: self.number.saturating_add(1),
            max_attempts: self.max_attempts,
        }
    }
}

/// What the caller should do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Success or fatal failure; return the outcome as-is.
    Stop,
    /// Suspend for `delay`, then make the next attempt.
    Retry { delay: Duration },
    /// Retryable failure on the last permitted attempt.
    Exhausted,
}

impl RetryPolicy {
    /// A single attempt and no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::NonPositive {
                field: "max_attempts",
            });
        }
        if self.max_delay < self.base_delay {
            return Err(ValidationError::OutOfRange {
                field: "max_delay",
                min: self.base_delay.as_secs_f64(),
                max: f64::INFINITY,
            });
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (0-based):
    /// `min(max_delay, base_delay * 2^retry)`.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let scale = 2_f64.powi(retry.min(MAX_EXPONENT) as i32);
        let seconds = (self.base_delay.as_secs_f64() * scale).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    /// Range the jittered delay for retry number `retry` falls into.
    pub fn delay_bounds(&self, retry: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(retry);
        if self.jitter {
            (nominal.mul_f64(0.5), nominal.mul_f64(1.5))
        } else {
            (nominal, nominal)
        }
    }

    /// Longest delay this policy will ever ask for, jitter included.
    pub fn delay_ceiling(&self) -> Duration {
        if self.jitter {
            self.max_delay.mul_f64(1.5)
        } else {
            self.max_delay
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter {
            nominal.mul_f64(0.5 + fastrand::f64())
        } else {
            nominal
        }
    }

    /// Decides on the classified outcome of `attempt`. A `Retry-After` hint
    /// on the failure wins when it is longer than the computed backoff, but
    /// is clamped to [`delay_ceiling`](Self::delay_ceiling).
    pub fn decide<T>(&self, attempt: RetryAttempt, outcome: &Classification<T>) -> RetryDecision {
        match outcome {
            Classification::Success(_) | Classification::Fatal(_) => RetryDecision::Stop,
            Classification::Retryable(failure) => self.decide_retryable(attempt, failure),
        }
    }

    fn decide_retryable(&self, attempt: RetryAttempt, failure: &Failure) -> RetryDecision {
        if attempt.is_last() {
            return RetryDecision::Exhausted;
        }

        let backoff = self.delay(attempt.number().saturating_sub(1));
        let delay = failure
            .retry_after()
            .map_or(backoff, |hint| hint.min(self.delay_ceiling()).max(backoff));
        RetryDecision::Retry { delay }
    }
}
