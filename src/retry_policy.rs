//! In-process retry policy for a single upstream call (C1, per-attempt half).
//!
//! [`BackoffPolicy`] governs how many times — and how long to wait between
//! them — a single call to the upstream caller (C3) retries with the *same*
//! credential after a `rate_limited` or `location_blocked` classification.
//! This is distinct from [`crate::retry_schedule::RetrySchedule`], which
//! governs retries across dispatch-loop attempts when the credential pool
//! itself is exhausted.

use crate::error::WorkerError;
use std::time::Duration;

/// Exponential backoff for in-process retry of a single upstream call.
///
/// `delay = min(base * exp_base^attempt, max_delay)`, attempt 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay before the first retry.
    pub base: Duration,
    /// Multiplier applied per additional attempt.
    pub exp_base: f64,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    /// Spec defaults: base=5s, exp_base=2, max_delay=60s, max_retries=3.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            exp_base: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64() * self.exp_base.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    /// Whether `error` is retryable under this policy at all. Only
    /// `rate_limited` and `location_blocked` are retried in-process; every
    /// other kind is terminal at this layer (§4.1, §4.3).
    pub fn is_retryable(&self, error: &WorkerError) -> bool {
        error.retryable_in_process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(40));
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = BackoffPolicy::default();
        // attempt 4 would be 80s uncapped, but max_delay is 60s.
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn rate_limited_and_location_blocked_are_retryable() {
        let policy = BackoffPolicy::default();
        assert!(policy.is_retryable(&WorkerError::RateLimited {
            detail: "x".into()
        }));
        assert!(policy.is_retryable(&WorkerError::LocationBlocked {
            detail: "x".into()
        }));
    }

    #[test]
    fn other_kinds_are_not_retryable() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_retryable(&WorkerError::AuthFailed {
            detail: "x".into()
        }));
        assert!(!policy.is_retryable(&WorkerError::BadRequest {
            detail: "x".into()
        }));
        assert!(!policy.is_retryable(&WorkerError::ServerError {
            detail: "x".into()
        }));
        assert!(!policy.is_retryable(&WorkerError::EmptyResponse {
            finish_reason: None
        }));
    }
}
