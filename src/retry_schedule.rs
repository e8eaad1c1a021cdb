//! Cross-attempt escalating retry schedule for credential exhaustion (C1,
//! cross-attempt half).
//!
//! When [`crate::credentials::CredentialPool::acquire`] reports no eligible
//! credential, the dispatch loop (C8) does not retry in-process — it
//! republishes the message to a delay queue (C7) and lets the broker
//! redeliver it later. [`RetrySchedule`] decides how much later, and when
//! to give up entirely.

use std::time::Duration;

/// A fixed, ordered list of delays consulted by `retry_count`, clamped to
/// the last entry for any retry beyond the list's length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays_secs: Vec<u64>,
    max_retries: u32,
}

impl Default for RetrySchedule {
    /// Spec defaults: `[60, 600, 3600, 86400]` seconds, `max_retries = 4`.
    fn default() -> Self {
        Self {
            delays_secs: vec![60, 600, 3600, 86400],
            max_retries: 4,
        }
    }
}

impl RetrySchedule {
    /// Build a schedule from an explicit delay list and retry cap.
    ///
    /// # Panics
    /// Panics if `delays` is empty — a schedule with no delays cannot
    /// answer `delay_for`, and construction-time is the only sane place to
    /// catch that (mirrors the credential pool's empty-key-list panic).
    pub fn new(delays_secs: Vec<u64>, max_retries: u32) -> Self {
        assert!(
            !delays_secs.is_empty(),
            "retry schedule requires at least one delay"
        );
        Self {
            delays_secs,
            max_retries,
        }
    }

    /// Delay to use for the nth cross-attempt retry (`retry_count` is
    /// 0-indexed, copied straight from the request envelope).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let idx = (retry_count as usize).min(self.delays_secs.len() - 1);
        Duration::from_secs(self.delays_secs[idx])
    }

    /// Whether `retry_count` has already reached the configured cap —
    /// i.e. the next requeue should instead become a terminal error
    /// response (§4.8 step "Exhausted").
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_follows_schedule() {
        let s = RetrySchedule::default();
        assert_eq!(s.delay_for(0), Duration::from_secs(60));
        assert_eq!(s.delay_for(1), Duration::from_secs(600));
        assert_eq!(s.delay_for(2), Duration::from_secs(3600));
        assert_eq!(s.delay_for(3), Duration::from_secs(86400));
    }

    #[test]
    fn delay_clamps_to_last_entry() {
        let s = RetrySchedule::default();
        assert_eq!(s.delay_for(10), Duration::from_secs(86400));
    }

    #[test]
    fn exhaustion_respects_max_retries() {
        let s = RetrySchedule::new(vec![60], 2);
        assert!(!s.is_exhausted(0));
        assert!(!s.is_exhausted(1));
        assert!(s.is_exhausted(2));
        assert!(s.is_exhausted(3));
    }

    #[test]
    #[should_panic(expected = "at least one delay")]
    fn empty_delay_list_panics() {
        RetrySchedule::new(vec![], 4);
    }
}
