//! Credential manager (C2): a bounded-rate, cooldown-aware rotation pool.
//!
//! Grounded on `examples/original_source/gemini-client/src/client/key_manager.py`'s
//! `KeyManager`/`KeyState`, re-expressed with a single `tokio::sync::Mutex`
//! guarding the whole pool (the critical section is O(pool size), which the
//! spec calls "small (tens)") rather than per-key locks, matching the
//! `InMemoryTokenStore` single-lock style in
//! `examples/flyingrobots-ninelives/src/rate_limit/store.rs`.

use crate::clock::{Clock, MonotonicClock};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const WINDOW_SECS: u64 = 60;

/// Per-credential counters, process-local for the lifetime of the pool.
#[derive(Debug, Clone)]
pub struct CredentialState {
    key: String,
    usage_count: u32,
    window_start: u64,
    cooldown_until: u64,
    total_requests: u64,
    rate_limit_hits: u64,
}

impl CredentialState {
    fn new(key: String, now: u64) -> Self {
        Self {
            key,
            usage_count: 0,
            window_start: now,
            cooldown_until: 0,
            total_requests: 0,
            rate_limit_hits: 0,
        }
    }

    /// I2: if the window has elapsed, reset the counter before any
    /// eligibility check.
    fn reset_if_needed(&mut self, now: u64) {
        if now.saturating_sub(self.window_start) >= WINDOW_SECS {
            self.usage_count = 0;
            self.window_start = now;
        }
    }

    /// I3: eligible iff out of cooldown and under the per-minute cap.
    fn is_eligible(&self, now: u64, max_per_minute: u32) -> bool {
        now >= self.cooldown_until && self.usage_count < max_per_minute
    }
}

/// Read-only snapshot of one credential's counters, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStats {
    pub key_prefix: String,
    pub usage_count: u32,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub cooldown_remaining_secs: u64,
    pub is_available: bool,
}

struct PoolState {
    credentials: Vec<CredentialState>,
    cursor: usize,
}

/// Configuration for [`CredentialPool::new`].
#[derive(Debug, Clone)]
pub struct CredentialPoolConfig {
    pub api_keys: Vec<String>,
    pub max_per_minute: u32,
    pub cooldown_secs: u64,
}

/// Bounded-rate, cooldown-aware rotation pool over a fixed set of API keys.
///
/// `acquire`, `mark_rate_limited`, and `snapshot` all serialize on one
/// mutex (§4.2); none of them perform I/O while holding it.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    max_per_minute: u32,
    cooldown_secs: u64,
    clock: Arc<dyn Clock>,
}

impl CredentialPool {
    /// Construct a pool. Empty `api_keys` is a construction-time fatal per
    /// §4.2 — there is nothing sensible to rotate over.
    pub fn new(config: CredentialPoolConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// As [`CredentialPool::new`] but with an injectable clock, for
    /// deterministic property tests (P1-P3).
    pub fn with_clock(config: CredentialPoolConfig, clock: Arc<dyn Clock>) -> Self {
        assert!(
            !config.api_keys.is_empty(),
            "at least one API key must be provided"
        );
        let now = clock.now_secs();
        let credentials = config
            .api_keys
            .into_iter()
            .map(|k| CredentialState::new(k, now))
            .collect();

        info!(
            pool_size = ?credentials_len(&credentials),
            max_per_minute = config.max_per_minute,
            cooldown_secs = config.cooldown_secs,
            "credential pool initialized"
        );

        Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
            }),
            max_per_minute: config.max_per_minute,
            cooldown_secs: config.cooldown_secs,
            clock,
        }
    }

    /// Select the next eligible credential using round-robin starting from
    /// the rotating cursor. Returns `None` if every credential is in
    /// cooldown or at quota (§4.2 algorithm).
    pub async fn acquire(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_secs();
        let len = state.credentials.len();

        for c in state.credentials.iter_mut() {
            c.reset_if_needed(now);
        }

        for _ in 0..len {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % len;

            let c = &mut state.credentials[idx];
            if c.is_eligible(now, self.max_per_minute) {
                c.usage_count += 1;
                c.total_requests += 1;
                debug!(
                    key_prefix = %key_prefix(&c.key),
                    usage = c.usage_count,
                    cap = self.max_per_minute,
                    "selected credential"
                );
                return Some(c.key.clone());
            }
        }

        warn!("no eligible credentials available");
        None
    }

    /// Put `key` into cooldown. Unknown keys are silently ignored (§4.2).
    pub async fn mark_rate_limited(&self, key: &str) {
        let mut state = self.state.lock().await;
        let now = self.clock.now_secs();
        if let Some(c) = state.credentials.iter_mut().find(|c| c.key == key) {
            c.cooldown_until = now + self.cooldown_secs;
            c.rate_limit_hits += 1;
            warn!(
                key_prefix = %key_prefix(&c.key),
                cooldown_until = c.cooldown_until,
                rate_limit_hits = c.rate_limit_hits,
                "credential marked rate-limited"
            );
        } else {
            warn!("mark_rate_limited called for unknown credential");
        }
    }

    /// Atomic read of per-credential counters for observability.
    pub async fn snapshot(&self) -> Vec<CredentialStats> {
        let state = self.state.lock().await;
        let now = self.clock.now_secs();
        state
            .credentials
            .iter()
            .map(|c| CredentialStats {
                key_prefix: key_prefix(&c.key),
                usage_count: c.usage_count,
                total_requests: c.total_requests,
                rate_limit_hits: c.rate_limit_hits,
                cooldown_remaining_secs: c.cooldown_until.saturating_sub(now),
                is_available: c.is_eligible(now, self.max_per_minute),
            })
            .collect()
    }
}

fn credentials_len(v: &[CredentialState]) -> usize {
    v.len()
}

fn key_prefix(key: &str) -> String {
    let n = key.len().min(8);
    format!("{}...", &key[..n])
}
