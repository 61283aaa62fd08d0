//! In-process counter store.
//!
//! Backs single-instance deployments and tests. A per-key mutex inside a
//! concurrent map makes each operation atomic within the process, which
//! satisfies the same contract the Redis scripts provide across instances.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::backend::{BucketOutcome, CounterStore, StoreError, WindowOutcome};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: f64,
    expires_at: f64,
}

#[derive(Debug)]
struct LogState {
    entries: VecDeque<f64>,
    expires_at: f64,
}

/// In-memory counter store.
///
/// Entries carry an expiry refreshed on every write (the caller's TTL) and
/// are dropped lazily on access or eagerly via [`purge_expired`].
///
/// [`purge_expired`]: MemoryStore::purge_expired
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, Mutex<BucketState>>,
    logs: DashMap<String, Mutex<LogState>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (buckets plus logs).
    pub fn key_count(&self) -> usize {
        self.buckets.len() + self.logs.len()
    }

    /// Drop every entry whose TTL has lapsed.
    pub fn purge_expired(&self, now: f64) {
        self.buckets.retain(|_, state| state.lock().expires_at > now);
        self.logs.retain(|_, state| state.lock().expires_at > now);
    }

    /// Clear all state. Primarily useful for tests.
    pub fn clear(&self) {
        self.buckets.clear();
        self.logs.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn consume_tokens(
        &self,
        key: &str,
        max_tokens: f64,
        refill_rate: f64,
        requested: f64,
        now: f64,
        ttl_secs: f64,
    ) -> Result<BucketOutcome, StoreError> {
        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: now,
                expires_at: now + ttl_secs,
            })
        });
        let mut state = entry.lock();

        // A lapsed TTL means the backend would have deleted the key.
        if now >= state.expires_at {
            state.tokens = max_tokens;
            state.last_refill = now;
        }

        let elapsed = (now - state.last_refill).max(0.0);
        let refilled = (state.tokens + elapsed * refill_rate).min(max_tokens);

        let allowed = refilled >= requested;
        state.tokens = if allowed { refilled - requested } else { refilled };
        // last_refill never moves backwards, even if the caller's clock does.
        state.last_refill = state.last_refill.max(now);
        state.expires_at = now + ttl_secs;

        Ok(BucketOutcome {
            allowed,
            tokens: state.tokens,
        })
    }

    async fn record_window(
        &self,
        key: &str,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: f64,
    ) -> Result<WindowOutcome, StoreError> {
        let entry = self.logs.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(LogState {
                entries: VecDeque::new(),
                expires_at: now + ttl_secs,
            })
        });
        let mut state = entry.lock();

        if now >= state.expires_at {
            state.entries.clear();
        }

        let cutoff = now - window_secs;
        while state.entries.front().is_some_and(|&t| t < cutoff) {
            state.entries.pop_front();
        }

        let allowed = (state.entries.len() as u64) < limit;
        if allowed {
            state.entries.push_back(now);
        }
        state.expires_at = now + ttl_secs;

        Ok(WindowOutcome {
            allowed,
            count: state.entries.len() as u64,
            oldest: state.entries.front().copied(),
        })
    }

    async fn record_violation(
        &self,
        key: &str,
        now: f64,
        window_secs: f64,
        max_entries: usize,
        ttl_secs: f64,
    ) -> Result<u64, StoreError> {
        let entry = self.logs.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(LogState {
                entries: VecDeque::new(),
                expires_at: now + ttl_secs,
            })
        });
        let mut state = entry.lock();

        if now >= state.expires_at {
            state.entries.clear();
        }

        let cutoff = now - window_secs;
        while state.entries.front().is_some_and(|&t| t < cutoff) {
            state.entries.pop_front();
        }

        state.entries.push_back(now);
        while state.entries.len() > max_entries {
            state.entries.pop_front();
        }
        state.expires_at = now + ttl_secs;

        Ok(state.entries.len() as u64)
    }

    async fn violation_count(
        &self,
        key: &str,
        now: f64,
        window_secs: f64,
    ) -> Result<u64, StoreError> {
        let Some(entry) = self.logs.get(key) else {
            return Ok(0);
        };
        let mut state = entry.lock();

        if now >= state.expires_at {
            state.entries.clear();
            return Ok(0);
        }

        let cutoff = now - window_secs;
        while state.entries.front().is_some_and(|&t| t < cutoff) {
            state.entries.pop_front();
        }

        Ok(state.entries.len() as u64)
    }
}
