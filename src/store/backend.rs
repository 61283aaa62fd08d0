//! Counter store abstraction.
//!
//! One trait method per atomic backend operation. Every method is a single
//! atomic unit at the backend: concurrent callers on the same key serialize
//! there, so no read-modify-write sequence can lose updates, within one
//! process or across instances sharing the backend.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the backing store.
///
/// These are consumed by the circuit breaker and never surfaced to
/// request handling.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection failure or refused backend
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A call exceeded its deadline
    #[error("Backend call timed out")]
    Timeout,

    /// No connection could be obtained from the shared pool
    #[error("Connection pool exhausted: {0}")]
    Pool(String),

    /// The backend answered with something we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result of a token bucket check-and-consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether the requested tokens were consumed
    pub allowed: bool,
    /// Tokens left after the write, in `[0, max_tokens]`
    pub tokens: f64,
}

/// Result of a sliding window check-and-append.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOutcome {
    /// Whether the request was admitted into the window
    pub allowed: bool,
    /// Entries in the window after the operation
    pub count: u64,
    /// Timestamp of the oldest entry still in the window, if any
    pub oldest: Option<f64>,
}

/// Atomic counter storage shared by all engine instances.
///
/// The in-memory implementation serializes per key with a mutex; the
/// Redis implementation evaluates one server-side script per method. TTLs
/// are refreshed on every write so idle keys expire on their own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Refill a token bucket for `key` and try to consume `requested`
    /// tokens.
    ///
    /// Missing state initializes to a full bucket. Tokens refill at
    /// `refill_rate` per second up to `max_tokens`; on insufficient
    /// tokens the refill is still written back and the request denied.
    async fn consume_tokens(
        &self,
        key: &str,
        max_tokens: f64,
        refill_rate: f64,
        requested: f64,
        now: f64,
        ttl_secs: f64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Count requests in `[now - window_secs, now]` for `key`; admit and
    /// append `now` iff the count is below `limit`.
    async fn record_window(
        &self,
        key: &str,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: f64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Append a violation timestamp for `key`, pruning entries older than
    /// `window_secs` and capping the log at `max_entries`. Returns the
    /// count in the window after the write.
    async fn record_violation(
        &self,
        key: &str,
        now: f64,
        window_secs: f64,
        max_entries: usize,
        ttl_secs: f64,
    ) -> Result<u64, StoreError>;

    /// Count violations in the window for `key` without recording one.
    /// Entries outside the window are pruned.
    async fn violation_count(
        &self,
        key: &str,
        now: f64,
        window_secs: f64,
    ) -> Result<u64, StoreError>;
}
