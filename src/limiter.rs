//! Admission algorithms and decision construction.
//!
//! The limiter is a thin dispatcher: the algorithm is selected once from
//! the resolved rule, the store does the atomic work, and the raw outcome
//! is translated into a [`Decision`]. When a rule carries overlapping
//! windows, every limit is evaluated against its own counter and the most
//! restrictive one decides.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::trace;

use crate::config::RetryAfterPreference;
use crate::policy::{Algorithm, LimitRule, LimitSpec};
use crate::store::{CounterStore, StoreError};

/// The outcome of one evaluation.
///
/// A value type: penalties and breaker bypasses build new decisions rather
/// than mutating one.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// The governing limit
    pub limit: u64,
    /// Requests remaining under the governing limit
    pub remaining: u64,
    /// When the governing window fully replenishes
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying; present only when denied
    pub retry_after: Option<u64>,
    /// Algorithm that produced the governing outcome
    pub algorithm: Algorithm,
}

impl Decision {
    /// Copy of this decision with a different retry delay.
    pub fn with_retry_after(&self, retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..self.clone()
        }
    }
}

/// Outcome of a single limit spec, before combination.
#[derive(Debug, Clone, Copy)]
struct SpecOutcome {
    allowed: bool,
    limit: u64,
    remaining: u64,
    window_secs: u64,
    reset_at: f64,
    retry_after: f64,
    algorithm: Algorithm,
}

/// Dispatches admission checks to the counter store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a limiter over the given store.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Evaluate every limit in `rule` for `key` and combine the outcomes.
    ///
    /// All limits must admit for the request to be allowed. Headers follow
    /// the most restrictive limit; on deny, `Retry-After` is chosen across
    /// denying limits per `preference`.
    pub async fn evaluate(
        &self,
        key: &str,
        rule: &LimitRule,
        cost: f64,
        now: f64,
        preference: RetryAfterPreference,
    ) -> Result<Decision, StoreError> {
        let outcomes = try_join_all(
            rule.limits
                .iter()
                .map(|spec| self.evaluate_spec(key, spec, cost, now)),
        )
        .await?;

        let allowed = outcomes.iter().all(|o| o.allowed);

        // Governing limit: smallest remaining share of its own window.
        let governing = outcomes
            .iter()
            .min_by(|a, b| {
                let ra = a.remaining as f64 / a.limit as f64;
                let rb = b.remaining as f64 / b.limit as f64;
                ra.total_cmp(&rb)
            })
            .copied()
            .unwrap_or_else(|| unreachable!("validated rules carry at least one limit"));

        let retry_after = if allowed {
            None
        } else {
            let denied = outcomes.iter().filter(|o| !o.allowed);
            let secs = match preference {
                RetryAfterPreference::ShortestWindow => denied
                    .map(|o| o.retry_after)
                    .fold(f64::INFINITY, f64::min),
                RetryAfterPreference::LongestWindow => {
                    denied.map(|o| o.retry_after).fold(0.0, f64::max)
                }
            };
            Some((secs.ceil() as u64).max(1))
        };

        trace!(
            key = %key,
            allowed = allowed,
            limit = governing.limit,
            remaining = governing.remaining,
            "Admission check complete"
        );

        Ok(Decision {
            allowed,
            limit: governing.limit,
            remaining: governing.remaining,
            reset_at: epoch_to_datetime(governing.reset_at),
            retry_after,
            algorithm: governing.algorithm,
        })
    }

    async fn evaluate_spec(
        &self,
        key: &str,
        spec: &LimitSpec,
        cost: f64,
        now: f64,
    ) -> Result<SpecOutcome, StoreError> {
        // Each window gets its own counter; TTL outlives the window so a
        // briefly idle key keeps its state.
        let counter_key = format!("{}:{}", key, spec.window_secs);
        let ttl = (spec.window_secs * 2) as f64;

        match spec.algorithm {
            Algorithm::TokenBucket => {
                let max_tokens = spec.limit as f64;
                let refill_rate = spec.refill_rate();
                let outcome = self
                    .store
                    .consume_tokens(&counter_key, max_tokens, refill_rate, cost, now, ttl)
                    .await?;

                // Time until the bucket is full again; doubles as the
                // conservative retry hint on deny.
                let until_full = (max_tokens - outcome.tokens) / refill_rate;
                Ok(SpecOutcome {
                    allowed: outcome.allowed,
                    limit: spec.limit,
                    remaining: outcome.tokens.floor() as u64,
                    window_secs: spec.window_secs,
                    reset_at: now + until_full,
                    retry_after: until_full,
                    algorithm: spec.algorithm,
                })
            }
            Algorithm::SlidingWindow => {
                let window = spec.window_secs as f64;
                let outcome = self
                    .store
                    .record_window(&counter_key, spec.limit, window, now, ttl)
                    .await?;

                // The window clears once its oldest entry ages out.
                let until_clear = outcome
                    .oldest
                    .map(|oldest| (oldest + window - now).max(0.0))
                    .unwrap_or(0.0);
                Ok(SpecOutcome {
                    allowed: outcome.allowed,
                    limit: spec.limit,
                    remaining: spec.limit.saturating_sub(outcome.count),
                    window_secs: spec.window_secs,
                    reset_at: now + until_clear,
                    retry_after: until_clear,
                    algorithm: spec.algorithm,
                })
            }
        }
    }
}

/// Convert fractional epoch seconds into a UTC timestamp.
fn epoch_to_datetime(epoch: f64) -> DateTime<Utc> {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::UNIX_EPOCH)
}
