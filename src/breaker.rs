//! Circuit breaker around counter store calls.
//!
//! Every store call runs under [`CircuitBreaker::guard`]: a timeout bounds
//! each attempt, transient errors get one retry, and sustained failure
//! opens the circuit so requests resolve immediately per the configured
//! failure mode instead of piling onto a dead backend.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::store::StoreError;

/// Behavior while the backend is bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit requests and log a warning (availability over enforcement)
    #[default]
    FailOpen,
    /// Deny requests until the backend recovers
    FailClosed,
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Backend bypassed until the cooldown elapses
    Open,
    /// One trial call probes for recovery
    HalfOpen,
}

/// Result of a guarded call.
#[derive(Debug)]
pub enum GuardOutcome<T> {
    /// The call reached the backend (possibly after the retry)
    Executed(T),
    /// The breaker rejected the call without touching the backend
    Rejected(FailureMode),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: f64,
    trial_started: Option<f64>,
}

/// Circuit breaker for the counter store.
///
/// The lock protects only the state bookkeeping before and after a call;
/// it is never held across the backend await.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: 0.0,
                trial_started: None,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// The configured bypass behavior.
    pub fn failure_mode(&self) -> FailureMode {
        self.config.failure_mode
    }

    /// Consecutive failures observed in the closed state.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Run `op` under the breaker.
    ///
    /// `now` is the caller's clock reading; cooldowns are measured against
    /// it so behavior stays deterministic under test clocks.
    pub async fn guard<T, F, Fut>(&self, now: f64, op: F) -> GuardOutcome<Result<T, StoreError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if !self.try_acquire(now) {
            return GuardOutcome::Rejected(self.config.failure_mode);
        }

        let result = self.call_with_retry(&op).await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                warn!(error = %e, "Backend call failed");
                self.record_failure(now);
            }
        }
        GuardOutcome::Executed(result)
    }

    /// Whether a call may proceed, transitioning Open → HalfOpen once the
    /// cooldown has elapsed.
    fn try_acquire(&self, now: f64) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now - inner.opened_at >= self.config.cooldown_secs as f64 {
                    debug!("Circuit cooldown elapsed, allowing one trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.trial_started {
                // A trial that never reported back (cancelled caller) must
                // not wedge the breaker; let another through after a full
                // cooldown.
                Some(started) if now - started < self.config.cooldown_secs as f64 => false,
                _ => {
                    inner.trial_started = Some(now);
                    true
                }
            },
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                debug!("Trial call succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.trial_started = None;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, now: f64) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("Trial call failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = now;
                inner.trial_started = None;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        mode = ?self.config.failure_mode,
                        "Failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = now;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// One bounded attempt plus a single jittered retry.
    async fn call_with_retry<T, F, Fut>(&self, op: &F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.attempt(op).await {
            Ok(value) => Ok(value),
            Err(first) => {
                debug!(error = %first, "Retrying backend call once");
                let jitter = rand::thread_rng().gen_range(0..=self.config.retry_delay_ms);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                self.attempt(op).await
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, op: &F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }
}
