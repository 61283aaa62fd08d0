//! Decision orchestration.
//!
//! The gateway wires identity extraction, policy resolution, the guarded
//! limiter, and penalty escalation into a single `evaluate` call. Every
//! path terminates in an [`Evaluation`]; backend faults resolve through
//! the breaker's failure mode and never reach the host as errors.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, FailureMode, GuardOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::identity::{AuthClaims, ClientIdentity, IdentityResolver};
use crate::limiter::{Decision, RateLimiter};
use crate::penalty::PenaltyTracker;
use crate::policy::{Algorithm, LimitRule, PolicyResolver, PolicySnapshot, Resolution};
use crate::store::CounterStore;

/// Request metadata handed in by the host framework's middleware layer.
///
/// The engine never parses raw HTTP: headers arrive as a map, the peer
/// address from the connection, and auth claims already decoded.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request path used for endpoint policy matching
    pub endpoint: String,
    /// Remote address of the connection
    pub peer_addr: IpAddr,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Decoded auth claims, if the request carried any
    pub claims: Option<AuthClaims>,
    /// Units this request consumes (default 1)
    pub cost: f64,
}

impl RequestContext {
    /// Context for a request with no headers, claims, or extra cost.
    pub fn new(endpoint: &str, peer_addr: IpAddr) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            peer_addr,
            headers: HashMap::new(),
            claims: None,
            cost: 1.0,
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Attach decoded auth claims.
    pub fn with_claims(mut self, claims: AuthClaims) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Override the request cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Machine-readable deny payload for the host to serialize as its 429
/// equivalent. Carries no backend or configuration detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyBody {
    /// Stable error identifier
    pub error_code: String,
    /// Human-oriented summary
    pub message: String,
    /// Seconds the client should wait
    pub retry_after_seconds: u64,
}

/// A complete evaluation: the decision plus the response surface.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The admission decision
    pub decision: Decision,
    /// Rate limit headers for every response; `Retry-After` on deny only
    pub headers: HashMap<String, String>,
    /// Deny payload, present only when the request is rejected
    pub body: Option<DenyBody>,
}

/// Orchestrates a full admission decision per request.
pub struct DecisionGateway {
    config: EngineConfig,
    identifier: IdentityResolver,
    resolver: PolicyResolver,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    penalties: PenaltyTracker,
    clock: Arc<dyn Clock>,
}

impl DecisionGateway {
    /// Create a gateway over the given store and initial policy.
    pub fn new(
        config: EngineConfig,
        snapshot: PolicySnapshot,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        Self::with_clock(config, snapshot, store, Arc::new(SystemClock::new()))
    }

    /// Create a gateway with an explicit clock (used by tests).
    pub fn with_clock(
        config: EngineConfig,
        snapshot: PolicySnapshot,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let identifier = IdentityResolver::new(config.identity.clone());
        let resolver = PolicyResolver::new(snapshot);
        let limiter = RateLimiter::new(store.clone());
        let breaker = CircuitBreaker::new(config.breaker.clone());
        let penalties = PenaltyTracker::new(store, config.penalties.clone(), &config.key_prefix);

        Ok(Self {
            config,
            identifier,
            resolver,
            limiter,
            breaker,
            penalties,
            clock,
        })
    }

    /// The policy resolver, for installing reloaded snapshots.
    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Evaluate one request.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Evaluation {
        let now = self.clock.now();
        let identity = self
            .identifier
            .resolve(&ctx.headers, ctx.peer_addr, ctx.claims.as_ref());

        let rule = match self.resolver.resolve(&ctx.endpoint, &identity) {
            Resolution::Exempt => {
                debug!(identity = %identity, endpoint = %ctx.endpoint, "Identity exempt, admitting");
                return self.exempt_evaluation(now);
            }
            Resolution::Limited(rule) => rule,
        };

        // scope:identifier:endpoint; each window appends its own suffix
        // inside the limiter.
        let key = format!(
            "{}{}:{}",
            self.config.key_prefix,
            identity.key_part(),
            ctx.endpoint
        );

        let outcome = self
            .breaker
            .guard(now, || {
                self.limiter.evaluate(
                    &key,
                    &rule,
                    ctx.cost,
                    now,
                    self.config.retry_after_preference,
                )
            })
            .await;

        let decision = match outcome {
            GuardOutcome::Executed(Ok(decision)) => decision,
            GuardOutcome::Executed(Err(_)) | GuardOutcome::Rejected(_) => {
                return self.bypass_evaluation(&identity, &ctx.endpoint, &rule, now);
            }
        };

        if decision.allowed {
            debug!(
                identity = %identity,
                endpoint = %ctx.endpoint,
                remaining = decision.remaining,
                "Request admitted"
            );
            return Self::finish(decision);
        }

        let decision = self.apply_penalty(&identity, decision, now).await;
        info!(
            identity = %identity,
            endpoint = %ctx.endpoint,
            limit = decision.limit,
            retry_after = ?decision.retry_after,
            "Request denied"
        );
        Self::finish(decision)
    }

    /// Multiply the retry delay for repeat offenders. Penalty bookkeeping
    /// runs under the breaker like every store call; when it cannot run,
    /// the base delay stands.
    async fn apply_penalty(
        &self,
        identity: &ClientIdentity,
        decision: Decision,
        now: f64,
    ) -> Decision {
        if !self.penalties.enabled() {
            return decision;
        }

        let multiplier = match self
            .breaker
            .guard(now, || self.penalties.record_violation(identity, now))
            .await
        {
            GuardOutcome::Executed(Ok(multiplier)) => multiplier,
            GuardOutcome::Executed(Err(_)) | GuardOutcome::Rejected(_) => 1,
        };

        if multiplier > 1 {
            let base = decision.retry_after.unwrap_or(1);
            decision.with_retry_after(base.saturating_mul(multiplier as u64))
        } else {
            decision
        }
    }

    /// Allow-everything evaluation for exempt identities; no counter is
    /// touched.
    fn exempt_evaluation(&self, now: f64) -> Evaluation {
        let decision = Decision {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: epoch_to_datetime(now),
            retry_after: None,
            algorithm: Algorithm::TokenBucket,
        };
        Self::finish(decision)
    }

    /// Resolve per failure mode while the backend is unusable.
    fn bypass_evaluation(
        &self,
        identity: &ClientIdentity,
        endpoint: &str,
        rule: &LimitRule,
        now: f64,
    ) -> Evaluation {
        let spec = &rule.limits[0];
        let decision = match self.breaker.failure_mode() {
            FailureMode::FailOpen => {
                warn!(
                    identity = %identity,
                    endpoint = %endpoint,
                    "Counter backend unavailable, failing open"
                );
                Decision {
                    allowed: true,
                    limit: spec.limit,
                    remaining: 0,
                    reset_at: epoch_to_datetime(now + spec.window_secs as f64),
                    retry_after: None,
                    algorithm: spec.algorithm,
                }
            }
            FailureMode::FailClosed => {
                let cooldown = self.config.breaker.cooldown_secs;
                warn!(
                    identity = %identity,
                    endpoint = %endpoint,
                    "Counter backend unavailable, failing closed"
                );
                Decision {
                    allowed: false,
                    limit: spec.limit,
                    remaining: 0,
                    reset_at: epoch_to_datetime(now + cooldown as f64),
                    retry_after: Some(cooldown),
                    algorithm: spec.algorithm,
                }
            }
        };
        Self::finish_with_code(
            decision,
            "admission_unavailable",
            "Requests are temporarily limited. Please retry shortly.",
        )
    }

    fn finish(decision: Decision) -> Evaluation {
        Self::finish_with_code(
            decision,
            "rate_limit_exceeded",
            "Too many requests. Please slow down.",
        )
    }

    fn finish_with_code(decision: Decision, error_code: &str, message: &str) -> Evaluation {
        let headers = response_headers(&decision);
        let body = (!decision.allowed).then(|| DenyBody {
            error_code: error_code.to_string(),
            message: message.to_string(),
            retry_after_seconds: decision.retry_after.unwrap_or(1),
        });
        Evaluation {
            decision,
            headers,
            body,
        }
    }
}

/// Standard rate limit headers for a decision.
fn response_headers(decision: &Decision) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("X-RateLimit-Limit".to_string(), decision.limit.to_string());
    headers.insert(
        "X-RateLimit-Remaining".to_string(),
        decision.remaining.to_string(),
    );
    headers.insert(
        "X-RateLimit-Reset".to_string(),
        decision.reset_at.timestamp().to_string(),
    );
    if let Some(retry_after) = decision.retry_after {
        headers.insert("Retry-After".to_string(), retry_after.to_string());
    }
    headers
}

fn epoch_to_datetime(epoch: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch.floor() as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BreakerConfig, PenaltyConfig};
    use crate::policy::ExemptionConfig;
    use crate::store::{
        BucketOutcome, MemoryStore, StoreError, WindowOutcome,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A store where the backend is down.
    #[derive(Debug, Default)]
    struct DeadStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CounterStore for DeadStore {
        async fn consume_tokens(
            &self,
            _key: &str,
            _max_tokens: f64,
            _refill_rate: f64,
            _requested: f64,
            _now: f64,
            _ttl_secs: f64,
        ) -> std::result::Result<BucketOutcome, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn record_window(
            &self,
            _key: &str,
            _limit: u64,
            _window_secs: f64,
            _now: f64,
            _ttl_secs: f64,
        ) -> std::result::Result<WindowOutcome, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn record_violation(
            &self,
            _key: &str,
            _now: f64,
            _window_secs: f64,
            _max_entries: usize,
            _ttl_secs: f64,
        ) -> std::result::Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn violation_count(
            &self,
            _key: &str,
            _now: f64,
            _window_secs: f64,
        ) -> std::result::Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn snapshot(limit: u64, window: u64) -> PolicySnapshot {
        PolicySnapshot::new(LimitRule::per_window(limit, window))
            .validated()
            .unwrap()
    }

    fn gateway_with(
        config: EngineConfig,
        snapshot: PolicySnapshot,
        store: Arc<dyn CounterStore>,
        clock: Arc<ManualClock>,
    ) -> DecisionGateway {
        DecisionGateway::with_clock(config, snapshot, store, clock).unwrap()
    }

    fn ctx(path: &str, addr: &str) -> RequestContext {
        RequestContext::new(path, addr.parse().unwrap())
    }

    #[tokio::test]
    async fn test_burst_scenario() {
        // limit=5/60s: five immediate requests pass, the sixth is denied
        // with Retry-After about one window.
        let clock = Arc::new(ManualClock::new(1000.0));
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot(5, 60),
            Arc::new(MemoryStore::new()),
            clock,
        );

        for i in 0..5 {
            let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
            assert!(eval.decision.allowed, "request {} should pass", i);
            assert!(eval.body.is_none());
            assert_eq!(eval.headers["X-RateLimit-Limit"], "5");
        }

        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(!eval.decision.allowed);
        assert_eq!(eval.headers["X-RateLimit-Remaining"], "0");
        assert_eq!(eval.headers["Retry-After"], "60");

        let body = eval.body.unwrap();
        assert_eq!(body.error_code, "rate_limit_exceeded");
        assert_eq!(body.retry_after_seconds, 60);
    }

    #[tokio::test]
    async fn test_refill_after_half_window() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot(100, 60),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );

        for _ in 0..100 {
            assert!(
                gateway
                    .evaluate(&ctx("/api/items", "203.0.113.9"))
                    .await
                    .decision
                    .allowed
            );
        }
        assert!(
            !gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );

        clock.advance(30.0);
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(eval.decision.allowed);
        assert_eq!(eval.decision.remaining, 49);
    }

    #[tokio::test]
    async fn test_exempt_identity_always_admitted() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let snapshot = PolicySnapshot::new(LimitRule::per_window(1, 60))
            .with_exemptions(ExemptionConfig {
                networks: vec!["203.0.113.5".to_string()],
                users: Vec::new(),
            })
            .validated()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway_with(EngineConfig::default(), snapshot, store.clone(), clock);

        // Far past the limit, every request is admitted and no counter is
        // ever created.
        for _ in 0..10 {
            let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.5")).await;
            assert!(eval.decision.allowed);
        }
        assert_eq!(store.key_count(), 0);

        // A non-exempt neighbor is limited as usual.
        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.6"))
                .await
                .decision
                .allowed
        );
        assert!(
            !gateway
                .evaluate(&ctx("/api/items", "203.0.113.6"))
                .await
                .decision
                .allowed
        );
    }

    #[tokio::test]
    async fn test_identities_get_separate_counters() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot(1, 60),
            Arc::new(MemoryStore::new()),
            clock,
        );

        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.1"))
                .await
                .decision
                .allowed
        );
        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.2"))
                .await
                .decision
                .allowed
        );
        // Same identity, different endpoint: separate counter as well.
        assert!(
            gateway
                .evaluate(&ctx("/api/other", "203.0.113.1"))
                .await
                .decision
                .allowed
        );
        assert!(
            !gateway
                .evaluate(&ctx("/api/items", "203.0.113.1"))
                .await
                .decision
                .allowed
        );
    }

    #[tokio::test]
    async fn test_fail_open_when_backend_down() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot(5, 60),
            Arc::new(DeadStore::default()),
            clock,
        );

        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(eval.decision.allowed);
        assert!(eval.body.is_none());
    }

    #[tokio::test]
    async fn test_fail_closed_when_backend_down() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let config = EngineConfig {
            breaker: BreakerConfig {
                failure_mode: FailureMode::FailClosed,
                cooldown_secs: 30,
                ..BreakerConfig::default()
            },
            ..EngineConfig::default()
        };
        let gateway = gateway_with(config, snapshot(5, 60), Arc::new(DeadStore::default()), clock);

        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(!eval.decision.allowed);
        assert_eq!(eval.decision.retry_after, Some(30));

        let body = eval.body.unwrap();
        assert_eq!(body.error_code, "admission_unavailable");
    }

    #[tokio::test]
    async fn test_open_circuit_stops_touching_backend() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let store = Arc::new(DeadStore::default());
        let config = EngineConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                ..BreakerConfig::default()
            },
            ..EngineConfig::default()
        };
        let gateway = gateway_with(config, snapshot(5, 60), store.clone(), clock);

        // Each failed evaluation makes two attempts (retry-once); after
        // two evaluations the circuit is open.
        gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        let calls_when_open = store.calls.load(Ordering::SeqCst);

        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(eval.decision.allowed);
        assert_eq!(store.calls.load(Ordering::SeqCst), calls_when_open);
    }

    #[tokio::test]
    async fn test_penalty_escalates_retry_after() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let config = EngineConfig {
            penalties: PenaltyConfig {
                enabled: true,
                detection_window_secs: 300,
                violation_threshold: 2,
                multipliers: vec![3, 5],
                max_entries: 1000,
            },
            ..EngineConfig::default()
        };
        let gateway = gateway_with(
            config,
            snapshot(1, 60),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );

        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );

        // First violation: below threshold, base Retry-After stands.
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert_eq!(eval.decision.retry_after, Some(60));

        // Second violation reaches the threshold: base multiplied by 3.
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert_eq!(eval.decision.retry_after, Some(180));

        // Third: next escalation tier.
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert_eq!(eval.decision.retry_after, Some(300));

        // Quiet for a full detection window: escalation resets.
        clock.advance(400.0);
        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert_eq!(eval.decision.retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_deny_body_serializes_cleanly() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot(1, 60),
            Arc::new(MemoryStore::new()),
            clock,
        );

        gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;

        let json = serde_json::to_value(eval.body.unwrap()).unwrap();
        assert_eq!(json["error_code"], "rate_limit_exceeded");
        assert_eq!(json["retry_after_seconds"], 60);
        // The payload is the whole surface: no backend detail leaks.
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reload_changes_limits_but_not_counters() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot(2, 60),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );

        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );
        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );
        assert!(
            !gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );

        // Raise the limit. The new policy is observed immediately, but the
        // drained counter keeps its state: no free tokens appear.
        gateway.resolver().reload(snapshot(5, 60));
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(!eval.decision.allowed);
        assert_eq!(eval.decision.limit, 5);

        // Refill now runs at the new rate: 30s at 5/60s is enough for two
        // more requests.
        clock.advance(30.0);
        let eval = gateway.evaluate(&ctx("/api/items", "203.0.113.9")).await;
        assert!(eval.decision.allowed);
        assert_eq!(eval.decision.limit, 5);
    }

    #[tokio::test]
    async fn test_tiered_policy_applies_to_claimed_user() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let snapshot = PolicySnapshot::new(LimitRule::per_window(1, 60))
            .with_tier("premium", LimitRule::per_window(100, 60))
            .validated()
            .unwrap();
        let gateway = gateway_with(
            EngineConfig::default(),
            snapshot,
            Arc::new(MemoryStore::new()),
            clock,
        );

        let premium = ctx("/api/items", "203.0.113.9").with_claims(AuthClaims {
            subject: Some("user-1".to_string()),
            tier: Some("premium".to_string()),
        });
        for _ in 0..10 {
            assert!(gateway.evaluate(&premium).await.decision.allowed);
        }

        // Anonymous traffic from the same address stays on the default.
        assert!(
            gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );
        assert!(
            !gateway
                .evaluate(&ctx("/api/items", "203.0.113.9"))
                .await
                .decision
                .allowed
        );
    }
}
