//! Policy snapshot configuration and matching.
//!
//! A snapshot holds every limit the engine can apply: the global default,
//! per-endpoint-pattern overrides, per-tier overrides, and the exemption
//! list. Snapshots are immutable: a reload builds a whole new snapshot
//! and swaps it in atomically (see [`super::resolver`]), so in-flight
//! evaluations never observe a partially updated policy.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::identity::ClientIdentity;

/// Admission algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuous refill with burst capacity (default)
    #[default]
    TokenBucket,
    /// Timestamped request log over a moving interval
    SlidingWindow,
}

impl Algorithm {
    /// Name used in logs and the decision contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

/// One limit: `limit` requests per `window_secs`, enforced by `algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Maximum requests allowed in the window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Admission algorithm for this limit
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl LimitSpec {
    /// Token refill rate implied by this limit, in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window_secs as f64
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(FloodgateError::Config(format!(
                "{}: limit must be at least 1",
                context
            )));
        }
        if self.window_secs == 0 {
            return Err(FloodgateError::Config(format!(
                "{}: window_secs must be at least 1",
                context
            )));
        }
        Ok(())
    }
}

/// A rule carrying one or more limits.
///
/// Several limits on one rule express overlapping windows (e.g. 100/min
/// and 1000/hour); the most restrictive decides admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Limits enforced together, all of which must admit
    pub limits: Vec<LimitSpec>,
    /// Optional name for logs
    #[serde(default)]
    pub name: Option<String>,
}

impl LimitRule {
    /// Single-limit rule with the default algorithm.
    pub fn per_window(limit: u64, window_secs: u64) -> Self {
        Self {
            limits: vec![LimitSpec {
                limit,
                window_secs,
                algorithm: Algorithm::default(),
            }],
            name: None,
        }
    }

    /// Single-limit rule with an explicit algorithm.
    pub fn with_algorithm(limit: u64, window_secs: u64, algorithm: Algorithm) -> Self {
        Self {
            limits: vec![LimitSpec {
                limit,
                window_secs,
                algorithm,
            }],
            name: None,
        }
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.limits.is_empty() {
            return Err(FloodgateError::Config(format!(
                "{}: at least one limit is required",
                context
            )));
        }
        for spec in &self.limits {
            spec.validate(context)?;
        }
        Ok(())
    }
}

/// A rule bound to an endpoint pattern.
///
/// Patterns are exact paths or trailing-`*` prefixes (`/api/v1/*`). When
/// several patterns match, exact beats wildcard and longer beats shorter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Endpoint pattern to match against the request path
    pub pattern: String,
    /// Limits applied on a match
    #[serde(flatten)]
    pub rule: LimitRule,
}

impl EndpointRule {
    fn matches(&self, path: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.pattern == path,
        }
    }

    fn is_exact(&self) -> bool {
        !self.pattern.ends_with('*')
    }
}

/// Identities never limited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExemptionConfig {
    /// Addresses or CIDR ranges, e.g. `203.0.113.5` or `10.0.0.0/8`
    #[serde(default)]
    pub networks: Vec<String>,
    /// Exempt user ids
    #[serde(default)]
    pub users: Vec<String>,
}

/// Immutable snapshot of the full limiting policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Rule applied when nothing more specific matches
    #[serde(rename = "default")]
    pub default_rule: LimitRule,

    /// Per-endpoint-pattern overrides
    #[serde(default)]
    pub endpoints: Vec<EndpointRule>,

    /// Per-tier overrides, keyed by tier name
    #[serde(default)]
    pub tiers: HashMap<String, LimitRule>,

    /// Exemption list
    #[serde(default)]
    pub exemptions: ExemptionConfig,

    /// Parsed exemption networks, built during validation
    #[serde(skip)]
    exempt_networks: Vec<IpNet>,
}

impl PolicySnapshot {
    /// Create a snapshot with only a default rule. Call [`validated`]
    /// after attaching endpoints, tiers, or exemptions.
    ///
    /// [`validated`]: PolicySnapshot::validated
    pub fn new(default_rule: LimitRule) -> Self {
        Self {
            default_rule,
            endpoints: Vec::new(),
            tiers: HashMap::new(),
            exemptions: ExemptionConfig::default(),
            exempt_networks: Vec::new(),
        }
    }

    /// Attach an endpoint-pattern rule.
    pub fn with_endpoint(mut self, pattern: &str, rule: LimitRule) -> Self {
        self.endpoints.push(EndpointRule {
            pattern: pattern.to_string(),
            rule,
        });
        self
    }

    /// Attach a tier rule.
    pub fn with_tier(mut self, tier: &str, rule: LimitRule) -> Self {
        self.tiers.insert(tier.to_string(), rule);
        self
    }

    /// Attach the exemption list.
    pub fn with_exemptions(mut self, exemptions: ExemptionConfig) -> Self {
        self.exemptions = exemptions;
        self
    }

    /// Load a snapshot from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let snapshot: PolicySnapshot = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy: {}", e)))?;
        snapshot.validated()
    }

    /// Load a snapshot from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy snapshot");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Validate every limit and compile the exemption networks.
    ///
    /// All numeric parameter errors are rejected here, before the snapshot
    /// can be installed, so they can never occur during evaluation.
    pub fn validated(mut self) -> Result<Self> {
        self.default_rule.validate("default rule")?;
        for endpoint in &self.endpoints {
            if endpoint.pattern.is_empty() {
                return Err(FloodgateError::Config(
                    "endpoint pattern must not be empty".to_string(),
                ));
            }
            endpoint
                .rule
                .validate(&format!("endpoint '{}'", endpoint.pattern))?;
        }
        for (tier, rule) in &self.tiers {
            rule.validate(&format!("tier '{}'", tier))?;
        }

        self.exempt_networks = Vec::with_capacity(self.exemptions.networks.len());
        for entry in &self.exemptions.networks {
            let net = parse_network(entry).ok_or_else(|| {
                FloodgateError::Config(format!(
                    "exemption '{}' is not a valid address or CIDR range",
                    entry
                ))
            })?;
            self.exempt_networks.push(net);
        }
        Ok(self)
    }

    /// Whether the identity is on the exemption list.
    pub fn is_exempt(&self, identity: &ClientIdentity) -> bool {
        match identity {
            ClientIdentity::Ip(ip) => self.exempt_networks.iter().any(|net| net.contains(ip)),
            ClientIdentity::User { id, .. } => self.exemptions.users.iter().any(|u| u == id),
        }
    }

    /// The effective rule for an endpoint and identity.
    ///
    /// Precedence: endpoint match (exact, then longest wildcard) over tier
    /// match over the global default.
    pub fn rule_for(&self, endpoint: &str, identity: &ClientIdentity) -> &LimitRule {
        let endpoint_match = self
            .endpoints
            .iter()
            .filter(|e| e.matches(endpoint))
            .max_by_key(|e| (e.is_exact(), e.pattern.len()));
        if let Some(rule) = endpoint_match {
            return &rule.rule;
        }

        if let Some(tier) = identity.tier() {
            if let Some(rule) = self.tiers.get(tier) {
                return rule;
            }
        }

        &self.default_rule
    }
}

/// Parse an exemption entry as CIDR notation, falling back to a bare
/// address treated as a /32 or /128.
fn parse_network(entry: &str) -> Option<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net);
    }
    match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => ipnet::Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
        Ok(IpAddr::V6(v6)) => ipnet::Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(addr: &str) -> ClientIdentity {
        ClientIdentity::Ip(addr.parse().unwrap())
    }

    fn user(id: &str, tier: &str) -> ClientIdentity {
        ClientIdentity::User {
            id: id.to_string(),
            tier: tier.to_string(),
        }
    }

    #[test]
    fn test_parse_simple_policy() {
        let yaml = r#"
default:
  limits:
    - limit: 100
      window_secs: 60
"#;
        let snapshot = PolicySnapshot::from_yaml(yaml).unwrap();
        assert_eq!(snapshot.default_rule.limits[0].limit, 100);
        assert_eq!(
            snapshot.default_rule.limits[0].algorithm,
            Algorithm::TokenBucket
        );
    }

    #[test]
    fn test_parse_full_policy() {
        let yaml = r#"
default:
  limits:
    - limit: 100
      window_secs: 60
endpoints:
  - pattern: /api/v1/search
    name: search
    limits:
      - limit: 10
        window_secs: 60
        algorithm: sliding_window
  - pattern: /api/v1/*
    limits:
      - limit: 50
        window_secs: 60
tiers:
  premium:
    limits:
      - limit: 1000
        window_secs: 60
      - limit: 10000
        window_secs: 3600
exemptions:
  networks:
    - 203.0.113.5
    - 10.0.0.0/8
  users:
    - health-checker
"#;
        let snapshot = PolicySnapshot::from_yaml(yaml).unwrap();
        assert_eq!(snapshot.endpoints.len(), 2);
        assert_eq!(snapshot.tiers["premium"].limits.len(), 2);
        assert_eq!(
            snapshot.endpoints[0].rule.limits[0].algorithm,
            Algorithm::SlidingWindow
        );
        assert_eq!(snapshot.endpoints[0].rule.name.as_deref(), Some("search"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = r#"
default:
  limits:
    - limit: 0
      window_secs: 60
"#;
        assert!(PolicySnapshot::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
default:
  limits:
    - limit: 10
      window_secs: 0
"#;
        assert!(PolicySnapshot::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_limits_rejected() {
        let yaml = r#"
default:
  limits: []
"#;
        assert!(PolicySnapshot::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_exemption_network_rejected() {
        let snapshot = PolicySnapshot::new(LimitRule::per_window(10, 60)).with_exemptions(
            ExemptionConfig {
                networks: vec!["not-a-network".to_string()],
                users: Vec::new(),
            },
        );
        assert!(snapshot.validated().is_err());
    }

    #[test]
    fn test_endpoint_beats_tier_beats_default() {
        let snapshot = PolicySnapshot::new(LimitRule::per_window(100, 60))
            .with_endpoint("/api/v1/search", LimitRule::per_window(10, 60))
            .with_tier("premium", LimitRule::per_window(1000, 60))
            .validated()
            .unwrap();

        let premium = user("u1", "premium");

        // Endpoint match wins even for the premium tier.
        let rule = snapshot.rule_for("/api/v1/search", &premium);
        assert_eq!(rule.limits[0].limit, 10);

        // No endpoint match: tier applies.
        let rule = snapshot.rule_for("/api/v1/other", &premium);
        assert_eq!(rule.limits[0].limit, 1000);

        // No endpoint or tier match: default applies.
        let rule = snapshot.rule_for("/api/v1/other", &ip("203.0.113.9"));
        assert_eq!(rule.limits[0].limit, 100);
    }

    #[test]
    fn test_exact_match_beats_wildcard() {
        let snapshot = PolicySnapshot::new(LimitRule::per_window(100, 60))
            .with_endpoint("/api/v1/*", LimitRule::per_window(50, 60))
            .with_endpoint("/api/v1/search", LimitRule::per_window(10, 60))
            .validated()
            .unwrap();

        let rule = snapshot.rule_for("/api/v1/search", &ip("203.0.113.9"));
        assert_eq!(rule.limits[0].limit, 10);

        let rule = snapshot.rule_for("/api/v1/users", &ip("203.0.113.9"));
        assert_eq!(rule.limits[0].limit, 50);
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let snapshot = PolicySnapshot::new(LimitRule::per_window(100, 60))
            .with_endpoint("/api/*", LimitRule::per_window(80, 60))
            .with_endpoint("/api/v1/admin/*", LimitRule::per_window(5, 60))
            .validated()
            .unwrap();

        let rule = snapshot.rule_for("/api/v1/admin/keys", &ip("203.0.113.9"));
        assert_eq!(rule.limits[0].limit, 5);

        let rule = snapshot.rule_for("/api/v2/items", &ip("203.0.113.9"));
        assert_eq!(rule.limits[0].limit, 80);
    }

    #[test]
    fn test_exemption_by_address_and_cidr() {
        let snapshot = PolicySnapshot::new(LimitRule::per_window(10, 60))
            .with_exemptions(ExemptionConfig {
                networks: vec!["203.0.113.5".to_string(), "10.0.0.0/8".to_string()],
                users: vec!["health-checker".to_string()],
            })
            .validated()
            .unwrap();

        assert!(snapshot.is_exempt(&ip("203.0.113.5")));
        assert!(snapshot.is_exempt(&ip("10.1.2.3")));
        assert!(!snapshot.is_exempt(&ip("203.0.113.6")));
        assert!(snapshot.is_exempt(&user("health-checker", "anonymous")));
        assert!(!snapshot.is_exempt(&user("someone-else", "anonymous")));
    }

    #[test]
    fn test_refill_rate() {
        let spec = LimitSpec {
            limit: 120,
            window_secs: 60,
            algorithm: Algorithm::TokenBucket,
        };
        assert!((spec.refill_rate() - 2.0).abs() < f64::EPSILON);
    }
}
