//! Configuration for the admission control engine.
//!
//! Policy limits live in [`crate::policy::PolicySnapshot`] and are swapped
//! at runtime; the settings here are fixed at engine construction. File
//! watching and environment overrides are the host's concern; the engine
//! only consumes the validated result.

use serde::{Deserialize, Serialize};

use crate::breaker::FailureMode;
use crate::error::{FloodgateError, Result};

/// Main configuration for the admission control engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Client identity extraction settings
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Circuit breaker settings for backend calls
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Progressive penalty settings
    #[serde(default)]
    pub penalties: PenaltyConfig,

    /// Prefix for all backend keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Which window's Retry-After wins when several overlapping limits deny
    #[serde(default)]
    pub retry_after_preference: RetryAfterPreference,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            breaker: BreakerConfig::default(),
            penalties: PenaltyConfig::default(),
            key_prefix: default_key_prefix(),
            retry_after_preference: RetryAfterPreference::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "floodgate:".to_string()
}

/// Client identity extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Header carrying the proxied client address chain
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,

    /// Number of trailing forwarded-for entries appended by our own proxies
    #[serde(default)]
    pub trusted_proxy_depth: usize,

    /// Tier assigned to authenticated users without an explicit tier claim
    #[serde(default = "default_tier")]
    pub default_tier: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            forwarded_header: default_forwarded_header(),
            trusted_proxy_depth: 0,
            default_tier: default_tier(),
        }
    }
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_tier() -> String {
    "anonymous".to_string()
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before a half-open trial
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Behavior while the backend is bypassed
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Timeout for a single backend call in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Upper bound for the jittered delay before the single retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            failure_mode: FailureMode::default(),
            call_timeout_ms: default_call_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_call_timeout_ms() -> u64 {
    100
}

fn default_retry_delay_ms() -> u64 {
    25
}

/// Progressive penalty settings for repeat offenders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Whether violation tracking is active
    #[serde(default)]
    pub enabled: bool,

    /// Window in which violations count toward escalation, in seconds
    #[serde(default = "default_detection_window_secs")]
    pub detection_window_secs: u64,

    /// Violations within the window before escalation starts
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Escalation multipliers, indexed by violations past the threshold
    /// and clamped to the last entry
    #[serde(default = "default_multipliers")]
    pub multipliers: Vec<u32>,

    /// Hard cap on stored violation timestamps per client
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            detection_window_secs: default_detection_window_secs(),
            violation_threshold: default_violation_threshold(),
            multipliers: default_multipliers(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_detection_window_secs() -> u64 {
    300
}

fn default_violation_threshold() -> u32 {
    5
}

fn default_multipliers() -> Vec<u32> {
    vec![2, 4, 8, 16]
}

fn default_max_entries() -> usize {
    1000
}

/// Retry-After selection when several overlapping windows deny at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryAfterPreference {
    /// Report the soonest time any denying window frees up
    #[default]
    ShortestWindow,
    /// Report the latest time across denying windows
    LongestWindow,
}

impl EngineConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Reject parameter combinations that would be undefined at runtime.
    ///
    /// Validation happens here so that no numeric error can occur during
    /// request evaluation.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(FloodgateError::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.cooldown_secs == 0 {
            return Err(FloodgateError::Config(
                "breaker.cooldown_secs must be at least 1".to_string(),
            ));
        }
        if self.breaker.call_timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "breaker.call_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.penalties.enabled {
            if self.penalties.detection_window_secs == 0 {
                return Err(FloodgateError::Config(
                    "penalties.detection_window_secs must be at least 1".to_string(),
                ));
            }
            if self.penalties.violation_threshold == 0 {
                return Err(FloodgateError::Config(
                    "penalties.violation_threshold must be at least 1".to_string(),
                ));
            }
            if self.penalties.multipliers.is_empty() {
                return Err(FloodgateError::Config(
                    "penalties.multipliers must not be empty".to_string(),
                ));
            }
            if self.penalties.max_entries == 0 {
                return Err(FloodgateError::Config(
                    "penalties.max_entries must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_prefix, "floodgate:");
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(!config.penalties.enabled);
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
identity:
  trusted_proxy_depth: 1
breaker:
  failure_threshold: 3
  cooldown_secs: 10
  failure_mode: fail_closed
penalties:
  enabled: true
  violation_threshold: 2
  multipliers: [2, 4]
retry_after_preference: longest_window
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.identity.trusted_proxy_depth, 1);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.failure_mode, FailureMode::FailClosed);
        assert!(config.penalties.enabled);
        assert_eq!(config.penalties.multipliers, vec![2, 4]);
        assert_eq!(
            config.retry_after_preference,
            RetryAfterPreference::LongestWindow
        );
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let yaml = r#"
breaker:
  failure_threshold: 0
"#;
        let err = EngineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[test]
    fn test_empty_multiplier_table_rejected_when_enabled() {
        let yaml = r#"
penalties:
  enabled: true
  multipliers: []
"#;
        assert!(EngineConfig::from_yaml(yaml).is_err());

        // Disabled penalties do not require a table.
        let yaml = r#"
penalties:
  enabled: false
  multipliers: []
"#;
        assert!(EngineConfig::from_yaml(yaml).is_ok());
    }
}
