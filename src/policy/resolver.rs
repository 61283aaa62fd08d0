//! Policy resolution against an atomically swapped snapshot.
//!
//! The resolver owns the one piece of shared policy state in the engine.
//! Reloads replace the whole snapshot through an [`ArcSwap`], so readers
//! either see the old policy or the new one, never a mixture. Counters in
//! the backend are untouched by a reload; only future evaluations observe
//! the new limits.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::error::Result;
use crate::identity::ClientIdentity;

use super::rules::{LimitRule, PolicySnapshot};

/// Outcome of policy resolution for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Identity is on the exemption list; admit without touching counters
    Exempt,
    /// Apply this rule
    Limited(LimitRule),
}

/// Resolves effective limits from the current policy snapshot.
pub struct PolicyResolver {
    snapshot: ArcSwap<PolicySnapshot>,
}

impl PolicyResolver {
    /// Create a resolver with an initial snapshot.
    pub fn new(initial: PolicySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(initial),
        }
    }

    /// The currently installed snapshot.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// Install a new snapshot. In-flight evaluations keep the snapshot
    /// they already loaded.
    pub fn reload(&self, snapshot: PolicySnapshot) {
        self.snapshot.store(Arc::new(snapshot));
        info!("Policy snapshot reloaded");
    }

    /// Parse, validate, and install a snapshot from YAML.
    ///
    /// A rejected snapshot leaves the last-good one installed; reload
    /// failures are non-fatal by design.
    pub fn try_reload_yaml(&self, yaml: &str) -> Result<()> {
        match PolicySnapshot::from_yaml(yaml) {
            Ok(snapshot) => {
                self.reload(snapshot);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Rejected policy reload, keeping last-good snapshot");
                Err(e)
            }
        }
    }

    /// Resolve the effective policy for one request.
    ///
    /// The exemption check runs first and short-circuits; otherwise the
    /// rule follows endpoint > tier > default precedence.
    pub fn resolve(&self, endpoint: &str, identity: &ClientIdentity) -> Resolution {
        let snapshot = self.snapshot.load();
        if snapshot.is_exempt(identity) {
            return Resolution::Exempt;
        }
        Resolution::Limited(snapshot.rule_for(endpoint, identity).clone())
    }
}
