//! Progressive penalties for repeat offenders.
//!
//! Violations are timestamps in a bounded, store-backed log per client.
//! Once a client crosses the violation threshold inside the detection
//! window, its retry delay is multiplied by an escalating factor. The
//! multiplier is a floor on cooldown only; the underlying counters keep
//! refilling on their own schedule.

use std::sync::Arc;

use tracing::debug;

use crate::config::PenaltyConfig;
use crate::identity::ClientIdentity;
use crate::store::{CounterStore, StoreError};

/// Tracks violations and computes escalation multipliers.
pub struct PenaltyTracker {
    store: Arc<dyn CounterStore>,
    config: PenaltyConfig,
    key_prefix: String,
}

impl PenaltyTracker {
    /// Create a tracker over the given store.
    pub fn new(store: Arc<dyn CounterStore>, config: PenaltyConfig, key_prefix: &str) -> Self {
        Self {
            store,
            config,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Whether violation tracking is active.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn key(&self, identity: &ClientIdentity) -> String {
        format!("{}penalty:{}", self.key_prefix, identity.key_part())
    }

    /// Record a violation and return the multiplier now in effect.
    ///
    /// The log is pruned to the detection window and capped; the key
    /// expires once the client stays quiet for a full window.
    pub async fn record_violation(
        &self,
        identity: &ClientIdentity,
        now: f64,
    ) -> Result<u32, StoreError> {
        let window = self.config.detection_window_secs as f64;
        let count = self
            .store
            .record_violation(
                &self.key(identity),
                now,
                window,
                self.config.max_entries,
                window,
            )
            .await?;

        let multiplier = self.multiplier_for(count);
        if multiplier > 1 {
            debug!(
                identity = %identity,
                violations = count,
                multiplier = multiplier,
                "Escalating penalty for repeat offender"
            );
        }
        Ok(multiplier)
    }

    /// Current multiplier without recording a violation.
    pub async fn multiplier(&self, identity: &ClientIdentity, now: f64) -> Result<u32, StoreError> {
        let window = self.config.detection_window_secs as f64;
        let count = self
            .store
            .violation_count(&self.key(identity), now, window)
            .await?;
        Ok(self.multiplier_for(count))
    }

    /// Map a violation count onto the escalation table.
    fn multiplier_for(&self, count: u64) -> u32 {
        let threshold = self.config.violation_threshold as u64;
        if count < threshold || self.config.multipliers.is_empty() {
            return 1;
        }
        let index = (count - threshold) as usize;
        self.config.multipliers[index.min(self.config.multipliers.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker(threshold: u32, multipliers: Vec<u32>) -> PenaltyTracker {
        PenaltyTracker::new(
            Arc::new(MemoryStore::new()),
            PenaltyConfig {
                enabled: true,
                detection_window_secs: 300,
                violation_threshold: threshold,
                multipliers,
                max_entries: 1000,
            },
            "test:",
        )
    }

    fn offender() -> ClientIdentity {
        ClientIdentity::Ip("203.0.113.9".parse().unwrap())
    }

    #[tokio::test]
    async fn test_below_threshold_no_escalation() {
        let tracker = tracker(3, vec![2, 4, 8]);
        let id = offender();

        assert_eq!(tracker.record_violation(&id, 1000.0).await.unwrap(), 1);
        assert_eq!(tracker.record_violation(&id, 1001.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_escalation_walks_the_table() {
        let tracker = tracker(3, vec![2, 4, 8]);
        let id = offender();

        tracker.record_violation(&id, 1000.0).await.unwrap();
        tracker.record_violation(&id, 1001.0).await.unwrap();
        // Third violation reaches the threshold: first table entry.
        assert_eq!(tracker.record_violation(&id, 1002.0).await.unwrap(), 2);
        assert_eq!(tracker.record_violation(&id, 1003.0).await.unwrap(), 4);
        assert_eq!(tracker.record_violation(&id, 1004.0).await.unwrap(), 8);
        // Past the table: clamped to the last entry.
        assert_eq!(tracker.record_violation(&id, 1005.0).await.unwrap(), 8);
        assert_eq!(tracker.record_violation(&id, 1006.0).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_multiplier_resets_after_quiet_window() {
        let tracker = tracker(2, vec![3]);
        let id = offender();

        tracker.record_violation(&id, 1000.0).await.unwrap();
        assert_eq!(tracker.record_violation(&id, 1001.0).await.unwrap(), 3);
        assert_eq!(tracker.multiplier(&id, 1002.0).await.unwrap(), 3);

        // A full detection window with no violations clears the log.
        assert_eq!(tracker.multiplier(&id, 1400.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clients_are_tracked_separately() {
        let tracker = tracker(1, vec![5]);
        let a = ClientIdentity::Ip("203.0.113.1".parse().unwrap());
        let b = ClientIdentity::Ip("203.0.113.2".parse().unwrap());

        assert_eq!(tracker.record_violation(&a, 1000.0).await.unwrap(), 5);
        assert_eq!(tracker.multiplier(&b, 1000.0).await.unwrap(), 1);
    }
}
