//! Violation tracking and temporary blocks.
//!
//! Each denial adds a violation to the key. From the escalation threshold on,
//! every further violation blocks the key for `base × 2^(violations -
//! threshold)`, capped at the maximum. Blocks expire lazily.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::key::AdmissionKey;
use crate::store::{add_duration, AccountingStore, StoreResult};

/// Escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationConfig {
    /// Violations before the first block
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u64,
    /// Length of the first block
    #[serde(default = "default_base_block_secs")]
    pub base_block_secs: u64,
    /// Upper bound on any block
    #[serde(default = "default_max_block_secs")]
    pub max_block_secs: u64,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: default_escalation_threshold(),
            base_block_secs: default_base_block_secs(),
            max_block_secs: default_max_block_secs(),
        }
    }
}

fn default_escalation_threshold() -> u64 {
    3
}

fn default_base_block_secs() -> u64 {
    60
}

fn default_max_block_secs() -> u64 {
    3600
}

/// Whether a key is blocked right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    pub blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Result of recording a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub violation_count: u64,
    /// Set when this violation created or extended a block
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Tracks violations and escalates them into blocks.
pub struct BlocklistManager {
    store: Arc<dyn AccountingStore>,
    threshold: u64,
    base: Duration,
    max: Duration,
}

impl BlocklistManager {
    pub fn new(store: Arc<dyn AccountingStore>, config: &ViolationConfig) -> Self {
        let base = Duration::from_secs(config.base_block_secs.max(1));
        Self {
            store,
            threshold: config.escalation_threshold.max(1),
            base,
            max: Duration::from_secs(config.max_block_secs).max(base),
        }
    }

    /// Block length for a key with `violations` recorded, if it should be
    /// blocked at all.
    pub fn block_duration(&self, violations: u64) -> Option<Duration> {
        if violations < self.threshold {
            return None;
        }
        let exponent = u32::try_from(violations - self.threshold).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    /// Check the blocklist before any accounting happens.
    pub async fn is_blocked(&self, key: &AdmissionKey, now: DateTime<Utc>) -> StoreResult<BlockStatus> {
        let blocked_until = self.store.blocked_until(key, now).await?;
        Ok(BlockStatus {
            blocked: blocked_until.is_some_and(|until| now < until),
            blocked_until,
        })
    }

    /// Record a denial and escalate into a block when warranted.
    ///
    /// `state_ttl` keeps the violation history alive as long as the window
    /// state it belongs to, counted from the end of any block this creates,
    /// so the next offence after a block escalates further.
    pub async fn record_violation(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
        state_ttl: Duration,
    ) -> StoreResult<ViolationOutcome> {
        let violation_count = self.store.record_violation(key, now, state_ttl).await?;

        let blocked_until = match self.block_duration(violation_count) {
            Some(duration) => {
                let until = self
                    .store
                    .extend_block(key, add_duration(now, duration), now, state_ttl)
                    .await?;
                warn!(
                    key = %key,
                    violations = violation_count,
                    block_secs = duration.as_secs(),
                    blocked_until = %until,
                    "Key blocked after repeated violations"
                );
                Some(until)
            }
            None => None,
        };

        Ok(ViolationOutcome {
            violation_count,
            blocked_until,
        })
    }

    /// Operator clear: drop the block and the violation history.
    pub async fn unblock(&self, key: &AdmissionKey) -> StoreResult<()> {
        self.store.clear_block(key).await?;
        info!(key = %key, "Key unblocked by operator");
        Ok(())
    }
}
