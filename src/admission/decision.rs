//! Pipeline input and output types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::{AdmissionKey, SubjectIdentity};
use super::tier::Tier;

/// Everything the pipeline needs to decide on one request.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub subject: SubjectIdentity,
    pub tier: Tier,
    pub endpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub geo: Option<String>,
}

impl AdmissionContext {
    /// A context stamped with the current time.
    pub fn new(subject: SubjectIdentity, tier: Tier, endpoint_id: impl Into<String>) -> Self {
        Self {
            subject,
            tier,
            endpoint_id: endpoint_id.into(),
            timestamp: Utc::now(),
            geo: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        self.geo = Some(geo.into());
        self
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Admitted,
    LimitExceeded,
    Burst,
    Blocked,
    /// Admitted because the decision could not be computed
    Degraded,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Admitted => "admitted",
            DecisionReason::LimitExceeded => "limit_exceeded",
            DecisionReason::Burst => "burst",
            DecisionReason::Blocked => "blocked",
            DecisionReason::Degraded => "degraded",
        }
    }
}

/// The admission verdict handed back to the middleware.
///
/// `allowed = false` maps to a 429 carrying `retry_after_seconds`;
/// `allowed = true` maps to rate-limit headers built from `remaining` and
/// `reset_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_seconds: Option<u64>,
    pub blocked: bool,
    pub effective_limit: u64,
    pub tier: Tier,
    pub key: AdmissionKey,
    pub reason: DecisionReason,
}

impl AdmissionDecision {
    pub fn is_degraded(&self) -> bool {
        self.reason == DecisionReason::Degraded
    }
}

/// Whole seconds from `now` until `until`, rounded up, at least 1.
pub(crate) fn seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let ms = (until - now).num_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}
