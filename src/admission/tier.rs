//! Subscription tiers and their limit tuples.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Privilege level of a caller.
///
/// Variants are declared from least to most privileged, so the derived
/// ordering matches the privilege ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Authenticated,
    Premium,
    Enterprise,
    Admin,
}

impl Tier {
    /// All tiers, least privileged first.
    pub const ALL: [Tier; 5] = [
        Tier::Anonymous,
        Tier::Authenticated,
        Tier::Premium,
        Tier::Enterprise,
        Tier::Admin,
    ];

    /// Stable lowercase name, also used as a key component.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
            Tier::Admin => "admin",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tier '{}'", s))
    }
}

/// A request ceiling over a fixed window.
///
/// Used both for per-tier base limits and per-endpoint overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Maximum requests admitted per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

/// Per-endpoint override; narrows the tier limit component-wise.
pub type EndpointOverride = TierLimit;

impl TierLimit {
    pub const fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    /// Window length as a `Duration`. A zero window is treated as one second.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    /// Component-wise minimum of two limits.
    pub fn narrow(&self, other: &TierLimit) -> TierLimit {
        TierLimit {
            max_requests: self.max_requests.min(other.max_requests),
            window_secs: self.window_secs.min(other.window_secs),
        }
    }

    /// Built-in limit for a tier, used when no configuration is supplied.
    pub fn default_for(tier: Tier) -> TierLimit {
        match tier {
            Tier::Anonymous => TierLimit::new(30, 60),
            Tier::Authenticated => TierLimit::new(100, 60),
            Tier::Premium => TierLimit::new(500, 60),
            Tier::Enterprise => TierLimit::new(2_000, 60),
            Tier::Admin => TierLimit::new(10_000, 60),
        }
    }
}
