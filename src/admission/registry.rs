//! Tier limits and endpoint overrides.
//!
//! The registry is built once from configuration and answers the pure
//! question "what limit applies to this tier on this endpoint".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use super::tier::{EndpointOverride, Tier, TierLimit};
use crate::error::{Result, TurnstileError};

/// Limit configuration as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Base limit per tier
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<Tier, TierLimit>,
    /// Optional per-endpoint overrides keyed by endpoint identifier
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointOverride>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            endpoints: HashMap::new(),
        }
    }
}

fn default_tiers() -> HashMap<Tier, TierLimit> {
    Tier::ALL
        .into_iter()
        .map(|tier| (tier, TierLimit::default_for(tier)))
        .collect()
}

impl LimitsConfig {
    /// Load limits from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load limits from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse limit config: {}", e)))
    }
}

/// Resolved tier limits plus endpoint overrides.
#[derive(Debug, Clone)]
pub struct TierRegistry {
    tiers: HashMap<Tier, TierLimit>,
    endpoints: HashMap<String, EndpointOverride>,
}

impl TierRegistry {
    /// Build a registry, filling any missing tier with the anonymous limit.
    pub fn new(config: LimitsConfig) -> Self {
        let anonymous = config
            .tiers
            .get(&Tier::Anonymous)
            .copied()
            .unwrap_or_else(|| {
                warn!("No limit configured for tier 'anonymous', using built-in default");
                TierLimit::default_for(Tier::Anonymous)
            });

        let mut tiers = config.tiers;
        for tier in Tier::ALL {
            tiers.entry(tier).or_insert_with(|| {
                warn!(
                    tier = %tier,
                    max_requests = anonymous.max_requests,
                    window_secs = anonymous.window_secs,
                    "No limit configured for tier, falling back to anonymous limits"
                );
                anonymous
            });
        }

        Self {
            tiers,
            endpoints: config.endpoints,
        }
    }

    /// Resolve the limit for a tier on an endpoint.
    ///
    /// An endpoint override can only make the limit stricter: the smaller
    /// ceiling and the smaller window both win.
    pub fn resolve_effective_limit(&self, tier: Tier, endpoint_id: &str) -> TierLimit {
        let base = self.tier_limit(tier);
        match self.endpoints.get(endpoint_id) {
            Some(over) => base.narrow(over),
            None => base,
        }
    }

    /// Base limit for a tier.
    pub fn tier_limit(&self, tier: Tier) -> TierLimit {
        self.tiers
            .get(&tier)
            .or_else(|| self.tiers.get(&Tier::Anonymous))
            .copied()
            .unwrap_or_else(|| TierLimit::default_for(Tier::Anonymous))
    }

    /// Number of configured endpoint overrides.
    pub fn override_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new(LimitsConfig::default())
    }
}
