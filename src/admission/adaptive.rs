//! Per-key limit reduction for keys that keep violating.

use serde::{Deserialize, Serialize};

use crate::store::WindowState;

/// Adaptive adjuster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Violation ratio above which the limit is reduced
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// Multiplier applied to the limit when reduced
    #[serde(default = "default_reduction")]
    pub reduction: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            reduction: default_reduction(),
        }
    }
}

fn default_sensitivity() -> f64 {
    0.8
}

fn default_reduction() -> f64 {
    0.5
}

/// Lowers a key's ceiling while its violation ratio stays high.
#[derive(Debug, Clone)]
pub struct AdaptiveAdjuster {
    sensitivity: f64,
    reduction: f64,
}

impl AdaptiveAdjuster {
    pub fn new(config: &AdaptiveConfig) -> Self {
        Self {
            sensitivity: config.sensitivity.max(0.0),
            reduction: config.reduction.clamp(0.0, 1.0),
        }
    }

    /// `violations / max(1, requests)` for the window.
    pub fn violation_ratio(state: &WindowState) -> f64 {
        state.violation_count as f64 / state.request_count.max(1) as f64
    }

    /// The limit for this key given its current window, never below 1.
    pub fn adjust(&self, effective_limit: u64, state: &WindowState) -> u64 {
        if Self::violation_ratio(state) > self.sensitivity {
            ((effective_limit as f64 * self.reduction).floor() as u64).max(1)
        } else {
            effective_limit
        }
    }
}

impl Default for AdaptiveAdjuster {
    fn default() -> Self {
        Self::new(&AdaptiveConfig::default())
    }
}
