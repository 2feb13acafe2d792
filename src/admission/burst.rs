//! Sub-window burst detection.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::WindowUpdate;

/// Source of retry jitter for burst denials.
pub trait JitterSource: Send + Sync {
    /// A value in `0..=max`.
    fn jitter(&self, max: u64) -> u64;
}

/// `StdRng`-backed jitter; deterministic when built from a seed.
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl JitterSource for SeededJitter {
    fn jitter(&self, max: u64) -> u64 {
        if max == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..=max)
    }
}

/// Burst guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Requests closer together than this count as rapid
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Requests already in the window before rapid arrivals are denied
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u64,
    /// Fixed part of the retry delay
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Upper bound of the random part of the retry delay
    #[serde(default = "default_retry_jitter_secs")]
    pub retry_jitter_secs: u64,
    /// Seed for the jitter source; random when absent
    #[serde(default)]
    pub jitter_seed: Option<u64>,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            burst_limit: default_burst_limit(),
            retry_base_secs: default_retry_base_secs(),
            retry_jitter_secs: default_retry_jitter_secs(),
            jitter_seed: None,
        }
    }
}

fn default_min_interval_ms() -> u64 {
    100
}

fn default_burst_limit() -> u64 {
    10
}

fn default_retry_base_secs() -> u64 {
    1
}

fn default_retry_jitter_secs() -> u64 {
    2
}

/// Flags keys that fire requests faster than the minimum inter-arrival
/// interval once they already have a burst's worth of requests in the window.
pub struct BurstGuard {
    min_interval: Duration,
    burst_limit: u64,
    retry_base_secs: u64,
    retry_jitter_secs: u64,
    jitter: Box<dyn JitterSource>,
}

impl BurstGuard {
    pub fn new(config: &BurstConfig) -> Self {
        let jitter: Box<dyn JitterSource> = match config.jitter_seed {
            Some(seed) => Box::new(SeededJitter::from_seed(seed)),
            None => Box::new(SeededJitter::from_entropy()),
        };
        Self::with_jitter(config, jitter)
    }

    pub fn with_jitter(config: &BurstConfig, jitter: Box<dyn JitterSource>) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            burst_limit: config.burst_limit,
            retry_base_secs: config.retry_base_secs.max(1),
            retry_jitter_secs: config.retry_jitter_secs,
            jitter,
        }
    }

    /// Whether this request, given the window as it stood before it, is part
    /// of a burst.
    pub fn is_burst_violation(&self, prior: &WindowUpdate, now: DateTime<Utc>) -> bool {
        let Some(previous) = prior.prior_request_at else {
            return false;
        };
        if prior.prior_count < self.burst_limit {
            return false;
        }
        let gap = (now - previous).num_milliseconds().max(0) as u128;
        gap < self.min_interval.as_millis()
    }

    /// Short randomized retry delay for a burst denial.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_base_secs + self.jitter.jitter(self.retry_jitter_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn prior(count: u64, last_ms: Option<i64>) -> WindowUpdate {
        WindowUpdate {
            admitted_count: count + 1,
            window_start: at(0),
            prior_count: count,
            prior_request_at: last_ms.map(at),
            violation_count: 0,
        }
    }

    fn guard() -> BurstGuard {
        BurstGuard::new(&BurstConfig {
            jitter_seed: Some(7),
            ..Default::default()
        })
    }

    #[test]
    fn test_rapid_requests_below_burst_limit_pass() {
        assert!(!guard().is_burst_violation(&prior(9, Some(0)), at(5)));
    }

    #[test]
    fn test_rapid_requests_at_burst_limit_are_flagged() {
        assert!(guard().is_burst_violation(&prior(10, Some(0)), at(5)));
    }

    #[test]
    fn test_spaced_requests_are_not_flagged() {
        assert!(!guard().is_burst_violation(&prior(50, Some(0)), at(100)));
        assert!(!guard().is_burst_violation(&prior(50, Some(0)), at(250)));
    }

    #[test]
    fn test_first_request_is_never_a_burst() {
        assert!(!guard().is_burst_violation(&prior(50, None), at(0)));
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let guard = guard();
        for _ in 0..100 {
            let delay = guard.retry_after_secs();
            assert!((1..=3).contains(&delay));
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let a = SeededJitter::from_seed(42);
        let b = SeededJitter::from_seed(42);
        let xs: Vec<u64> = (0..20).map(|_| a.jitter(10)).collect();
        let ys: Vec<u64> = (0..20).map(|_| b.jitter(10)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_zero_jitter_range() {
        assert_eq!(SeededJitter::from_seed(1).jitter(0), 0);
    }
}
