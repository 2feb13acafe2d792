//! Configuration management for Turnstile.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `TURNSTILE__`-prefixed environment variables, with `__` separating nested
//! keys (`TURNSTILE__STORE__REDIS_URL`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::admission::{
    AdaptiveConfig, BurstConfig, LimitsConfig, ObservabilityConfig, PipelineConfig,
    ViolationConfig,
};
use crate::error::{Result, TurnstileError};
use crate::store::RedisStoreConfig;

const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Tier limits and endpoint overrides
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub burst: BurstConfig,

    /// Violation escalation
    #[serde(default)]
    pub violations: ViolationConfig,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Accounting store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Shared Redis store; process-local accounting only when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single shared store call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long the shared store is skipped after a failure
    #[serde(default = "default_unhealthy_cooldown_ms")]
    pub unhealthy_cooldown_ms: u64,

    /// Maximum keys held by the local cache
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    /// Interval between sweeps of expired local entries
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            unhealthy_cooldown_ms: default_unhealthy_cooldown_ms(),
            local_capacity: default_local_capacity(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        Duration::from_millis(self.unhealthy_cooldown_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Redis settings, if a shared store is configured.
    pub fn redis(&self) -> Option<RedisStoreConfig> {
        self.redis_url.as_ref().map(|url| RedisStoreConfig {
            url: url.clone(),
            key_prefix: self.key_prefix.clone(),
        })
    }
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

fn default_timeout_ms() -> u64 {
    25
}

fn default_unhealthy_cooldown_ms() -> u64 {
    5_000
}

fn default_local_capacity() -> usize {
    10_000
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR);
        Self::load_with_env(path, env)
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce sensible decisions.
    pub fn validate(&self) -> Result<()> {
        for (tier, limit) in &self.limits.tiers {
            if limit.max_requests == 0 {
                return Err(TurnstileError::Config(format!(
                    "tier '{}' must allow at least one request",
                    tier
                )));
            }
        }
        for (endpoint, limit) in &self.limits.endpoints {
            if limit.max_requests == 0 {
                return Err(TurnstileError::Config(format!(
                    "endpoint '{}' must allow at least one request",
                    endpoint
                )));
            }
        }
        if !(self.adaptive.reduction > 0.0 && self.adaptive.reduction <= 1.0) {
            return Err(TurnstileError::Config(
                "adaptive.reduction must be in (0, 1]".to_string(),
            ));
        }
        if self.adaptive.sensitivity < 0.0 {
            return Err(TurnstileError::Config(
                "adaptive.sensitivity must not be negative".to_string(),
            ));
        }
        if self.violations.escalation_threshold == 0 {
            return Err(TurnstileError::Config(
                "violations.escalation_threshold must be at least 1".to_string(),
            ));
        }
        if self.violations.max_block_secs < self.violations.base_block_secs {
            return Err(TurnstileError::Config(
                "violations.max_block_secs must not be below base_block_secs".to_string(),
            ));
        }
        if self.store.local_capacity == 0 {
            return Err(TurnstileError::Config(
                "store.local_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for the admission pipeline.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            limits: self.limits.clone(),
            burst: self.burst.clone(),
            violations: self.violations.clone(),
            adaptive: self.adaptive.clone(),
            observability: self.observability.clone(),
        }
    }
}
