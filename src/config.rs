//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{FailurePolicy, PolicyConfig, PolicyTemplate};

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Template for contexts that are not explicitly configured
    #[serde(default)]
    pub defaults: PolicyTemplate,

    /// Explicitly registered policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,

    /// Shared store for the distributed limiter
    #[serde(default)]
    pub shared_store: Option<SharedStoreConfig>,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Behaviour when the state store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Number of lock shards serializing per-key updates
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,

    /// Interval between sweeps of expired state in milliseconds (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            lock_shards: default_lock_shards(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_lock_shards() -> usize {
    64
}

fn default_sweep_interval() -> u64 {
    60_000
}

/// Shared atomic store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`
    pub url: String,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Round-trip timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_key_prefix() -> String {
    "gatekeeper:".to_string()
}

fn default_timeout() -> u64 {
    250
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with `GATEKEEPER__*`
    /// environment variables, e.g. `GATEKEEPER__LIMITER__FAILURE_POLICY`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.lock_shards == 0 {
            return Err(GatekeeperError::Config(
                "limiter.lock_shards must be at least 1".to_string(),
            ));
        }
        self.defaults.instantiate("defaults").validate()?;
        Ok(())
    }
}
