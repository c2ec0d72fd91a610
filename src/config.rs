//! Engine Configuration
//!
//! Tunables for the orchestration engine, loadable from YAML:
//!
//! ```yaml
//! lock_wait_ms: 10000
//! lock_ttl_ms: 30000
//! default_max_concurrency: 4
//! publisher_name: planflow
//! run_timeout_secs: 3600
//! ```
//!
//! Missing keys fall back to their defaults.

use std::fs;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// Default wait for the per-parent fan-out lock.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 10_000;

/// Default TTL of the per-parent fan-out lock.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

/// Concurrency used by forks that do not set their own.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Publisher name used for wait/notify registrations.
pub const DEFAULT_PUBLISHER_NAME: &str = "planflow";

/// Default limit for `run_until_complete`.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;

/// Configuration of an [`OrchestrationEngine`](crate::execution::OrchestrationEngine).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a completing child waits for the parent's lock
    pub lock_wait_ms: u64,

    /// How long a held lock stays valid before it may be displaced
    pub lock_ttl_ms: u64,

    /// Fan-out width for forks with `max_concurrency: 0`
    pub default_max_concurrency: usize,

    /// Publisher name under which completion callbacks are registered
    pub publisher_name: String,

    /// Upper bound for a blocking plan run
    pub run_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            default_max_concurrency: DEFAULT_MAX_CONCURRENCY,
            publisher_name: DEFAULT_PUBLISHER_NAME.to_string(),
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded engine configuration from {}", path);
        Ok(config)
    }

    /// Parses configuration from YAML text and validates it.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_max_concurrency == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "default_max_concurrency must be >= 1".to_string(),
            ));
        }
        if self.lock_ttl_ms == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "lock_ttl_ms must be >= 1".to_string(),
            ));
        }
        if self.publisher_name.trim().is_empty() {
            return Err(OrchestrationError::InvalidConfig(
                "publisher_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}
