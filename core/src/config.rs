use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BuildError, Result};
use crate::log::{LogConfig, LogLevel};

/// Environment variable overriding `scheduler.max_parallel_stages`.
pub const ENV_MAX_PARALLEL: &str = "STAGECRAFT_MAX_PARALLEL";

/// Environment variable overriding `log.level`.
pub const ENV_LOG_LEVEL: &str = "STAGECRAFT_LOG";

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stage scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// External image fetching
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

impl EngineConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ConfigError(format!(
                "Failed to read config at {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `STAGECRAFT_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(ENV_MAX_PARALLEL).ok().as_deref(),
            std::env::var(ENV_LOG_LEVEL).ok().as_deref(),
        )
    }

    fn apply_overrides(&mut self, max_parallel: Option<&str>, log_level: Option<&str>) -> Result<()> {
        if let Some(raw) = max_parallel {
            self.scheduler.max_parallel_stages = raw.trim().parse().map_err(|_| {
                BuildError::ConfigError(format!("{} must be a positive integer, got '{}'", ENV_MAX_PARALLEL, raw))
            })?;
        }
        if let Some(raw) = log_level {
            self.log.level = raw.parse::<LogLevel>().map_err(BuildError::ConfigError)?;
        }
        self.validate()
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel_stages == 0 {
            return Err(BuildError::ConfigError(
                "scheduler.max_parallel_stages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of independent stages running at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel_stages: usize,

    /// Skip stages the final stage does not depend on
    #[serde(default = "default_true")]
    pub skip_unused_stages: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: default_max_parallel(),
            skip_unused_stages: true,
        }
    }
}

/// External image fetch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Fetch and unpack each external image at most once per build
    #[serde(default = "default_true")]
    pub cache_images: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { cache_images: true }
    }
}

fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_true() -> bool {
    true
}
