//! Configuration module
//!
//! Handles loading, validating and overriding the application configuration.

mod env;

pub use env::EnvConfig;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::executor::{RetryPolicy, RetryStrategy};
use crate::results::ResultsStorage;
use crate::scheduler::{ScheduleStore, WorkerStore};

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./conductor.yaml",
    "./conductor.yml",
    "./.conductor.yaml",
    "~/.config/conductor/config.yaml",
];

/// Upper bound for the worker count of one run
pub const MAX_CONCURRENCY: usize = 16;

/// Application configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub execution: ExecutionConfig,
    pub cache: CacheConfig,
    /// Disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub scheduler: SchedulerConfig,
    pub results: ResultsConfig,
}

/// How a run executes its tasks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub concurrency: usize,
    pub retry_strategy: RetryStrategy,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 disables the limiter
    pub rate_limit_per_minute: usize,
    pub request_timeout_secs: u64,
    pub session_create_retries: u32,
    /// Prefix for relative task URLs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry_strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            rate_limit_per_minute: 60,
            request_timeout_secs: 30,
            session_create_retries: 3,
            base_url: None,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_strategy,
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
    /// Enables the disk tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 1000,
            sweep_interval_secs: 60,
            disk_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub schedules_path: Option<PathBuf>,
    pub workers_path: Option<PathBuf>,
    pub ack_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            schedules_path: None,
            workers_path: None,
            ack_timeout_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn schedule_store(&self) -> ScheduleStore {
        ScheduleStore::new(
            self.schedules_path
                .clone()
                .unwrap_or_else(ScheduleStore::default_path),
        )
    }

    pub fn worker_store(&self) -> WorkerStore {
        WorkerStore::new(
            self.workers_path
                .clone()
                .unwrap_or_else(WorkerStore::default_path),
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub dir: Option<PathBuf>,
}

impl ResultsConfig {
    pub fn storage(&self) -> ResultsStorage {
        ResultsStorage::new(self.dir.clone().unwrap_or_else(ResultsStorage::default_dir))
    }
}

impl AppConfig {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Explicit path, else `CONDUCTOR_CONFIG`, else the first standard
    /// location, else defaults. Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env = EnvConfig::load();
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_ref().map(PathBuf::from))
            .or_else(Self::find);

        let mut config = match path {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                Self::load(&path)?
            }
            None => Self::default(),
        };

        env.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if exec.concurrency == 0 || exec.concurrency > MAX_CONCURRENCY {
            bail!(
                "Invalid concurrency {}. Valid range: 1-{}",
                exec.concurrency,
                MAX_CONCURRENCY
            );
        }
        if exec.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if exec.max_delay_ms < exec.base_delay_ms {
            bail!(
                "max_delay_ms ({}) is smaller than base_delay_ms ({})",
                exec.max_delay_ms,
                exec.base_delay_ms
            );
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be at least 1");
        }
        if let Some(cb) = &self.circuit_breaker {
            if cb.failure_threshold == 0 {
                bail!("circuit_breaker.failure_threshold must be at least 1");
            }
        }
        if self.scheduler.tick_secs == 0 {
            bail!("scheduler.tick_secs must be at least 1");
        }
        Ok(())
    }
}

fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
