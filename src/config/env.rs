//! Environment variable configuration
//!
//! Provides `CONDUCTOR_*` overrides applied on top of the config file.

use std::env;
use std::path::PathBuf;
use tracing::warn;

use super::AppConfig;
use crate::executor::RetryStrategy;

/// Environment variable prefix
const ENV_PREFIX: &str = "CONDUCTOR";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// CONDUCTOR_CONCURRENCY
    pub concurrency: Option<usize>,
    /// CONDUCTOR_RETRY_STRATEGY
    pub retry_strategy: Option<String>,
    /// CONDUCTOR_MAX_ATTEMPTS
    pub max_attempts: Option<u32>,
    /// CONDUCTOR_BASE_DELAY_MS
    pub base_delay_ms: Option<u64>,
    /// CONDUCTOR_RATE_LIMIT
    pub rate_limit: Option<usize>,
    /// CONDUCTOR_CACHE_TTL
    pub cache_ttl: Option<u64>,
    /// CONDUCTOR_RESULTS_DIR
    pub results_dir: Option<String>,
    /// CONDUCTOR_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            concurrency: get_env_parse("CONCURRENCY"),
            retry_strategy: get_env("RETRY_STRATEGY"),
            max_attempts: get_env_parse("MAX_ATTEMPTS"),
            base_delay_ms: get_env_parse("BASE_DELAY_MS"),
            rate_limit: get_env_parse("RATE_LIMIT"),
            cache_ttl: get_env_parse("CACHE_TTL"),
            results_dir: get_env("RESULTS_DIR"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.concurrency.is_some()
            || self.retry_strategy.is_some()
            || self.max_attempts.is_some()
            || self.base_delay_ms.is_some()
            || self.rate_limit.is_some()
            || self.cache_ttl.is_some()
            || self.results_dir.is_some()
            || self.config_file.is_some()
    }

    /// Overwrite the matching fields of `config`
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(concurrency) = self.concurrency {
            config.execution.concurrency = concurrency;
        }
        if let Some(name) = &self.retry_strategy {
            match RetryStrategy::from_str(name) {
                Some(strategy) => config.execution.retry_strategy = strategy,
                None => warn!("Ignoring unknown {ENV_PREFIX}_RETRY_STRATEGY '{}'", name),
            }
        }
        if let Some(attempts) = self.max_attempts {
            config.execution.max_attempts = attempts;
        }
        if let Some(delay) = self.base_delay_ms {
            config.execution.base_delay_ms = delay;
            config.execution.max_delay_ms = config.execution.max_delay_ms.max(delay);
        }
        if let Some(limit) = self.rate_limit {
            config.execution.rate_limit_per_minute = limit;
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache.ttl_secs = ttl;
        }
        if let Some(dir) = &self.results_dir {
            config.results.dir = Some(PathBuf::from(dir));
        }
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_CONCURRENCY:    {:?}", ENV_PREFIX, self.concurrency);
        println!("  {}_RETRY_STRATEGY: {:?}", ENV_PREFIX, self.retry_strategy);
        println!("  {}_MAX_ATTEMPTS:   {:?}", ENV_PREFIX, self.max_attempts);
        println!("  {}_BASE_DELAY_MS:  {:?}", ENV_PREFIX, self.base_delay_ms);
        println!("  {}_RATE_LIMIT:     {:?}", ENV_PREFIX, self.rate_limit);
        println!("  {}_CACHE_TTL:      {:?}", ENV_PREFIX, self.cache_ttl);
        println!("  {}_RESULTS_DIR:    {:?}", ENV_PREFIX, self.results_dir);
        println!("  {}_CONFIG:         {:?}", ENV_PREFIX, self.config_file);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.concurrency.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_apply_overrides() {
        let env = EnvConfig {
            concurrency: Some(5),
            retry_strategy: Some("linear".to_string()),
            base_delay_ms: Some(60_000),
            rate_limit: Some(0),
            results_dir: Some("/tmp/runs".to_string()),
            ..Default::default()
        };
        assert!(env.has_any());

        let mut config = AppConfig::default();
        env.apply(&mut config);

        assert_eq!(config.execution.concurrency, 5);
        assert_eq!(config.execution.retry_strategy, RetryStrategy::Linear);
        assert_eq!(config.execution.max_delay_ms, 60_000);
        assert_eq!(config.execution.rate_limit_per_minute, 0);
        assert_eq!(config.results.dir, Some(PathBuf::from("/tmp/runs")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_strategy_ignored() {
        let env = EnvConfig {
            retry_strategy: Some("fibonacci".to_string()),
            ..Default::default()
        };
        let mut config = AppConfig::default();
        env.apply(&mut config);
        assert_eq!(config.execution.retry_strategy, RetryStrategy::Exponential);
    }

    #[test]
    fn test_load_from_environment() {
        env::set_var("CONDUCTOR_CACHE_TTL", "42");
        let config = EnvConfig::load();
        env::remove_var("CONDUCTOR_CACHE_TTL");
        assert_eq!(config.cache_ttl, Some(42));
    }
}
