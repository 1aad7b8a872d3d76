//! Configuration module for Synapse.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! batch_size = 100
//! concurrency_window = 16
//!
//! [targets.search]
//! kind = "search"
//! url = "http://index:8108/collections/entities"
//! api_key = "${SEARCH_API_KEY}"
//!
//! [targets.cache]
//! kind = "cache"
//! ttl_seconds = 3600
//! ```

use crate::adapters::{CacheAdapter, LogAdapter, SearchIndexAdapter, TargetAdapter};
use crate::breaker::BreakerConfig;
use crate::retry::RetryConfig;
use crate::synapse::EngineOptions;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SynapseConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Sync target configurations, keyed by target name
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
}

/// Admin server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Engine loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_concurrency_window")]
    pub concurrency_window: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_retry_delay_ms")]
    pub poll_retry_delay_ms: u64,

    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// p95 commit-to-apply lag past which a target reads as degraded
    #[serde(default = "default_lag_degraded_p95_ms")]
    pub lag_degraded_p95_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency_window: default_concurrency_window(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_retry_delay_ms: default_poll_retry_delay_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            lag_degraded_p95_ms: default_lag_degraded_p95_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_concurrency_window() -> usize {
    16
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_retry_delay_ms() -> u64 {
    1000
}

fn default_drain_grace_ms() -> u64 {
    30000
}

fn default_lag_degraded_p95_ms() -> u64 {
    30000
}

impl EngineConfig {
    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            batch_size: self.batch_size,
            concurrency_window: self.concurrency_window,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_retry_delay: Duration::from_millis(self.poll_retry_delay_ms),
        }
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn lag_degraded_p95(&self) -> Duration {
        Duration::from_millis(self.lag_degraded_p95_ms)
    }
}

/// One sync target's configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Adapter kind: "search", "cache" or "log"
    pub kind: String,

    /// Base URL (search targets)
    #[serde(default)]
    pub url: Option<String>,

    /// API key sent with every request (search targets)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Key namespace (cache targets)
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Entry TTL in seconds (cache targets)
    #[serde(default)]
    pub ttl_seconds: Option<u64>,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_open_wait_limit")]
    pub open_wait_limit: u32,

    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_rolling_window_ms() -> u64 {
    60000
}

fn default_cooldown_ms() -> u64 {
    30000
}

fn default_half_open_trials() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30000
}

fn default_open_wait_limit() -> u32 {
    3
}

fn default_per_attempt_timeout_ms() -> u64 {
    10000
}

impl TargetConfig {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            rolling_window: Duration::from_millis(self.rolling_window_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            half_open_trials: self.half_open_trials,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            open_wait_limit: self.open_wait_limit,
        }
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    /// Build the adapter this config describes.
    pub fn build_adapter(
        &self,
        name: &str,
        pool: &deadpool_redis::Pool,
    ) -> Result<Arc<dyn TargetAdapter>, ConfigError> {
        match self.kind.as_str() {
            "search" => {
                let url = self
                    .url
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingField(format!("targets.{}.url", name)))?;
                let mut adapter = SearchIndexAdapter::new(name, url)
                    .with_timeout(self.per_attempt_timeout());
                if let Some(key) = &self.api_key {
                    adapter = adapter.with_api_key(key);
                }
                Ok(Arc::new(adapter))
            }
            "cache" => {
                let mut adapter = CacheAdapter::new(name, pool.clone());
                if let Some(prefix) = &self.key_prefix {
                    adapter = adapter.with_key_prefix(prefix);
                }
                if let Some(ttl) = self.ttl_seconds {
                    adapter = adapter.with_ttl_seconds(ttl);
                }
                Ok(Arc::new(adapter))
            }
            "log" => Ok(Arc::new(LogAdapter::new(name))),
            other => Err(ConfigError::ValidationError(format!(
                "Target '{}' has unknown kind '{}'",
                name, other
            ))),
        }
    }
}

impl SynapseConfig {
    /// Load configuration from the default path or SYNAPSE_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("SYNAPSE_CONFIG").unwrap_or_else(|_| "config/synapse.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: SynapseConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            targets = config.targets.len(),
            batch_size = config.engine.batch_size,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, target) in &self.targets {
            match target.kind.as_str() {
                "search" => {
                    let url = target.url.as_deref().ok_or_else(|| {
                        ConfigError::MissingField(format!("targets.{}.url", name))
                    })?;

                    if url.contains("${") {
                        warn!(
                            target = %name,
                            url = %url,
                            "Target URL contains unsubstituted environment variable"
                        );
                    }

                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(ConfigError::ValidationError(format!(
                            "Target '{}' URL must start with http:// or https://",
                            name
                        )));
                    }
                }
                "cache" | "log" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Target '{}' has unknown kind '{}' (expected search, cache or log)",
                        name, other
                    )));
                }
            }

            if target.max_attempts == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Target '{}' must allow at least one attempt",
                    name
                )));
            }

            if target.failure_threshold == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Target '{}' failure_threshold must be at least 1",
                    name
                )));
            }
        }

        if self.engine.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "engine.batch_size must be at least 1".to_string(),
            ));
        }

        if self.engine.concurrency_window == 0 {
            return Err(ConfigError::ValidationError(
                "engine.concurrency_window must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Names of configured targets, sorted for stable startup logs.
    pub fn target_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
