//! Configuration management for Tollgate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    CallCounter, CounterStore, MemoryStore, RateLimitConfig, RateLimiter, SystemClock,
    DEFAULT_EXPIRY_SLACK_SECS, DEFAULT_KEY_PREFIX,
};

/// Prefix of environment variables overriding file settings, e.g.
/// `TOLLGATE__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through a Redis server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation, `memory` or `redis`
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Prefix for every key written to a shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limit rules file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,

    /// Seconds a counter outlives its window
    #[serde(default = "default_expiry_slack")]
    pub expiry_slack_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            expiry_slack_secs: default_expiry_slack(),
        }
    }
}

fn default_expiry_slack() -> u64 {
    DEFAULT_EXPIRY_SLACK_SECS
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: TollgateConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings that cannot be expressed with serde defaults.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err(TollgateError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Load the configured rules file, or no rules if none is set.
    pub fn load_rules(&self) -> Result<RateLimitConfig> {
        match &self.rate_limiting.rules_path {
            Some(path) => RateLimitConfig::from_file(path),
            None => Ok(RateLimitConfig::new()),
        }
    }

    /// Open the configured counter store.
    pub async fn build_store(&self) -> Result<Arc<dyn CounterStore>> {
        match self.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory counter store");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Redis => self.build_redis_store().await,
        }
    }

    #[cfg(feature = "redis")]
    async fn build_redis_store(&self) -> Result<Arc<dyn CounterStore>> {
        use crate::ratelimit::{RedisStore, StoreError};

        let url = self.store.url.as_deref().ok_or_else(|| {
            TollgateError::Config("store.url is required for the redis backend".to_string())
        })?;
        let store = RedisStore::connect_with_prefix(url, &self.store.key_prefix)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_store(&self) -> Result<Arc<dyn CounterStore>> {
        Err(TollgateError::Config(
            "redis store requested but tollgate was built without the redis feature".to_string(),
        ))
    }

    /// Build a rate limiter on the configured store and the system clock.
    pub async fn build_limiter(&self) -> Result<RateLimiter> {
        let store = self.build_store().await?;
        let counter = CallCounter::with_slack(
            store,
            Duration::from_secs(self.rate_limiting.expiry_slack_secs),
        );
        Ok(RateLimiter::with_counter(counter, Arc::new(SystemClock::new())))
    }
}
