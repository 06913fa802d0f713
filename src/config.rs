//! Configuration management for db-throttle.
//!
//! Named lock stores, limiter storages and rate limiter factories are
//! declared here and resolved once by [`crate::service::ThrottleService`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::RateLimitPolicy;

/// Name used for the entries created by [`ThrottleConfig::default`].
pub const DEFAULT_NAME: &str = "default";

/// Main configuration for db-throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Database connection configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Lock store used when none is named
    #[serde(default = "default_name")]
    pub default_lock: String,

    /// Rate limiter factory used when none is named
    #[serde(default = "default_name")]
    pub default_rate_limiter: String,

    /// Named lock stores
    #[serde(default = "default_lock_stores")]
    pub lock_stores: HashMap<String, LockStoreConfig>,

    /// Named rate limiter state storages
    #[serde(default = "default_storages")]
    pub storages: HashMap<String, StorageConfig>,

    /// Named rate limiter factories
    #[serde(default = "default_rate_limiters")]
    pub rate_limiters: HashMap<String, RateLimiterConfig>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            default_lock: default_name(),
            default_rate_limiter: default_name(),
            lock_stores: default_lock_stores(),
            storages: default_storages(),
            rate_limiters: default_rate_limiters(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (`sqlite://...` or `postgres://...`)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection, in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

/// Configuration of one lock store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStoreConfig {
    /// Registered backend name
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Chance of pruning expired rows after each save
    #[serde(default = "default_gc_probability")]
    pub gc_probability: f64,

    /// Lifetime in seconds granted by a save
    #[serde(default = "default_initial_ttl")]
    pub initial_ttl: u64,
}

impl Default for LockStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            gc_probability: default_gc_probability(),
            initial_ttl: default_initial_ttl(),
        }
    }
}

/// Configuration of one rate limiter state storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registered backend name
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

/// Whether a rate limiter serializes its updates with a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockSetting {
    /// `true` uses the default lock store, `false` disables locking
    Enabled(bool),
    /// A named lock store
    Store(String),
}

impl Default for LockSetting {
    fn default() -> Self {
        LockSetting::Enabled(false)
    }
}

/// Configuration of one rate limiter factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Limiting algorithm
    pub policy: RateLimitPolicy,
    /// Tokens allowed per interval
    pub limit: u32,
    /// Interval, e.g. `"1 minute"`, `"PT30S"` or `"60"`
    pub interval: String,
    /// Lock used to serialize updates
    #[serde(default)]
    pub lock: LockSetting,
    /// Named storage; the default storage when absent
    #[serde(default)]
    pub storage: Option<String>,
    /// Token bucket refill rate; `limit` per `interval` when absent
    #[serde(default)]
    pub rate: Option<RateConfig>,
}

/// A refill rate of `amount` tokens per `interval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Interval, in the same formats as [`RateLimiterConfig::interval`]
    pub interval: String,
    pub amount: u32,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_backend() -> String {
    "database".to_string()
}

fn default_database_url() -> String {
    "sqlite://throttle.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_gc_probability() -> f64 {
    0.01
}

fn default_initial_ttl() -> u64 {
    300
}

fn default_lock_stores() -> HashMap<String, LockStoreConfig> {
    HashMap::from([(default_name(), LockStoreConfig::default())])
}

fn default_storages() -> HashMap<String, StorageConfig> {
    HashMap::from([(default_name(), StorageConfig::default())])
}

fn default_rate_limiters() -> HashMap<String, RateLimiterConfig> {
    HashMap::from([(
        default_name(),
        RateLimiterConfig {
            policy: RateLimitPolicy::FixedWindow,
            limit: 10,
            interval: "1 minute".to_string(),
            lock: LockSetting::Enabled(true),
            storage: Some(default_name()),
            rate: None,
        },
    )])
}

impl ThrottleConfig {
    /// Load configuration from a file, overlaid with `THROTTLE__*`
    /// environment variables (e.g. `THROTTLE__DATABASE__URL`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("THROTTLE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttle config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ThrottleConfig::default();
        assert_eq!(config.default_lock, "default");
        assert_eq!(config.lock_stores["default"].initial_ttl, 300);
        assert_eq!(config.lock_stores["default"].gc_probability, 0.01);

        let limiter = &config.rate_limiters["default"];
        assert_eq!(limiter.policy, RateLimitPolicy::FixedWindow);
        assert_eq!(limiter.limit, 10);
        assert_eq!(limiter.lock, LockSetting::Enabled(true));
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
database:
  url: "postgres://localhost/app"
  max_connections: 10
lock_stores:
  default:
    gc_probability: 1.0
    initial_ttl: 5
rate_limiters:
  login:
    policy: token_bucket
    limit: 5
    interval: "15 minutes"
    lock: default
    rate:
      interval: "1 minute"
      amount: 1
  api:
    policy: sliding_window
    limit: 100
    interval: "PT1M"
"#;
        let config = ThrottleConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/app");
        assert_eq!(config.database.acquire_timeout_secs, 5);
        assert_eq!(config.lock_stores["default"].backend, "database");
        assert_eq!(config.lock_stores["default"].initial_ttl, 5);
        assert_eq!(config.storages.len(), 1);

        let login = &config.rate_limiters["login"];
        assert_eq!(login.policy, RateLimitPolicy::TokenBucket);
        assert_eq!(login.lock, LockSetting::Store("default".to_string()));
        assert_eq!(
            login.rate,
            Some(RateConfig {
                interval: "1 minute".to_string(),
                amount: 1,
            })
        );

        let api = &config.rate_limiters["api"];
        assert_eq!(api.lock, LockSetting::Enabled(false));
        assert_eq!(api.storage, None);
        assert_eq!(api.rate, None);
    }

    #[test]
    fn test_parse_invalid_policy() {
        let yaml = r#"
rate_limiters:
  broken:
    policy: leaky_bucket
    limit: 1
    interval: "1 second"
"#;
        assert!(matches!(
            ThrottleConfig::from_yaml(yaml),
            Err(ThrottleError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.yaml");
        std::fs::write(&path, "default_lock: jobs\nlock_stores:\n  jobs:\n    initial_ttl: 30\n").unwrap();

        let config = ThrottleConfig::from_file(&path).unwrap();
        assert_eq!(config.default_lock, "jobs");
        assert_eq!(config.lock_stores["jobs"].initial_ttl, 30);
    }
}
