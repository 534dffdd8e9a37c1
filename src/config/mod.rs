//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod services;
mod storage;

pub use messaging::{AmqpSettings, MessagingConfig, MessagingType};
pub use services::{
    DeliveryConfig, DirectoryConfig, DirectoryType, StaticUser, SubscriptionConfig,
};
pub use storage::{
    FanoutConfig, FanoutType, PostgresConfig, RedisConfig, SqliteConfig, StorageConfig,
    StorageType,
};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HERALD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HERALD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HERALD_LOG";
/// Environment variable selecting the log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "HERALD_LOG_FORMAT";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Fan-out store (pending notifications, followee cache).
    pub fanout: FanoutConfig,
    /// Notification repository.
    pub storage: StorageConfig,
    /// Users directory.
    pub directory: DirectoryConfig,
    /// Client delivery protocol.
    pub delivery: DeliveryConfig,
    /// Consumer subscription.
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `HERALD_CONFIG` environment variable (if set)
    /// 4. Environment variables like `HERALD__FANOUT__PENDING_TTL_SECS`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document, without touching files or the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config: Config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription.id.is_empty() {
            return Err(ConfigError::Invalid("subscription.id is empty".to_string()));
        }
        if self.subscription.topic.is_empty() {
            return Err(ConfigError::Invalid("subscription.topic is empty".to_string()));
        }
        if self.delivery.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "delivery.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.delivery.page_size == 0 || self.directory.page_size == 0 {
            return Err(ConfigError::Invalid("page sizes must be positive".to_string()));
        }
        if self.delivery.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "delivery.channel_capacity must be positive".to_string(),
            ));
        }
        if self.fanout.pending_ttl_secs == 0 || self.fanout.followees_ttl_secs == 0 {
            return Err(ConfigError::Invalid("fanout TTLs must be positive".to_string()));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.storage_type = StorageType::Memory;
        config
    }
}
