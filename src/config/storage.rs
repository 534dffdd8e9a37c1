//! Storage configuration types: the notification repository and the fan-out store.

use serde::Deserialize;

/// Notification repository type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    #[default]
    Sqlite,
    Postgres,
}

/// Notification repository configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub sqlite: SqliteConfig,
    pub postgres: PostgresConfig,
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file path. `:memory:` keeps everything in process.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "herald.db".to_string(),
        }
    }
}

impl SqliteConfig {
    /// Connection URL for sqlx.
    pub fn url(&self) -> String {
        if self.path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.path)
        }
    }
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// PostgreSQL connection URI.
    pub uri: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://localhost:5432/herald".to_string(),
            max_connections: 10,
        }
    }
}

/// Fan-out store type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutType {
    #[default]
    Memory,
    Redis,
}

/// Fan-out store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    #[serde(rename = "type")]
    pub fanout_type: FanoutType,
    /// How long an undelivered pending notification is kept.
    pub pending_ttl_secs: u64,
    /// How long a cached followee list is trusted.
    pub followees_ttl_secs: u64,
    /// Sweep interval for the in-process backing.
    pub reap_interval_secs: u64,
    pub redis: RedisConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            fanout_type: FanoutType::Memory,
            pending_ttl_secs: 600,
            followees_ttl_secs: 600,
            reap_interval_secs: 60,
            redis: RedisConfig::default(),
        }
    }
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix for every key written by the fan-out store.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "herald".to_string(),
        }
    }
}
