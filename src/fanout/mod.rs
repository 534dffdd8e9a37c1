//! Fan-out store: pending notifications per recipient and cached followee lists.
//!
//! Writers (the notification consumer) push pending entries keyed by the id of
//! the user the event is about. Readers (client delivery sessions) probe the
//! slots of every user they follow and pop at most one entry per probe. A pop
//! is atomic per key, so an entry reaches at most one concurrent reader.
//!
//! Backings:
//! - `MemoryFanoutStore`: maps behind a mutex, swept by `TtlReaper`
//! - `RedisFanoutStore`: lists and string keys with native expiry

pub mod memory;
pub mod reaper;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryFanoutStore;
pub use reaper::TtlReaper;
#[cfg(feature = "redis")]
pub use self::redis::RedisFanoutStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{FanoutConfig, FanoutType};
use crate::notifications::Notification;

/// Result type for fan-out store operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Errors that can occur in the fan-out store.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Pending notifications, one FIFO per recipient key.
#[async_trait]
pub trait PendingNotificationStore: Send + Sync {
    /// Append a notification to `key`'s slot. Expires after the store's TTL.
    async fn put_pending(&self, key: &str, notification: Notification) -> Result<()>;

    /// Atomically pop the oldest unexpired notification in `key`'s slot.
    async fn take_pending(&self, key: &str) -> Result<Option<Notification>>;

    /// Drop everything pending for `key`.
    async fn clear_pending(&self, key: &str) -> Result<()>;
}

/// Cached followee lists, trusted until their TTL expires.
#[async_trait]
pub trait FolloweeCache: Send + Sync {
    /// Followees of `user_id`, or `None` if absent or expired.
    async fn get_followees(&self, user_id: &str) -> Result<Option<Vec<String>>>;

    async fn put_followees(&self, user_id: &str, followees: Vec<String>) -> Result<()>;

    async fn invalidate_followees(&self, user_id: &str) -> Result<()>;
}

/// Both halves of the fan-out store. Implemented for every type that has both.
pub trait FanoutStore: PendingNotificationStore + FolloweeCache {}

impl<T: PendingNotificationStore + FolloweeCache> FanoutStore for T {}

/// TTLs applied by a fan-out store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutTtl {
    pub pending: Duration,
    pub followees: Duration,
}

impl Default for FanoutTtl {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(600),
            followees: Duration::from_secs(600),
        }
    }
}

impl From<&FanoutConfig> for FanoutTtl {
    fn from(config: &FanoutConfig) -> Self {
        Self {
            pending: Duration::from_secs(config.pending_ttl_secs),
            followees: Duration::from_secs(config.followees_ttl_secs),
        }
    }
}

/// A fan-out store plus the background task that maintains it, if any.
pub struct FanoutHandle {
    pub store: Arc<dyn FanoutStore>,
    /// Reaper for backings without native expiry. Abort at shutdown.
    pub reaper: Option<JoinHandle<()>>,
}

/// Initialize the fan-out store based on configuration.
pub async fn init_fanout_store(
    config: &FanoutConfig,
) -> std::result::Result<FanoutHandle, Box<dyn std::error::Error + Send + Sync>> {
    let ttl = FanoutTtl::from(config);

    match config.fanout_type {
        FanoutType::Memory => {
            let store = Arc::new(MemoryFanoutStore::new(ttl));
            let reaper = TtlReaper::new(store.clone())
                .with_interval(Duration::from_secs(config.reap_interval_secs.max(1)))
                .spawn();

            info!(fanout_type = "memory", "Fan-out store initialized");
            Ok(FanoutHandle {
                store,
                reaper: Some(reaper),
            })
        }
        FanoutType::Redis => {
            #[cfg(feature = "redis")]
            {
                let store =
                    RedisFanoutStore::connect(&config.redis.url, &config.redis.key_prefix, ttl)
                        .await?;

                info!(fanout_type = "redis", "Fan-out store initialized");
                Ok(FanoutHandle {
                    store: Arc::new(store),
                    reaper: None,
                })
            }

            #[cfg(not(feature = "redis"))]
            {
                Err("Redis support requires the 'redis' feature. Rebuild with --features redis".into())
            }
        }
    }
}
