//! Notification storage.
//!
//! `NotificationRepository` is the durable store for notifications. Backings:
//! - `MemoryNotificationRepository`: in-process, for tests and throwaway runs
//! - `SqlNotificationRepository<Sqlite>` / `<Postgres>`: sqlx + sea-query

pub mod memory;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod sql;

pub use memory::MemoryNotificationRepository;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::notifications::{Notification, NotificationFilter, NotificationsPage, Page};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Invalid notification: {0}")]
    Invalid(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable store for notifications.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Persist a notification, assigning its id and timestamps.
    async fn create(&self, notification: Notification) -> Result<Notification>;

    /// Fetch one notification. `NotFound` if absent.
    async fn retrieve(&self, id: &str) -> Result<Notification>;

    /// One page of matching notifications, newest first, with the total match count.
    async fn retrieve_all(&self, filter: &NotificationFilter, page: Page)
        -> Result<NotificationsPage>;

    /// Mark one of `user_id`'s notifications read. `NotFound` if no such notification.
    async fn read(&self, user_id: &str, id: &str) -> Result<()>;

    /// Mark every matching notification read. Returns how many were updated.
    async fn read_all(&self, filter: &NotificationFilter) -> Result<u64>;

    /// Delete one notification. `NotFound` if absent.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Reject notifications that must never be stored.
pub(crate) fn validate(notification: &Notification) -> Result<()> {
    if notification.user_id.is_empty() {
        return Err(StorageError::Invalid("empty user id".to_string()));
    }
    if notification.category == crate::notifications::Category::Unknown {
        return Err(StorageError::Invalid("unknown category".to_string()));
    }
    Ok(())
}

/// Initialize the notification repository based on configuration.
///
/// SQL backings create their table on startup.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn NotificationRepository>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Storage initialized");
            Ok(Arc::new(MemoryNotificationRepository::new()))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                use sqlx::sqlite::SqlitePoolOptions;

                let url = config.sqlite.url();
                // A pooled in-memory database would give each connection its own copy.
                let max_connections = if config.sqlite.path == ":memory:" { 1 } else { 5 };
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect(&url)
                    .await?;

                let repo = sql::sqlite::SqliteNotificationRepository::new(pool);
                repo.init().await?;

                info!(storage_type = "sqlite", path = %config.sqlite.path, "Storage initialized");
                Ok(Arc::new(repo))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite support requires the 'sqlite' feature".into())
            }
        }
        StorageType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                use sqlx::postgres::PgPoolOptions;

                let pool = PgPoolOptions::new()
                    .max_connections(config.postgres.max_connections)
                    .connect(&config.postgres.uri)
                    .await?;

                let repo = sql::postgres::PostgresNotificationRepository::new(pool);
                repo.init().await?;

                info!(storage_type = "postgres", "Storage initialized");
                Ok(Arc::new(repo))
            }

            #[cfg(not(feature = "postgres"))]
            {
                Err("PostgreSQL support requires the 'postgres' feature".into())
            }
        }
    }
}
