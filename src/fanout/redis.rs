//! Redis fan-out store.
//!
//! Key layout:
//! - `{prefix}:pending:{recipient}`: list of JSON entries, pushed right, popped left
//! - `{prefix}:followees:{user}`: JSON array with a native TTL
//!
//! LPOP is atomic, so concurrent readers never receive the same entry.

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{FanoutTtl, FolloweeCache, PendingNotificationStore, Result};
use crate::notifications::Notification;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    inserted_at_ms: i64,
    notification: Notification,
}

/// Redis-backed fan-out store.
pub struct RedisFanoutStore {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: FanoutTtl,
}

impl RedisFanoutStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all keys
    /// * `ttl` - Expiry for pending entries and followee lists
    pub async fn connect(url: &str, key_prefix: &str, ttl: FanoutTtl) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for fan-out");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            ttl,
        })
    }

    fn pending_key(&self, recipient: &str) -> String {
        format!("{}:pending:{}", self.key_prefix, recipient)
    }

    fn followees_key(&self, user_id: &str) -> String {
        format!("{}:followees:{}", self.key_prefix, user_id)
    }

    fn pending_ttl_ms(&self) -> i64 {
        self.ttl.pending.as_millis().min(i64::MAX as u128) as i64
    }
}

#[async_trait]
impl PendingNotificationStore for RedisFanoutStore {
    async fn put_pending(&self, key: &str, notification: Notification) -> Result<()> {
        let redis_key = self.pending_key(key);
        let mut conn = self.conn.clone();

        let entry = serde_json::to_string(&StoredEntry {
            inserted_at_ms: Utc::now().timestamp_millis(),
            notification,
        })?;

        // The list TTL is refreshed on every push; per-entry age is checked on pop.
        let _: () = redis::pipe()
            .atomic()
            .rpush(&redis_key, entry)
            .ignore()
            .pexpire(&redis_key, self.pending_ttl_ms())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(recipient = %key, "Stored pending notification in Redis");
        Ok(())
    }

    async fn take_pending(&self, key: &str) -> Result<Option<Notification>> {
        let redis_key = self.pending_key(key);
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();

        loop {
            let raw: Option<String> = conn.lpop(&redis_key, None).await?;
            let Some(raw) = raw else {
                return Ok(None);
            };

            let entry: StoredEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(recipient = %key, error = %e, "Dropping unreadable pending entry");
                    continue;
                }
            };

            if now_ms - entry.inserted_at_ms < self.pending_ttl_ms() {
                return Ok(Some(entry.notification));
            }
        }
    }

    async fn clear_pending(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.pending_key(key)).await?;
        Ok(())
    }
}

#[async_trait]
impl FolloweeCache for RedisFanoutStore {
    async fn get_followees(&self, user_id: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.followees_key(user_id)).await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_followees(&self, user_id: &str, followees: Vec<String>) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(&followees)?;
        let ttl_secs = self.ttl.followees.as_secs().max(1);

        let _: () = conn
            .set_ex(self.followees_key(user_id), raw, ttl_secs)
            .await?;

        debug!(user = %user_id, count = followees.len(), "Cached followees in Redis");
        Ok(())
    }

    async fn invalidate_followees(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.followees_key(user_id)).await?;
        Ok(())
    }
}
