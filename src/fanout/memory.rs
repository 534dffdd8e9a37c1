//! In-process fan-out store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;

use super::{FanoutTtl, FolloweeCache, PendingNotificationStore, Result};
use crate::notifications::Notification;

struct PendingEntry {
    notification: Notification,
    inserted_at: Instant,
}

struct FolloweeEntry {
    followees: Vec<String>,
    fetched_at: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, VecDeque<PendingEntry>>,
    followees: HashMap<String, FolloweeEntry>,
}

/// Fan-out store in process memory.
///
/// Expired entries are skipped on read and removed by `reap_expired`.
pub struct MemoryFanoutStore {
    state: Mutex<State>,
    ttl: FanoutTtl,
}

impl MemoryFanoutStore {
    pub fn new(ttl: FanoutTtl) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of unexpired pending notifications for `key`.
    pub fn pending_len(&self, key: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .pending
            .get(key)
            .map(|slot| {
                slot.iter()
                    .filter(|e| now.duration_since(e.inserted_at) < self.ttl.pending)
                    .count()
            })
            .unwrap_or_default()
    }

    /// Remove expired pending entries and followee lists. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let mut removed = 0;

        let pending_ttl = self.ttl.pending;
        state.pending.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|e| now.duration_since(e.inserted_at) < pending_ttl);
            removed += before - slot.len();
            !slot.is_empty()
        });

        let followees_ttl = self.ttl.followees;
        let before = state.followees.len();
        state
            .followees
            .retain(|_, e| now.duration_since(e.fetched_at) < followees_ttl);
        removed += before - state.followees.len();

        removed
    }
}

#[async_trait]
impl PendingNotificationStore for MemoryFanoutStore {
    async fn put_pending(&self, key: &str, notification: Notification) -> Result<()> {
        self.lock()
            .pending
            .entry(key.to_string())
            .or_default()
            .push_back(PendingEntry {
                notification,
                inserted_at: Instant::now(),
            });
        Ok(())
    }

    async fn take_pending(&self, key: &str) -> Result<Option<Notification>> {
        let now = Instant::now();
        let mut state = self.lock();

        let Some(slot) = state.pending.get_mut(key) else {
            return Ok(None);
        };

        let mut taken = None;
        while let Some(entry) = slot.pop_front() {
            if now.duration_since(entry.inserted_at) < self.ttl.pending {
                taken = Some(entry.notification);
                break;
            }
        }

        if slot.is_empty() {
            state.pending.remove(key);
        }
        Ok(taken)
    }

    async fn clear_pending(&self, key: &str) -> Result<()> {
        self.lock().pending.remove(key);
        Ok(())
    }
}

#[async_trait]
impl FolloweeCache for MemoryFanoutStore {
    async fn get_followees(&self, user_id: &str) -> Result<Option<Vec<String>>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .followees
            .get(user_id)
            .filter(|e| now.duration_since(e.fetched_at) < self.ttl.followees)
            .map(|e| e.followees.clone()))
    }

    async fn put_followees(&self, user_id: &str, followees: Vec<String>) -> Result<()> {
        self.lock().followees.insert(
            user_id.to_string(),
            FolloweeEntry {
                followees,
                fetched_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn invalidate_followees(&self, user_id: &str) -> Result<()> {
        self.lock().followees.remove(user_id);
        Ok(())
    }
}
