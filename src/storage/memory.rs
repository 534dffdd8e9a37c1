//! In-memory notification repository.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{validate, NotificationRepository, Result, StorageError};
use crate::notifications::{Notification, NotificationFilter, NotificationsPage, Page};

/// Stores notifications in insertion order; queries walk it newest first.
#[derive(Default)]
pub struct MemoryNotificationRepository {
    notifications: RwLock<Vec<Notification>>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.notifications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.notifications.read().await.is_empty()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, mut notification: Notification) -> Result<Notification> {
        validate(&notification)?;

        let now = Utc::now();
        notification.id = Uuid::new_v4().to_string();
        notification.created_at = now;
        notification.updated_at = now;

        self.notifications.write().await.push(notification.clone());
        Ok(notification)
    }

    async fn retrieve(&self, id: &str) -> Result<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn retrieve_all(
        &self,
        filter: &NotificationFilter,
        page: Page,
    ) -> Result<NotificationsPage> {
        let store = self.notifications.read().await;
        let matching: Vec<&Notification> = store.iter().rev().filter(|n| filter.matches(n)).collect();

        let notifications = matching
            .iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|n| (*n).clone())
            .collect();

        Ok(NotificationsPage {
            total: matching.len() as u64,
            offset: page.offset,
            limit: page.limit,
            notifications,
        })
    }

    async fn read(&self, user_id: &str, id: &str) -> Result<()> {
        let mut store = self.notifications.write().await;
        let notification = store
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        notification.is_read = true;
        notification.updated_at = Utc::now();
        Ok(())
    }

    async fn read_all(&self, filter: &NotificationFilter) -> Result<u64> {
        let now = Utc::now();
        let mut updated = 0;
        for notification in self.notifications.write().await.iter_mut() {
            if filter.matches(notification) {
                notification.is_read = true;
                notification.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.notifications.write().await;
        let before = store.len();
        store.retain(|n| n.id != id);
        if store.len() == before {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
