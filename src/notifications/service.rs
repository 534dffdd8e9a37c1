//! Token-authenticated notification operations.
//!
//! Every call resolves the caller's token through the directory first. Single
//! notification operations check ownership and answer `Unauthorized` when the
//! notification belongs to someone else.

use std::sync::Arc;

use tracing::{debug, info};

use super::{Notification, NotificationError, NotificationFilter, NotificationsPage, Page};
use crate::directory::{collect_followees, Directory};
use crate::fanout::{FanoutStore, FolloweeCache, PendingNotificationStore};
use crate::storage::NotificationRepository;

/// Result type for notification service operations.
pub type Result<T> = std::result::Result<T, NotificationError>;

/// Notification operations over the durable store, the fan-out store and the directory.
pub struct NotificationService {
    repo: Arc<dyn NotificationRepository>,
    directory: Arc<dyn Directory>,
    fanout: Arc<dyn FanoutStore>,
    page_size: u64,
}

impl NotificationService {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        directory: Arc<dyn Directory>,
        fanout: Arc<dyn FanoutStore>,
    ) -> Self {
        Self {
            repo,
            directory,
            fanout,
            page_size: 100,
        }
    }

    /// Page size used when collecting followees from the directory.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn repository(&self) -> &Arc<dyn NotificationRepository> {
        &self.repo
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn fanout(&self) -> &Arc<dyn FanoutStore> {
        &self.fanout
    }

    /// Persist a decoded notification and queue it for followers of its owner.
    pub async fn create_notification(&self, notification: Notification) -> Result<Notification> {
        let stored = self.repo.create(notification).await?;
        self.fanout
            .put_pending(&stored.user_id, stored.clone())
            .await?;

        debug!(
            id = %stored.id,
            user = %stored.user_id,
            category = %stored.category,
            "Notification created"
        );
        Ok(stored)
    }

    /// Resolve a session token to a user id.
    pub async fn identify(&self, token: &str) -> Result<String> {
        Ok(self.directory.identify_user(token).await?)
    }

    /// One notification, if the caller owns it.
    pub async fn retrieve(&self, token: &str, id: &str) -> Result<Notification> {
        let user_id = self.identify(token).await?;
        let notification = self.repo.retrieve(id).await?;
        if notification.user_id != user_id {
            return Err(NotificationError::Unauthorized);
        }
        Ok(notification)
    }

    /// Notifications about users the caller follows, newest first.
    pub async fn retrieve_all(&self, token: &str, page: Page) -> Result<NotificationsPage> {
        let user_id = self.identify(token).await?;
        let followees = self.followees(&user_id).await?;

        let filter = NotificationFilter {
            user_ids: Some(followees),
            ..Default::default()
        };
        Ok(self.repo.retrieve_all(&filter, page).await?)
    }

    /// The caller's own notifications matching `filter`, newest first.
    ///
    /// The filter's owner fields are overridden with the caller.
    pub async fn retrieve_own(
        &self,
        token: &str,
        mut filter: NotificationFilter,
        page: Page,
    ) -> Result<NotificationsPage> {
        let user_id = self.identify(token).await?;
        filter.user_id = Some(user_id);
        filter.user_ids = None;
        Ok(self.repo.retrieve_all(&filter, page).await?)
    }

    /// Mark one of the caller's notifications read.
    pub async fn read(&self, token: &str, id: &str) -> Result<()> {
        let user_id = self.identify(token).await?;
        let notification = self.repo.retrieve(id).await?;
        if notification.user_id != user_id {
            return Err(NotificationError::Unauthorized);
        }
        self.repo.read(&user_id, id).await?;
        Ok(())
    }

    /// Mark one page of the caller's unread notifications read. Returns how many changed.
    pub async fn read_all(&self, token: &str, page: Page) -> Result<u64> {
        let user_id = self.identify(token).await?;
        let unread = self
            .repo
            .retrieve_all(&NotificationFilter::for_user(&user_id).unread(), page)
            .await?;

        let mut marked = 0;
        for notification in &unread.notifications {
            self.repo.read(&user_id, &notification.id).await?;
            marked += 1;
        }

        info!(user = %user_id, marked, "Marked notifications read");
        Ok(marked)
    }

    /// Mark every unread notification the caller owns read. Returns how many changed.
    pub async fn mark_all_read(&self, token: &str) -> Result<u64> {
        let user_id = self.identify(token).await?;
        let marked = self
            .repo
            .read_all(&NotificationFilter::for_user(&user_id).unread())
            .await?;

        info!(user = %user_id, marked, "Marked all notifications read");
        Ok(marked)
    }

    /// Delete one of the caller's notifications.
    pub async fn delete(&self, token: &str, id: &str) -> Result<()> {
        let user_id = self.identify(token).await?;
        let notification = self.repo.retrieve(id).await?;
        if notification.user_id != user_id {
            return Err(NotificationError::Unauthorized);
        }
        self.repo.delete(id).await?;
        Ok(())
    }

    /// Followees of `user_id`, from the cache or rebuilt from the directory.
    pub async fn followees(&self, user_id: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.fanout.get_followees(user_id).await? {
            return Ok(cached);
        }

        let followees = collect_followees(self.directory.as_ref(), user_id, self.page_size).await?;
        self.fanout
            .put_followees(user_id, followees.clone())
            .await?;
        Ok(followees)
    }
}
