//! Bus handler that turns domain events into notifications.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::{decode, Category, NotificationService};
use crate::bus::{BusError, EventHandler, EventPayload};

/// Decodes each event, persists the notification and queues it for fan-out.
///
/// Events whose topic has no notification category, or that name no recipient,
/// are acknowledged and dropped.
pub struct NotificationEventHandler {
    service: Arc<NotificationService>,
}

impl NotificationEventHandler {
    pub fn new(service: Arc<NotificationService>) -> Self {
        Self { service }
    }
}

impl EventHandler for NotificationEventHandler {
    fn handle(&self, event: Arc<EventPayload>) -> BoxFuture<'static, Result<(), BusError>> {
        let service = self.service.clone();

        Box::pin(async move {
            let notification = decode(&event);
            if notification.category == Category::Unknown {
                debug!(topic = ?event.get("topic"), "No notification for event, skipping");
                return Ok(());
            }
            if notification.user_id.is_empty() {
                warn!(topic = ?event.get("topic"), "Event has no recipient, skipping");
                return Ok(());
            }

            service
                .create_notification(notification)
                .await
                .map(|_| ())
                .map_err(|e| {
                    error!(error = %e, "Failed to create notification");
                    BusError::Handler(e.to_string())
                })
        })
    }

    fn cancel(&self) -> Result<(), BusError> {
        debug!("Notification consumer cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::fanout::{FanoutTtl, MemoryFanoutStore, PendingNotificationStore};
    use crate::notifications::{NotificationFilter, Page};
    use crate::storage::{MemoryNotificationRepository, NotificationRepository};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Arc<EventPayload> {
        match value {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => panic!("payload must be an object"),
        }
    }

    fn handler() -> (
        NotificationEventHandler,
        Arc<MemoryNotificationRepository>,
        Arc<MemoryFanoutStore>,
    ) {
        let repo = Arc::new(MemoryNotificationRepository::new());
        let fanout = Arc::new(MemoryFanoutStore::new(FanoutTtl::default()));
        let service = Arc::new(NotificationService::new(
            repo.clone(),
            Arc::new(MemoryDirectory::new()),
            fanout.clone(),
        ));
        (NotificationEventHandler::new(service), repo, fanout)
    }

    #[tokio::test]
    async fn test_like_event_persisted_and_pending() {
        let (handler, repo, fanout) = handler();

        handler
            .handle(payload(json!({
                "topic": "likes.created",
                "user_id": "u1",
                "content": "post-123",
                "timestamp": 1
            })))
            .await
            .unwrap();

        let page = repo
            .retrieve_all(&NotificationFilter::for_user("u1"), Page::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.notifications[0].category, Category::Like);
        assert_eq!(page.notifications[0].content, "post-123");
        assert!(!page.notifications[0].is_read);

        let pending = fanout.take_pending("u1").await.unwrap().unwrap();
        assert_eq!(pending.id, page.notifications[0].id);
    }

    #[tokio::test]
    async fn test_unknown_topic_skipped() {
        let (handler, repo, fanout) = handler();

        handler
            .handle(payload(json!({"topic": "users.logged_in", "user_id": "u1"})))
            .await
            .unwrap();

        assert!(repo.is_empty().await);
        assert_eq!(fanout.pending_len("u1"), 0);
    }

    #[tokio::test]
    async fn test_missing_recipient_skipped() {
        let (handler, repo, _fanout) = handler();

        handler
            .handle(payload(json!({"topic": "posts.created", "content": "hi"})))
            .await
            .unwrap();
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_follow_event_notifies_follower() {
        let (handler, repo, _fanout) = handler();

        handler
            .handle(payload(json!({
                "topic": "events.followers.created",
                "follower_id": "a",
                "followee_id": "b"
            })))
            .await
            .unwrap();

        let page = repo
            .retrieve_all(&NotificationFilter::for_user("a"), Page::default())
            .await
            .unwrap();
        assert_eq!(page.notifications[0].category, Category::Follow);
        assert_eq!(page.notifications[0].content, "b");
    }
}
