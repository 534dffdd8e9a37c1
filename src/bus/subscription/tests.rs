use super::*;
use crate::bus::{ChannelBroker, Publisher};
use crate::test_utils::{CountingHandler, RecordingObserver};
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(1);

fn setup() -> (Arc<ChannelBroker>, SubscriptionManager, Publisher) {
    let broker = Arc::new(ChannelBroker::new());
    let manager = SubscriptionManager::new(broker.clone());
    let publisher = Publisher::new(broker.clone());
    (broker, manager, publisher)
}

fn event(value: serde_json::Value) -> EventPayload {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_subscribe_validates_id_and_topic() {
    let (_, manager, _) = setup();
    let handler = Arc::new(CountingHandler::new());

    let result = manager
        .subscribe(SubscriberConfig::new("", "posts.created", handler.clone()))
        .await;
    assert!(matches!(result, Err(BusError::EmptyId)));

    let result = manager
        .subscribe(SubscriberConfig::new("svc", "", handler))
        .await;
    assert!(matches!(result, Err(BusError::EmptyTopic)));

    assert_eq!(manager.subscription_count().await, 0);
}

#[tokio::test]
async fn test_subscribe_binds_prefixed_queue() {
    let (broker, manager, _) = setup();
    let handler = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("svc", "posts.>", handler))
        .await
        .unwrap();

    assert!(manager.is_subscribed("svc", "posts.#").await);
    assert_eq!(broker.bindings("posts.#-svc"), vec!["events.posts.#".to_string()]);
}

#[tokio::test]
async fn test_matching_subscriptions_receive_publication() {
    let (_, manager, publisher) = setup();
    let posts = Arc::new(CountingHandler::new());
    let likes = Arc::new(CountingHandler::new());
    let everything = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("a", "posts.created", posts.clone()))
        .await
        .unwrap();
    manager
        .subscribe(SubscriberConfig::new("b", "likes.*", likes.clone()))
        .await
        .unwrap();
    manager
        .subscribe(SubscriberConfig::new("c", ">", everything.clone()))
        .await
        .unwrap();

    publisher
        .publish("posts.created", event(json!({"user_id": "u1", "content": "hi"})))
        .await
        .unwrap();
    publisher
        .publish("comments.created", event(json!({"user_id": "u2"})))
        .await
        .unwrap();

    assert!(posts.wait_for(1, WAIT).await);
    assert!(everything.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(posts.handled(), 1);
    assert_eq!(likes.handled(), 0);
    assert_eq!(everything.handled(), 2);

    let received = posts.events().await;
    assert_eq!(received[0]["topic"], "posts.created");
    assert_eq!(received[0]["content"], "hi");
}

#[tokio::test]
async fn test_subscribe_twice_replaces_and_cancels_first_once() {
    let (broker, manager, publisher) = setup();
    let first = Arc::new(CountingHandler::new());
    let second = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("svc", "likes.created", first.clone()))
        .await
        .unwrap();
    manager
        .subscribe(SubscriberConfig::new("svc", "likes.created", second.clone()))
        .await
        .unwrap();

    assert_eq!(manager.subscription_count().await, 1);
    assert_eq!(first.cancel_count(), 1);
    assert_eq!(second.cancel_count(), 0);
    assert_eq!(broker.consumer_count(), 1);

    publisher
        .publish("likes.created", event(json!({"user_id": "u1"})))
        .await
        .unwrap();

    assert!(second.wait_for(1, WAIT).await);
    assert_eq!(first.handled(), 0);
}

#[tokio::test]
async fn test_unsubscribe_unknown_is_not_subscribed() {
    let (broker, manager, _) = setup();
    let handler = Arc::new(CountingHandler::new());
    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", handler.clone()))
        .await
        .unwrap();

    let result = manager.unsubscribe("other", "posts.created").await;
    assert!(matches!(result, Err(BusError::NotSubscribed)));
    let result = manager.unsubscribe("svc", "likes.created").await;
    assert!(matches!(result, Err(BusError::NotSubscribed)));

    assert_eq!(manager.subscription_count().await, 1);
    assert_eq!(handler.cancel_count(), 0);
    assert_eq!(broker.consumer_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_cancels_and_unbinds() {
    let (broker, manager, publisher) = setup();
    let handler = Arc::new(CountingHandler::new());
    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", handler.clone()))
        .await
        .unwrap();

    manager.unsubscribe("svc", "posts.created").await.unwrap();

    assert_eq!(manager.subscription_count().await, 0);
    assert_eq!(handler.cancel_count(), 1);
    assert_eq!(broker.consumer_count(), 0);
    assert!(broker.bindings("posts.created-svc").is_empty());

    publisher
        .publish("posts.created", EventPayload::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.handled(), 0);

    let again = manager.unsubscribe("svc", "posts.created").await;
    assert!(matches!(again, Err(BusError::NotSubscribed)));
    assert_eq!(handler.cancel_count(), 1);
}

#[tokio::test]
async fn test_handler_failure_terminates_loop_and_keeps_entry() {
    let broker = Arc::new(ChannelBroker::new());
    let observer = Arc::new(RecordingObserver::new());
    let manager = SubscriptionManager::new(broker.clone()).with_observer(observer.clone());
    let publisher = Publisher::new(broker.clone());

    let handler = Arc::new(CountingHandler::new());
    handler.set_fail_after(Some(0)).await;
    manager
        .subscribe(SubscriberConfig::new("svc", "likes.created", handler.clone()))
        .await
        .unwrap();

    publisher
        .publish("likes.created", event(json!({"user_id": "u1"})))
        .await
        .unwrap();

    assert_eq!(
        observer.wait_for_exit(WAIT).await,
        Some(LoopExit::HandlerFailed)
    );
    assert!(manager.is_subscribed("svc", "likes.created").await);
    assert_eq!(broker.consumer_count(), 0);

    // Unsubscribing a dead loop still runs the cancel hook exactly once.
    manager.unsubscribe("svc", "likes.created").await.unwrap();
    assert_eq!(handler.cancel_count(), 1);
}

#[tokio::test]
async fn test_handler_failure_requeues_for_next_subscriber() {
    let (_, manager, publisher) = setup();
    let failing = Arc::new(CountingHandler::new());
    failing.set_fail_after(Some(0)).await;
    manager
        .subscribe(SubscriberConfig::new("svc", "shares.created", failing.clone()))
        .await
        .unwrap();

    publisher
        .publish("shares.created", event(json!({"user_id": "u9"})))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager
        .is_loop_finished("svc", "shares.created")
        .await
        .unwrap());

    let healthy = Arc::new(CountingHandler::new());
    manager
        .subscribe(SubscriberConfig::new("svc", "shares.created", healthy.clone()))
        .await
        .unwrap();

    assert!(healthy.wait_for(1, WAIT).await);
    assert_eq!(healthy.events().await[0]["user_id"], "u9");
}

#[tokio::test]
async fn test_undecodable_message_terminates_loop() {
    let broker = Arc::new(ChannelBroker::new());
    let observer = Arc::new(RecordingObserver::new());
    let manager = SubscriptionManager::new(broker.clone()).with_observer(observer.clone());
    let handler = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", handler.clone()))
        .await
        .unwrap();

    broker
        .publish("events.posts.created", b"not json".to_vec())
        .await
        .unwrap();

    assert_eq!(
        observer.wait_for_exit(WAIT).await,
        Some(LoopExit::DecodeFailed)
    );
    assert_eq!(handler.handled(), 0);

    let exits = observer.exits();
    assert_eq!(exits[0].0, "posts.created");
    assert_eq!(exits[0].1, "svc");
}

#[tokio::test]
async fn test_broker_close_ends_loop_cleanly() {
    let broker = Arc::new(ChannelBroker::new());
    let observer = Arc::new(RecordingObserver::new());
    let manager = SubscriptionManager::new(broker.clone()).with_observer(observer.clone());
    let handler = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("svc", "#", handler.clone()))
        .await
        .unwrap();

    broker.close().await.unwrap();

    assert_eq!(observer.wait_for_exit(WAIT).await, Some(LoopExit::Closed));
    // The entry survives until explicitly removed.
    assert!(manager.is_subscribed("svc", "#").await);
}

#[tokio::test]
async fn test_close_tears_down_everything() {
    let (broker, manager, _) = setup();
    let a = Arc::new(CountingHandler::new());
    let b = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("a", "posts.*", a.clone()))
        .await
        .unwrap();
    manager
        .subscribe(SubscriberConfig::new("b", "#", b.clone()))
        .await
        .unwrap();

    manager.close().await.unwrap();

    assert_eq!(manager.subscription_count().await, 0);
    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(a.cancel_count(), 1);
    assert_eq!(b.cancel_count(), 1);
}

#[tokio::test]
async fn test_concurrent_unsubscribe_cancels_once() {
    let (_, manager, _) = setup();
    let manager = Arc::new(manager);
    let handler = Arc::new(CountingHandler::new());
    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", handler.clone()))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.unsubscribe("svc", "posts.created").await })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(handler.cancel_count(), 1);
}

/// Channel broker whose consumer cancel fails a fixed number of times.
struct FailingCancelBroker {
    inner: ChannelBroker,
    cancel_failures: std::sync::atomic::AtomicUsize,
}

impl FailingCancelBroker {
    fn new(cancel_failures: usize) -> Self {
        Self {
            inner: ChannelBroker::new(),
            cancel_failures: std::sync::atomic::AtomicUsize::new(cancel_failures),
        }
    }
}

#[async_trait::async_trait]
impl Broker for FailingCancelBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.inner.publish(subject, payload).await
    }

    async fn consume(&self, queue: &str, binding: &str) -> Result<crate::bus::Consumer> {
        self.inner.consume(queue, binding).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let failing = self
            .cancel_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Unsubscribe("transient".to_string()));
        }
        self.inner.cancel(consumer_tag).await
    }

    async fn unbind(&self, queue: &str, binding: &str) -> Result<()> {
        self.inner.unbind(queue, binding).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_failed_unsubscribe_keeps_subscription_for_retry() {
    let broker = Arc::new(FailingCancelBroker::new(1));
    let manager = SubscriptionManager::new(broker.clone());
    let publisher = Publisher::new(broker.clone());
    let handler = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", handler.clone()))
        .await
        .unwrap();

    let result = manager.unsubscribe("svc", "posts.created").await;
    assert!(matches!(result, Err(BusError::Unsubscribe(_))));
    assert!(manager.is_subscribed("svc", "posts.created").await);
    assert_eq!(handler.cancel_count(), 0);

    // The loop is still consuming until the retry succeeds.
    publisher
        .publish("posts.created", event(json!({"user_id": "u1"})))
        .await
        .unwrap();
    assert!(handler.wait_for(1, WAIT).await);

    manager.unsubscribe("svc", "posts.created").await.unwrap();
    assert!(!manager.is_subscribed("svc", "posts.created").await);
    assert_eq!(handler.cancel_count(), 1);
    assert_eq!(broker.inner.consumer_count(), 0);

    publisher
        .publish("posts.created", event(json!({"user_id": "u2"})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.handled(), 1);
}

#[tokio::test]
async fn test_failed_replace_keeps_old_subscription() {
    let broker = Arc::new(FailingCancelBroker::new(1));
    let manager = SubscriptionManager::new(broker.clone());
    let first = Arc::new(CountingHandler::new());
    let second = Arc::new(CountingHandler::new());

    manager
        .subscribe(SubscriberConfig::new("svc", "likes.*", first.clone()))
        .await
        .unwrap();

    let result = manager
        .subscribe(SubscriberConfig::new("svc", "likes.*", second.clone()))
        .await;
    assert!(result.is_err());
    assert_eq!(manager.subscription_count().await, 1);
    assert_eq!(first.cancel_count(), 0);

    manager
        .subscribe(SubscriberConfig::new("svc", "likes.*", second.clone()))
        .await
        .unwrap();
    assert_eq!(manager.subscription_count().await, 1);
    assert_eq!(first.cancel_count(), 1);
    assert_eq!(broker.inner.consumer_count(), 1);
}

#[tokio::test]
async fn test_handler_failure_leaves_backlog_for_next_subscriber() {
    let (_, manager, publisher) = setup();
    let failing = Arc::new(CountingHandler::new());
    failing.set_fail_after(Some(0)).await;

    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", failing.clone()))
        .await
        .unwrap();
    for i in 0..3 {
        publisher
            .publish("posts.created", event(json!({"seq": i})))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager
        .is_loop_finished("svc", "posts.created")
        .await
        .unwrap());

    let healthy = Arc::new(CountingHandler::new());
    manager
        .subscribe(SubscriberConfig::new("svc", "posts.created", healthy.clone()))
        .await
        .unwrap();

    assert!(healthy.wait_for(3, WAIT).await);
    let mut seqs: Vec<i64> = healthy
        .events()
        .await
        .iter()
        .filter_map(|e| e["seq"].as_i64())
        .collect();
    seqs.sort();
    assert_eq!(seqs, vec![0, 1, 2]);
}
