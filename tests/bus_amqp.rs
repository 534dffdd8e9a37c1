//! AMQP/RabbitMQ bus integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use herald::bus::{
    AmqpBroker, AmqpConfig, Broker, BusError, EventHandler, EventPayload, Publisher,
    SubscriberConfig, SubscriptionManager,
};
use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Forwards every handled event's topic to a channel.
struct ForwardingHandler {
    tx: mpsc::UnboundedSender<String>,
    cancelled: Arc<AtomicUsize>,
}

impl ForwardingHandler {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(Self {
            tx,
            cancelled: cancelled.clone(),
        });
        (handler, rx, cancelled)
    }
}

impl EventHandler for ForwardingHandler {
    fn handle(&self, event: Arc<EventPayload>) -> BoxFuture<'static, Result<(), BusError>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            let topic = event
                .get("topic")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            let _ = tx.send(topic);
            Ok(())
        })
    }

    fn cancel(&self) -> Result<(), BusError> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails every event it is given.
struct RejectingHandler;

impl EventHandler for RejectingHandler {
    fn handle(&self, _event: Arc<EventPayload>) -> BoxFuture<'static, Result<(), BusError>> {
        Box::pin(async { Err(BusError::Handler("rejected".to_string())) })
    }
}

fn payload(value: serde_json::Value) -> EventPayload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn connect(url: &str) -> Arc<dyn Broker> {
    let broker = AmqpBroker::connect(AmqpConfig::new(url).with_exchange(format!(
        "herald-test-{}",
        uuid::Uuid::new_v4()
    )))
    .await
    .expect("Failed to connect to RabbitMQ");
    Arc::new(broker)
}

#[tokio::test]
async fn test_amqp_routes_to_matching_subscribers() {
    let (_container, url) = start_rabbitmq().await;
    let broker = connect(&url).await;
    let manager = SubscriptionManager::new(broker.clone());
    let publisher = Publisher::new(broker.clone());

    let (posts, mut posts_rx, _) = ForwardingHandler::new();
    let (all, mut all_rx, _) = ForwardingHandler::new();
    manager
        .subscribe(SubscriberConfig::new("posts", "posts.*", posts))
        .await
        .unwrap();
    manager
        .subscribe(SubscriberConfig::new("all", ">", all))
        .await
        .unwrap();

    publisher
        .publish("posts.created", payload(json!({"user_id": "u1", "content": "hi"})))
        .await
        .unwrap();
    publisher
        .publish("likes.created", payload(json!({"user_id": "u1", "content": "p1"})))
        .await
        .unwrap();

    assert_eq!(recv(&mut posts_rx).await.as_deref(), Some("posts.created"));

    let mut seen = vec![recv(&mut all_rx).await, recv(&mut all_rx).await];
    seen.sort();
    assert_eq!(
        seen,
        vec![Some("likes.created".to_string()), Some("posts.created".to_string())]
    );

    // Only one post event went out.
    assert!(tokio::time::timeout(Duration::from_millis(500), posts_rx.recv())
        .await
        .is_err());

    manager.close().await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_amqp_resubscribe_replaces_and_cancels_once() {
    let (_container, url) = start_rabbitmq().await;
    let broker = connect(&url).await;
    let manager = SubscriptionManager::new(broker.clone());
    let publisher = Publisher::new(broker.clone());

    let (first, _first_rx, first_cancelled) = ForwardingHandler::new();
    let (second, mut second_rx, _) = ForwardingHandler::new();

    manager
        .subscribe(SubscriberConfig::new("n", "comments.*", first))
        .await
        .unwrap();
    manager
        .subscribe(SubscriberConfig::new("n", "comments.*", second))
        .await
        .unwrap();

    assert_eq!(manager.subscription_count().await, 1);
    assert_eq!(first_cancelled.load(Ordering::SeqCst), 1);

    publisher
        .publish("comments.created", payload(json!({"user_id": "u1"})))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut second_rx).await.as_deref(),
        Some("comments.created")
    );

    manager.close().await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_amqp_unsubscribe_unbinds_queue() {
    let (_container, url) = start_rabbitmq().await;
    let broker = connect(&url).await;
    let manager = SubscriptionManager::new(broker.clone());
    let publisher = Publisher::new(broker.clone());

    let (handler, mut rx, cancelled) = ForwardingHandler::new();
    manager
        .subscribe(SubscriberConfig::new("s", "shares.*", handler))
        .await
        .unwrap();
    manager.unsubscribe("s", "shares.*").await.unwrap();
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    assert!(matches!(
        manager.unsubscribe("s", "shares.*").await,
        Err(BusError::NotSubscribed)
    ));

    publisher
        .publish("shares.created", payload(json!({"user_id": "u1"})))
        .await
        .unwrap();

    // Re-subscribing to the same queue finds nothing: the binding was removed.
    let (again, mut again_rx, _) = ForwardingHandler::new();
    manager
        .subscribe(SubscriberConfig::new("s", "shares.*", again))
        .await
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(500), again_rx.recv())
        .await
        .is_err());
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .map(|v| v.is_none())
        .unwrap_or(true));

    manager.close().await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_amqp_handler_failure_leaves_every_message_for_next_subscriber() {
    let (_container, url) = start_rabbitmq().await;
    let broker = connect(&url).await;
    let manager = SubscriptionManager::new(broker.clone());
    let publisher = Publisher::new(broker.clone());

    manager
        .subscribe(SubscriberConfig::new("n", "likes.*", Arc::new(RejectingHandler)))
        .await
        .unwrap();
    for i in 0..3 {
        publisher
            .publish("likes.created", payload(json!({"user_id": "u1", "content": i})))
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.is_loop_finished("n", "likes.*").await != Some(true) {
        assert!(tokio::time::Instant::now() < deadline, "loop did not stop");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (handler, mut rx, _) = ForwardingHandler::new();
    manager
        .subscribe(SubscriberConfig::new("n", "likes.*", handler))
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(recv(&mut rx).await.as_deref(), Some("likes.created"));
    }

    manager.close().await.unwrap();
    broker.close().await.unwrap();
}
