//! Event bus for async delivery.
//!
//! This module contains:
//! - `Broker` trait: the topic exchange primitives (publish, bind, consume, cancel)
//! - `EventHandler` trait: for processing decoded event payloads
//! - `Publisher`: stamps and publishes events
//! - `SubscriptionManager`: per-consumer subscriptions over a shared broker
//! - Implementations: AMQP (RabbitMQ), in-process channel exchange

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod publisher;
pub mod subscription;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
pub use channel::ChannelBroker;
pub use publisher::Publisher;
pub use subscription::{
    LoopExit, LoopObserver, SubscriberConfig, Subscription, SubscriptionManager,
};

/// Name of the topic exchange shared by every publisher and subscriber.
pub const EXCHANGE_NAME: &str = "events";

/// Prefix prepended to every topic to form the routing key.
pub const SUBJECT_PREFIX: &str = "events";

/// Topic matching every event on the exchange.
pub const ALL_EVENTS: &str = "#";

/// Event payload as carried on the wire: a JSON object of untyped fields.
pub type EventPayload = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("empty topic")]
    EmptyTopic,

    #[error("empty subscriber id")]
    EmptyId,

    #[error("not subscribed")]
    NotSubscribed,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("Failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl BusError {
    /// True for errors raised before any broker I/O.
    pub fn is_validation(&self) -> bool {
        matches!(self, BusError::EmptyTopic | BusError::EmptyId)
    }
}

/// Handler for processing events from the bus.
pub trait EventHandler: Send + Sync {
    /// Process one decoded event payload.
    fn handle(&self, event: Arc<EventPayload>)
        -> BoxFuture<'static, std::result::Result<(), BusError>>;

    /// Called once when the subscription feeding this handler is cancelled.
    fn cancel(&self) -> std::result::Result<(), BusError> {
        Ok(())
    }
}

/// Settles a delivery with the broker it came from.
pub trait Acknowledger: Send + Sync {
    fn ack(&self) -> BoxFuture<'_, Result<()>>;

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>>;
}

/// A raw message received from a bound queue.
pub struct Delivery {
    /// Routing key the message was published under.
    pub routing_key: String,
    /// Message body.
    pub data: Vec<u8>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            data,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the message, optionally returning it to its queue.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries from a started consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A consumer started on a bound queue.
pub struct Consumer {
    /// Tag identifying the consumer on the broker channel.
    pub tag: String,
    /// Deliveries; ends when the consumer is cancelled or the channel closes.
    pub deliveries: DeliveryStream,
}

/// Topic exchange primitives shared by the publisher and the subscription manager.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-process topic exchange for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to the exchange under `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Declare a durable queue, bind it under `binding` and start a consumer on it.
    async fn consume(&self, queue: &str, binding: &str) -> Result<Consumer>;

    /// Stop a consumer. Its delivery stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Remove a queue binding. The queue itself is kept.
    async fn unbind(&self, queue: &str, binding: &str) -> Result<()>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Subjects
// ============================================================================

/// Normalize the `>` wildcard terminator to the broker's multi-level `#`.
pub fn format_topic(topic: &str) -> String {
    topic.replace('>', "#")
}

/// Build the routing key for a topic: `<prefix>.<topic>`, normalized.
pub fn subject(prefix: &str, topic: &str) -> String {
    if prefix.is_empty() {
        return format_topic(topic);
    }
    format_topic(&format!("{}.{}", prefix, topic))
}

/// Check a routing key against a topic exchange binding pattern.
///
/// Matching rules:
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - anything else matches the word literally
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => words_match(rest, key_rest),
            _ => false,
        },
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker connection based on configuration.
///
/// Opened once at startup and shared by the publisher and subscription manager.
pub async fn init_broker(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let amqp_config = AmqpConfig::new(&config.amqp.url)
                    .with_exchange(&config.amqp.exchange)
                    .with_prefetch(config.amqp.prefetch);
                let broker = AmqpBroker::connect(amqp_config).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}
