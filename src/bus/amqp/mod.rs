//! AMQP (RabbitMQ) broker implementation.
//!
//! One connection and one channel are opened at startup and shared by the
//! publisher and every subscription. Uses a durable topic exchange for routing.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{Acknowledger, Broker, BusError, Consumer, Delivery, Result, EXCHANGE_NAME};

/// Application id stamped on published messages.
const APP_ID: &str = "herald-publisher";

/// Delivery loops handle one message at a time.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Configuration for AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange name.
    pub exchange: String,
    /// Number of connection attempts before giving up.
    pub connect_attempts: usize,
    /// Unacknowledged deliveries the broker pushes to each consumer.
    pub prefetch: u16,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: EXCHANGE_NAME.to_string(),
            connect_attempts: 5,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// AMQP broker using RabbitMQ.
///
/// Messages are published to a topic exchange under `<prefix>.<topic>`.
/// Subscribers bind durable queues with patterns like `events.posts.*` or `events.#`.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    config: AmqpConfig,
}

impl AmqpBroker {
    /// Connect, open the shared channel and declare the exchange.
    ///
    /// Connection attempts are retried with exponential backoff and jitter.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(config.connect_attempts)
            .with_jitter();

        let url = config.url.as_str();
        let connection = (|| async move {
            Connection::connect(url, ConnectionProperties::default()).await
        })
        .retry(backoff)
        .notify(|e, delay| {
            warn!(error = %e, backoff_ms = %delay.as_millis(), "AMQP connect failed, retrying");
        })
        .await
        .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        // Zero would mean unlimited.
        channel
            .basic_qos(config.prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to set prefetch: {}", e)))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            prefetch = config.prefetch,
            "Connected to AMQP"
        );

        Ok(Self {
            connection,
            channel,
            config,
        })
    }

    /// Exchange this broker publishes to.
    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }
}

/// Settles an AMQP delivery on the channel it arrived on.
struct AmqpAcker(lapin::acker::Acker);

impl Acknowledger for AmqpAcker {
    fn ack(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| BusError::Connection(format!("Failed to ack message: {}", e)))
        })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0
                .reject(BasicRejectOptions { requeue })
                .await
                .map_err(|e| BusError::Connection(format!("Failed to reject message: {}", e)))
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[tracing::instrument(name = "bus.amqp.publish", skip(self, payload), fields(exchange = %self.config.exchange))]
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_app_id(APP_ID.into());

        // The returned confirm is not awaited: publishing is fire-and-forget.
        self.channel
            .basic_publish(
                &self.config.exchange,
                subject,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(subject = %subject, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, binding: &str) -> Result<Consumer> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        self.channel
            .queue_bind(
                queue,
                &self.config.exchange,
                binding,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(queue = %queue, binding = %binding, "Bound queue to exchange");

        let consumer = self
            .channel
            .basic_consume(
                queue,
                queue,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let tag = consumer.tag().as_str().to_string();
        let deliveries = consumer
            .map(|next| {
                next.map(|delivery| {
                    Delivery::new(delivery.routing_key.as_str(), delivery.data)
                        .with_acker(Box::new(AmqpAcker(delivery.acker)))
                })
                .map_err(|e| BusError::Connection(format!("Consumer delivery error: {}", e)))
            })
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Unsubscribe(format!("Failed to cancel consumer: {}", e)))?;

        debug!(consumer = %consumer_tag, "Cancelled consumer");
        Ok(())
    }

    async fn unbind(&self, queue: &str, binding: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, &self.config.exchange, binding, FieldTable::default())
            .await
            .map_err(|e| BusError::Unsubscribe(format!("Failed to unbind queue: {}", e)))?;

        debug!(queue = %queue, binding = %binding, "Unbound queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;

        info!(url = %self.config.url, "AMQP connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_to_events_exchange() {
        let config = AmqpConfig::new("amqp://localhost:5672");
        assert_eq!(config.exchange, "events");
        assert_eq!(config.url, "amqp://localhost:5672");
    }

    #[test]
    fn test_config_with_exchange() {
        let config = AmqpConfig::new("amqp://localhost:5672").with_exchange("social.events");
        assert_eq!(config.exchange, "social.events");
    }
}
