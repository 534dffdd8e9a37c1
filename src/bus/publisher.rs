//! Event publisher.
//!
//! Stamps each event with its topic and a nanosecond timestamp, serializes it
//! to JSON and hands it to the broker under `<prefix>.<topic>`.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{subject, Broker, BusError, EventPayload, Result, SUBJECT_PREFIX};

/// Payload field carrying the publish timestamp (ns since epoch).
pub const TIMESTAMP_FIELD: &str = "timestamp";
/// Payload field carrying the unprefixed topic.
pub const TOPIC_FIELD: &str = "topic";

/// Publishes domain events to the shared topic exchange.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    prefix: String,
}

impl Publisher {
    /// Create a publisher using the default `events` subject prefix.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_prefix(broker, SUBJECT_PREFIX)
    }

    pub fn with_prefix(broker: Arc<dyn Broker>, prefix: impl Into<String>) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
        }
    }

    /// Publish an event.
    ///
    /// `timestamp` and `topic` are always set here; values supplied by the
    /// caller under those keys are overwritten.
    #[tracing::instrument(name = "bus.publish", skip(self, payload), fields(topic = %topic))]
    pub async fn publish(&self, topic: &str, mut payload: EventPayload) -> Result<()> {
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }

        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        payload.insert(TIMESTAMP_FIELD.to_string(), Value::from(timestamp));
        payload.insert(TOPIC_FIELD.to_string(), Value::from(topic));

        let data = serde_json::to_vec(&payload)?;
        let subject = subject(&self.prefix, topic);

        self.broker.publish(&subject, data).await?;

        debug!(subject = %subject, "Published event");
        Ok(())
    }

    /// Release the broker connection. Called once at shutdown.
    pub async fn close(&self) -> Result<()> {
        self.broker.close().await
    }
}
