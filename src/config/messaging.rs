//! Messaging and event bus configuration types.

use serde::Deserialize;

use crate::bus::{EXCHANGE_NAME, SUBJECT_PREFIX};

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process topic exchange (no external broker).
    #[default]
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Subject prefix prepended to every topic.
    pub prefix: String,
    /// AMQP-specific configuration.
    pub amqp: AmqpSettings,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            prefix: SUBJECT_PREFIX.to_string(),
            amqp: AmqpSettings::default(),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Topic exchange name.
    pub exchange: String,
    /// Per-consumer prefetch window.
    pub prefetch: u16,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: EXCHANGE_NAME.to_string(),
            prefetch: 1,
        }
    }
}
