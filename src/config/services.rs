//! Directory, delivery and subscription configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::ALL_EVENTS;

/// Directory type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryType {
    /// Fixed users and followings from configuration.
    #[default]
    Static,
    /// Users service over HTTP.
    Http,
}

/// Directory configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    #[serde(rename = "type")]
    pub directory_type: DirectoryType,
    /// Base URL of the users service.
    pub url: String,
    /// Page size for followings requests.
    pub page_size: u64,
    pub timeout_secs: u64,
    /// Bearer token sent on followings requests.
    pub service_token: Option<String>,
    /// Static directory contents.
    pub users: Vec<StaticUser>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            directory_type: DirectoryType::Static,
            url: "http://localhost:9000".to_string(),
            page_size: 100,
            timeout_secs: 10,
            service_token: None,
            users: Vec::new(),
        }
    }
}

/// A user in the static directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StaticUser {
    pub id: String,
    /// Session token that identifies this user.
    pub token: String,
    /// Ids of users this user follows.
    pub follows: Vec<String>,
}

/// Client delivery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Sleep between live-loop scans that found nothing.
    pub poll_interval_secs: u64,
    /// Page size for the backlog drain.
    pub page_size: u64,
    /// Buffered notifications per client stream.
    pub channel_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            page_size: 100,
            channel_capacity: 64,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// The notification consumer's broker subscription.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub id: String,
    pub topic: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            id: "notifications".to_string(),
            topic: ALL_EVENTS.to_string(),
        }
    }
}
