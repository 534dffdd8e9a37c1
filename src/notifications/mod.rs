//! Notifications: the record type, the event decoder, the consumer that feeds
//! the fan-out store and the token-authenticated notification service.

pub mod consumer;
pub mod decoder;
pub mod service;

pub use consumer::NotificationEventHandler;
pub use decoder::decode;
pub use service::NotificationService;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::DirectoryError;
use crate::fanout::FanoutError;
use crate::storage::StorageError;

/// What kind of activity a notification reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Event topic not recognized. Never persisted.
    #[default]
    Unknown,
    Post,
    Follow,
    Like,
    Comment,
    Share,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Unknown => "Unknown",
            Category::Post => "Post",
            Category::Follow => "Follow",
            Category::Like => "Like",
            Category::Comment => "Comment",
            Category::Share => "Share",
        }
    }

    /// Parse a stored category name. Unrecognized names map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Post" => Category::Post,
            "Follow" => Category::Follow,
            "Like" => Category::Like,
            "Comment" => Category::Comment,
            "Share" => Category::Share,
            _ => Category::Unknown,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-user notification.
///
/// The decoder produces notifications without an id; the repository assigns
/// the id and both timestamps on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub category: Category,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// A new unread notification that has not been stored yet.
    pub fn new(user_id: impl Into<String>, category: Category, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            user_id: user_id.into(),
            category,
            content: content.into(),
            is_read: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Selection criteria for repository queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationFilter {
    pub user_id: Option<String>,
    /// Restrict to notifications owned by any of these users. An empty list matches nothing.
    pub user_ids: Option<Vec<String>>,
    pub category: Option<Category>,
    pub is_read: Option<bool>,
}

impl NotificationFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn unread(mut self) -> Self {
        self.is_read = Some(false);
        self
    }

    /// True if `notification` satisfies every set criterion.
    pub fn matches(&self, notification: &Notification) -> bool {
        if let Some(user_id) = &self.user_id {
            if &notification.user_id != user_id {
                return false;
            }
        }
        if let Some(user_ids) = &self.user_ids {
            if !user_ids.contains(&notification.user_id) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if notification.category != category {
                return false;
            }
        }
        if let Some(is_read) = self.is_read {
            if notification.is_read != is_read {
                return false;
            }
        }
        true
    }
}

/// Offset/limit paging request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// One page of notifications plus the total matching the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationsPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub notifications: Vec<Notification>,
}

/// Errors surfaced by the notification service.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),

    #[error(transparent)]
    Directory(DirectoryError),
}

impl From<DirectoryError> for NotificationError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Unauthorized => NotificationError::Unauthorized,
            other => NotificationError::Directory(other),
        }
    }
}
