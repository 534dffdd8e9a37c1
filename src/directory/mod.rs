//! Users directory: session tokens to user ids, and who follows whom.
//!
//! Backings:
//! - `HttpDirectory`: the users service over HTTP (reqwest)
//! - `MemoryDirectory`: fixed users and followings, for standalone runs and tests

pub mod http;
pub mod memory;

pub use http::HttpDirectory;
pub use memory::MemoryDirectory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{DirectoryConfig, DirectoryType};

/// Result type for directory operations.
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Errors from the users directory.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid directory response: {0}")]
    InvalidResponse(String),

    #[error("Invalid directory URL: {0}")]
    InvalidUrl(String),
}

/// A follow relationship: `follower_id` follows `followee_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Following {
    pub follower_id: String,
    pub followee_id: String,
}

/// One page of followings plus the total available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowingsPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub followings: Vec<Following>,
}

/// The users service as seen by the notification system.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve a session token to a user id. `Unauthorized` if the token is invalid.
    async fn identify_user(&self, token: &str) -> Result<String>;

    /// Users that `user_id` follows, one page at a time.
    async fn get_followings(&self, user_id: &str, offset: u64, limit: u64)
        -> Result<FollowingsPage>;
}

/// Collect every followee of `user_id`, paging `page_size` at a time.
///
/// Stops when the reported total is reached or a page comes back empty.
/// Duplicates are dropped; first-seen order is kept.
pub async fn collect_followees(
    directory: &dyn Directory,
    user_id: &str,
    page_size: u64,
) -> Result<Vec<String>> {
    let page_size = page_size.max(1);
    let mut followees: Vec<String> = Vec::new();
    let mut offset = 0;

    loop {
        let page = directory.get_followings(user_id, offset, page_size).await?;
        let fetched = page.followings.len() as u64;

        for following in page.followings {
            if !followees.contains(&following.followee_id) {
                followees.push(following.followee_id);
            }
        }

        offset += fetched;
        if fetched == 0 || offset >= page.total {
            break;
        }
    }

    debug!(user = %user_id, count = followees.len(), "Collected followees");
    Ok(followees)
}

/// Initialize the directory based on configuration.
pub fn init_directory(
    config: &DirectoryConfig,
) -> std::result::Result<Arc<dyn Directory>, Box<dyn std::error::Error + Send + Sync>> {
    match config.directory_type {
        DirectoryType::Static => {
            let mut directory = MemoryDirectory::new();
            for user in &config.users {
                directory = directory.with_user(&user.token, &user.id);
                for followee in &user.follows {
                    directory = directory.with_following(&user.id, followee);
                }
            }

            info!(directory_type = "static", users = config.users.len(), "Directory initialized");
            Ok(Arc::new(directory))
        }
        DirectoryType::Http => {
            let mut directory =
                HttpDirectory::new(&config.url, Duration::from_secs(config.timeout_secs))?;
            if let Some(token) = &config.service_token {
                directory = directory.with_service_token(token.clone());
            }

            info!(directory_type = "http", url = %config.url, "Directory initialized");
            Ok(Arc::new(directory))
        }
    }
}
