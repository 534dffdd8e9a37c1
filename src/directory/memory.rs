//! Static in-memory directory.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{Directory, DirectoryError, Following, FollowingsPage, Result};

/// Directory with a fixed set of tokens and followings.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    tokens: HashMap<String, String>,
    followings: HashMap<String, Vec<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session token for a user.
    pub fn with_user(mut self, token: &str, user_id: &str) -> Self {
        self.tokens.insert(token.to_string(), user_id.to_string());
        self
    }

    /// Record that `follower` follows `followee`.
    pub fn with_following(mut self, follower: &str, followee: &str) -> Self {
        let list = self.followings.entry(follower.to_string()).or_default();
        if !list.iter().any(|f| f == followee) {
            list.push(followee.to_string());
        }
        self
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn identify_user(&self, token: &str) -> Result<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(DirectoryError::Unauthorized)
    }

    async fn get_followings(
        &self,
        user_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<FollowingsPage> {
        let all = self.followings.get(user_id).map(Vec::as_slice).unwrap_or_default();

        let followings = all
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|followee| Following {
                follower_id: user_id.to_string(),
                followee_id: followee.clone(),
            })
            .collect();

        Ok(FollowingsPage {
            total: all.len() as u64,
            offset,
            limit,
            followings,
        })
    }
}
