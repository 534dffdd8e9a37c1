//! Users service over HTTP.
//!
//! - `POST {base}/users/identify` with `Authorization: Bearer <token>` returns `{"id": ...}`
//! - `GET {base}/users/{id}/following?offset=&limit=` returns a followings page

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{Directory, DirectoryError, FollowingsPage, Result};

#[derive(Deserialize)]
struct IdentifyResponse {
    id: String,
}

/// HTTP client for the users service.
#[derive(Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: Url,
    service_token: Option<String>,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| DirectoryError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            service_token: None,
        })
    }

    /// Authenticate followings requests with a service token.
    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }

    /// `{base}/` followed by `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Map non-success statuses to directory errors.
fn check_status(status: StatusCode) -> Result<()> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DirectoryError::Unauthorized),
        s if s.is_server_error() => Err(DirectoryError::Unavailable(format!("status {}", s))),
        s => Err(DirectoryError::InvalidResponse(format!("status {}", s))),
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn identify_user(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Err(DirectoryError::Unauthorized);
        }

        let response = self
            .client
            .post(self.endpoint(&["users", "identify"])?)
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response.status())?;

        let body: IdentifyResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::InvalidResponse(e.to_string()))?;
        if body.id.is_empty() {
            return Err(DirectoryError::Unauthorized);
        }

        debug!(user = %body.id, "Identified user");
        Ok(body.id)
    }

    async fn get_followings(
        &self,
        user_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<FollowingsPage> {
        let mut request = self
            .client
            .get(self.endpoint(&["users", user_id, "following"])?)
            .query(&[("offset", offset), ("limit", limit)]);
        if let Some(token) = &self.service_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        check_status(response.status())?;

        response
            .json()
            .await
            .map_err(|e| DirectoryError::InvalidResponse(e.to_string()))
    }
}
