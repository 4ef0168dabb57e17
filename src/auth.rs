use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token refresh request failed: {0}")]
    Request(String),
    #[error("token refresh rejected with status {0}")]
    Rejected(u16),
    #[error("invalid refresh endpoint: {0}")]
    InvalidEndpoint(String),
}

/// The one credential shared across every component. `current_token` is read
/// per call so a refresh performed by any component is picked up by all of
/// them on their next connection attempt.
///
/// Refreshes are not deduplicated across concurrent consumers; redundant
/// refreshes of the same expired token are tolerated as idempotent.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> String;

    async fn refresh_token(&self) -> Result<(), AuthError>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
}

/// Token provider backed by the API's refresh endpoint
/// (`GET /api/refresh_token` authenticated with the current token).
pub struct HttpTokenProvider {
    endpoint: Url,
    client: reqwest::Client,
    token: RwLock<String>,
}

impl HttpTokenProvider {
    pub fn new(base_url: &Url, initial_token: impl Into<String>) -> Result<Self, AuthError> {
        let endpoint = base_url
            .join("/api/refresh_token")
            .map_err(|err| AuthError::InvalidEndpoint(err.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()
            .map_err(|err| AuthError::Request(err.to_string()))?;
        Ok(Self {
            endpoint,
            client,
            token: RwLock::new(initial_token.into()),
        })
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    fn current_token(&self) -> String {
        self.token.read().clone()
    }

    async fn refresh_token(&self) -> Result<(), AuthError> {
        let current = self.current_token();
        let response = self
            .client
            .get(self.endpoint.clone())
            .header("X-Session-Token", current)
            .send()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected(response.status().as_u16()));
        }

        let payload = response
            .json::<RefreshResponse>()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;
        *self.token.write() = payload.token;
        debug!("session token refreshed");
        Ok(())
    }
}
