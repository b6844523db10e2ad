//! Outbound HTTP calls carrying OAuth bearer tokens
//!
//! Two kinds of caller:
//! - the service itself, with a client credentials token that is cached and
//!   only requested again once it stops being live
//! - the signed-in user, with the access token handed out by the
//!   [`RefreshCoordinator`](crate::RefreshCoordinator)

use std::sync::Arc;

use reqwest::{Method, RequestBuilder};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::provider::HttpIdentityProvider;
use crate::token::OAuthToken;

/// Builds authenticated requests to downstream APIs.
pub struct OutboundClient {
    http: reqwest::Client,
    provider: Arc<HttpIdentityProvider>,
    service_token: Mutex<Option<OAuthToken>>,
}

impl OutboundClient {
    /// Shares the provider's HTTP client and its timeout.
    pub fn new(provider: Arc<HttpIdentityProvider>) -> Self {
        Self {
            http: provider.http_client().clone(),
            provider,
            service_token: Mutex::new(None),
        }
    }

    /// Client credentials token of the service.
    ///
    /// The lock is held across the grant, so concurrent callers wait for one
    /// request instead of each fetching their own token.
    pub async fn client_token(&self) -> Result<OAuthToken> {
        let mut cached = self.service_token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_live()) {
            return Ok(token.clone());
        }
        let token = self.provider.client_credentials().await?;
        debug!(expires_at = ?token.expires_at, "client credentials token fetched");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Request authenticated as the service.
    pub async fn client_request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.client_token().await?;
        Ok(self.bearer(method, url, &token))
    }

    /// Request carrying `token`, typically a user's live access token.
    pub fn bearer(&self, method: Method, url: &str, token: &OAuthToken) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&token.access_token)
    }
}
