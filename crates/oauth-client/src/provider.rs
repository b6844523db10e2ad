//! Identity provider token endpoint interactions
//!
//! Four POSTs, all standard OAuth2 form posts:
//! 1. Authorization code exchange (sign-in callback)
//! 2. Token refresh (request-time, via the refresh coordinator)
//! 3. Client credentials grant (service-to-service calls)
//! 4. End-session revocation (sign-out callback)
//!
//! Every call is bounded by the configured provider timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::options::{ClientOptions, PARAM_END_SESSION_ID, PARAM_STATE};
use crate::pkce::PkceMethod;
use crate::token::{OAuthToken, TokenResponse, unix_now};

/// Boxed future returned by [`IdentityProvider`] methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Inputs of an authorization code exchange.
#[derive(Debug, Clone, Default)]
pub struct CodeExchange<'a> {
    pub code: &'a str,
    /// PKCE proof, `(verifier, method)`.
    pub pkce: Option<(&'a str, PkceMethod)>,
    /// Refresh token of a previous sign-in, so the provider can revoke it.
    pub previous_refresh_token: Option<&'a str>,
}

/// Inputs of an end-session revocation.
#[derive(Debug, Clone)]
pub struct EndSession<'a> {
    pub state: &'a str,
    pub end_session_id: &'a str,
    pub refresh_token: &'a str,
}

/// The identity provider as seen by the flow and the refresh coordinator.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn IdentityProvider>`), so tests can substitute a fake provider.
pub trait IdentityProvider: Send + Sync {
    fn exchange_code<'a>(&'a self, request: CodeExchange<'a>) -> ProviderFuture<'a, OAuthToken>;

    fn refresh_token<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, OAuthToken>;

    fn end_session<'a>(&'a self, request: EndSession<'a>) -> ProviderFuture<'a, ()>;
}

/// [`IdentityProvider`] backed by the provider's HTTP endpoints.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    options: Arc<ClientOptions>,
}

impl HttpIdentityProvider {
    pub fn new(options: Arc<ClientOptions>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))?;
        Ok(Self { client, options })
    }

    /// HTTP client shared with outbound calls, bounded by the provider timeout.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Token for the client itself (client credentials grant). Callers that
    /// make repeated calls go through [`OutboundClient`](crate::OutboundClient),
    /// which caches it.
    pub async fn client_credentials(&self) -> Result<OAuthToken> {
        let scope = self.options.scope();
        let mut form = self.client_form("client_credentials");
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        self.post_token(&form, "client credentials").await
    }

    fn client_form(&self, grant_type: &'static str) -> Vec<(&'static str, &str)> {
        vec![
            ("grant_type", grant_type),
            ("client_id", self.options.client_id.as_str()),
            ("client_secret", self.options.client_secret.expose().as_str()),
        ]
    }

    async fn post_token(&self, form: &[(&str, &str)], operation: &str) -> Result<OAuthToken> {
        let response = self
            .client
            .post(&self.options.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{operation} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::TokenExchange(format!(
                "{operation} returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {operation} response: {e}")))?;
        debug!(operation, "token endpoint call succeeded");
        Ok(OAuthToken::from_response(token, unix_now()))
    }
}

impl IdentityProvider for HttpIdentityProvider {
    fn exchange_code<'a>(&'a self, request: CodeExchange<'a>) -> ProviderFuture<'a, OAuthToken> {
        Box::pin(async move {
            let mut form = self.client_form("authorization_code");
            form.push(("code", request.code));
            form.push(("redirect_uri", self.options.redirect_url.as_str()));
            if let Some((verifier, method)) = request.pkce {
                form.push(("code_verifier", verifier));
                form.push(("code_challenge_method", method.as_str()));
            }
            if let Some(previous) = request.previous_refresh_token {
                form.push(("refresh_token", previous));
            }
            self.post_token(&form, "token exchange").await
        })
    }

    fn refresh_token<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, OAuthToken> {
        Box::pin(async move {
            let mut form = self.client_form("refresh_token");
            form.push(("refresh_token", refresh_token));
            match self.post_token(&form, "token refresh").await {
                Ok(mut token) => {
                    // Providers that do not rotate refresh tokens omit them
                    if token.refresh_token.is_none() {
                        token.refresh_token = Some(refresh_token.to_string());
                    }
                    Ok(token)
                }
                // Revoked or expired refresh token, or provider unreachable
                Err(Error::TokenExchange(msg)) | Err(Error::Http(msg)) => {
                    Err(Error::RefreshFailed(msg))
                }
                Err(other) => Err(other),
            }
        })
    }

    fn end_session<'a>(&'a self, request: EndSession<'a>) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let form = [
                (PARAM_STATE, request.state),
                (PARAM_END_SESSION_ID, request.end_session_id),
                ("client_id", self.options.client_id.as_str()),
                ("client_secret", self.options.client_secret.expose().as_str()),
                ("refresh_token", request.refresh_token),
            ];
            let response = self
                .client
                .post(&self.options.end_session_endpoint)
                .form(&form)
                .send()
                .await
                .map_err(|e| Error::Http(format!("end session request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Http(format!("end session returned {status}")));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::tests::options;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpIdentityProvider {
        HttpIdentityProvider::new(Arc::new(options(&server.uri()))).unwrap()
    }

    #[tokio::test]
    async fn exchange_posts_code_and_pkce_proof() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains("code_verifier=ver"))
            .and(body_string_contains("code_challenge_method=S256"))
            .and(body_string_contains("refresh_token=old-rt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = provider(&server)
            .exchange_code(CodeExchange {
                code: "abc",
                pkce: Some(("ver", PkceMethod::S256)),
                previous_refresh_token: Some("old-rt"),
            })
            .await
            .unwrap();
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn exchange_failure_carries_provider_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .exchange_code(CodeExchange {
                code: "bogus",
                ..Default::default()
            })
            .await
            .unwrap_err();
        match err {
            Error::TokenExchange(msg) => assert!(msg.contains("invalid_grant"), "got: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_when_not_rotated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-keep"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "expires_in": 60
            })))
            .mount(&server)
            .await;

        let token = provider(&server).refresh_token("rt-keep").await.unwrap();
        assert_eq!(token.access_token, "at-2");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-keep"));
    }

    #[tokio::test]
    async fn rejected_refresh_is_refresh_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = provider(&server).refresh_token("rt-dead").await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn client_credentials_grant_sends_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_secret=s3cret"))
            .and(body_string_contains("scope=openid+profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "svc-token",
                "expires_in": 300
            })))
            .mount(&server)
            .await;

        let token = provider(&server).client_credentials().await.unwrap();
        assert_eq!(token.access_token, "svc-token");
        assert_eq!(token.refresh_token, None);
    }

    #[tokio::test]
    async fn end_session_posts_revocation_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/endsession"))
            .and(body_string_contains("es_id=es-9"))
            .and(body_string_contains("state=st"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .end_session(EndSession {
                state: "st",
                end_session_id: "es-9",
                refresh_token: "rt-1",
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn timeout_is_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut opts = options(&server.uri());
        opts.timeout_secs = 1;
        let provider = HttpIdentityProvider::new(Arc::new(opts)).unwrap();
        let err = provider.refresh_token("rt").await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got: {err:?}");
    }
}
