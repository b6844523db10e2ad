//! Transparent access-token refresh with per-subject serialization
//!
//! Several requests from one browser can arrive carrying the same expired
//! artifact. Each subject gets a slot guarded by an async RwLock; the first
//! request to find the token stale refreshes it under the write lock and
//! leaves the result in the slot, so the others pick it up instead of
//! spending the refresh token again.
//!
//! Slots live in a moka cache and are evicted after a period without use.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::provider::IdentityProvider;
use crate::session::SessionStore;
use crate::token::OAuthToken;
use crate::token_store::TokenStore;

/// Idle time after which a subject's slot is dropped.
pub const DEFAULT_SLOT_IDLE: Duration = Duration::from_secs(30);

/// Most recently refreshed token of one subject.
pub type TokenSlot = Arc<RwLock<Option<OAuthToken>>>;

/// Registry of per-subject slots.
#[derive(Clone)]
pub struct SubjectLocks {
    slots: Cache<String, TokenSlot>,
}

impl Default for SubjectLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_IDLE)
    }
}

impl SubjectLocks {
    pub fn new(idle: Duration) -> Self {
        Self {
            slots: Cache::builder().time_to_idle(idle).build(),
        }
    }

    /// Slot for `subject`, created on first use. Concurrent callers get the same slot.
    pub async fn slot(&self, subject: &str) -> TokenSlot {
        self.slots
            .get_with(subject.to_string(), async { Arc::new(RwLock::new(None)) })
            .await
    }

    pub async fn contains(&self, subject: &str) -> bool {
        self.slots.get(subject).await.is_some()
    }

    /// Run pending evictions; moka otherwise does this lazily.
    pub async fn run_pending_tasks(&self) {
        self.slots.run_pending_tasks().await;
    }
}

/// Hands out a live access token, refreshing it when needed.
pub struct RefreshCoordinator {
    provider: Arc<dyn IdentityProvider>,
    locks: SubjectLocks,
}

impl RefreshCoordinator {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self::with_locks(provider, SubjectLocks::default())
    }

    pub fn with_locks(provider: Arc<dyn IdentityProvider>, locks: SubjectLocks) -> Self {
        Self { provider, locks }
    }

    pub fn locks(&self) -> &SubjectLocks {
        &self.locks
    }

    /// Live token for `subject`, or `None` when nobody is signed in.
    ///
    /// A failed refresh clears the artifact and the session before
    /// returning [`Error::RefreshFailed`], which sends the user back through
    /// sign-in.
    pub async fn access_token(
        &self,
        subject: Option<&str>,
        session: &dyn SessionStore,
        tokens: &dyn TokenStore,
    ) -> Result<Option<OAuthToken>> {
        let Some(subject) = subject.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        let slot = self.locks.slot(subject).await;
        let stored = tokens.get_token()?;

        {
            let cached = slot.read().await;
            if let Some(token) = pick_live(cached.as_ref(), stored.as_ref()) {
                persist_if_changed(tokens, &token, stored.as_ref())?;
                return Ok(Some(token));
            }
            if cached.is_none() && stored.is_none() {
                return Ok(None);
            }
        }

        let mut cached = slot.write().await;
        // Another request may have refreshed while we waited
        if let Some(token) = pick_live(cached.as_ref(), stored.as_ref()) {
            debug!(subject, "using token refreshed by a concurrent request");
            persist_if_changed(tokens, &token, stored.as_ref())?;
            return Ok(Some(token));
        }

        let refresh_token = newest(cached.as_ref(), stored.as_ref())
            .and_then(|token| token.refresh_token.clone());
        let result = match &refresh_token {
            Some(refresh_token) => self.provider.refresh_token(refresh_token).await,
            None => Err(Error::RefreshFailed("no refresh token available".into())),
        };

        match result {
            Ok(mut token) => {
                if token.refresh_token.is_none() {
                    token.refresh_token = refresh_token;
                }
                *cached = Some(token.clone());
                drop(cached);
                tokens.save_token(&token)?;
                info!(subject, "access token refreshed");
                metrics::counter!("oauth_token_refresh_total", "result" => "success").increment(1);
                Ok(Some(token))
            }
            Err(err) => {
                drop(cached);
                warn!(subject, error = %err, "token refresh failed, signing out");
                metrics::counter!("oauth_token_refresh_total", "result" => "failure").increment(1);
                tokens.clear();
                session.flush().await?;
                Err(Error::RefreshFailed(err.to_string()))
            }
        }
    }
}

/// Newest live token among the slot and the artifact.
fn pick_live(cached: Option<&OAuthToken>, stored: Option<&OAuthToken>) -> Option<OAuthToken> {
    newest(cached, stored)
        .filter(|token| token.is_live())
        .cloned()
}

fn newest<'a>(
    cached: Option<&'a OAuthToken>,
    stored: Option<&'a OAuthToken>,
) -> Option<&'a OAuthToken> {
    match (cached, stored) {
        (Some(cached), Some(stored)) if cached.newer_than(stored) => Some(cached),
        (_, Some(stored)) => Some(stored),
        (cached, None) => cached,
    }
}

fn persist_if_changed(
    tokens: &dyn TokenStore,
    token: &OAuthToken,
    stored: Option<&OAuthToken>,
) -> Result<()> {
    if stored != Some(token) {
        tokens.save_token(token)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CodeExchange, EndSession, ProviderFuture};
    use crate::session::MemorySessionStore;
    use crate::token::tests::jwt;
    use crate::token::unix_now;
    use crate::token_store::CookieTokenStore;
    use crate::token_store::tests::{cookie_value, protector};
    use axum::http::header::COOKIE;
    use axum::http::{HeaderMap, HeaderValue};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider whose refresh takes a while and counts its calls.
    struct SlowProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl SlowProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl IdentityProvider for SlowProvider {
        fn exchange_code<'a>(&'a self, _: CodeExchange<'a>) -> ProviderFuture<'a, OAuthToken> {
            Box::pin(async { Err(Error::TokenExchange("unused".into())) })
        }

        fn refresh_token<'a>(&'a self, _: &'a str) -> ProviderFuture<'a, OAuthToken> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                if self.fail {
                    return Err(Error::RefreshFailed("invalid_grant".into()));
                }
                Ok(OAuthToken {
                    access_token: jwt(&json!({ "sub": "user-1", "n": n })),
                    refresh_token: None,
                    expires_at: Some(unix_now() + 3_600),
                })
            })
        }

        fn end_session<'a>(&'a self, _: EndSession<'a>) -> ProviderFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn token(expires_at: i64) -> OAuthToken {
        OAuthToken {
            access_token: jwt(&json!({ "sub": "user-1", "role": "1" })),
            refresh_token: Some("rt-old".into()),
            expires_at: Some(expires_at),
        }
    }

    /// Request-scoped store whose cookie carries `token`.
    fn store_with(token: &OAuthToken) -> CookieTokenStore {
        let writer = CookieTokenStore::from_headers(protector(), "go.cookie2", &HeaderMap::new());
        writer.save_token(token).unwrap();
        let cookie = format!("go.cookie2={}", cookie_value(&writer.set_cookie().unwrap()));
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        CookieTokenStore::from_headers(protector(), "go.cookie2", &headers)
    }

    #[tokio::test]
    async fn no_subject_means_no_token() {
        let coordinator = RefreshCoordinator::new(SlowProvider::new(false));
        let session = MemorySessionStore::default();
        let tokens = store_with(&token(unix_now() + 600));
        assert_eq!(
            coordinator.access_token(None, &session, &tokens).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn live_token_is_returned_without_refresh() {
        let provider = SlowProvider::new(false);
        let coordinator = RefreshCoordinator::new(provider.clone());
        let session = MemorySessionStore::default();
        let live = token(unix_now() + 600);
        let tokens = store_with(&live);

        let got = coordinator
            .access_token(Some("user-1"), &session, &tokens)
            .await
            .unwrap();
        assert_eq!(got, Some(live));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(tokens.set_cookie().is_none(), "nothing re-persisted");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let provider = SlowProvider::new(false);
        let coordinator = Arc::new(RefreshCoordinator::new(provider.clone()));
        let expired = token(unix_now() - 5);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let tokens = store_with(&expired);
                tokio::spawn(async move {
                    let session = MemorySessionStore::default();
                    let token = coordinator
                        .access_token(Some("user-1"), &session, &tokens)
                        .await
                        .unwrap()
                        .unwrap();
                    (token, tokens.set_cookie().is_some())
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let first = &results[0].0;
        for (token, persisted) in &results {
            assert_eq!(token, first);
            assert!(persisted, "every caller re-persists the refreshed token");
        }
        assert_eq!(first.refresh_token.as_deref(), Some("rt-old"));
    }

    #[tokio::test]
    async fn failed_refresh_clears_token_and_session() {
        let provider = SlowProvider::new(true);
        let coordinator = RefreshCoordinator::new(provider);
        let session = MemorySessionStore::default();
        session.insert("USERID", "\"user-1\"".into()).await.unwrap();
        let tokens = store_with(&token(unix_now() - 5));

        let err = coordinator
            .access_token(Some("user-1"), &session, &tokens)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert_eq!(tokens.get_token().unwrap(), None);
        assert!(tokens.set_cookie().unwrap().contains("Max-Age=0"));
        assert_eq!(session.len().await, 0);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_provider_call() {
        let provider = SlowProvider::new(false);
        let coordinator = RefreshCoordinator::new(provider.clone());
        let session = MemorySessionStore::default();
        let mut expired = token(unix_now() - 5);
        expired.refresh_token = None;
        let tokens = store_with(&expired);

        let err = coordinator
            .access_token(Some("user-1"), &session, &tokens)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn idle_slots_are_evicted() {
        let locks = SubjectLocks::new(Duration::from_millis(50));
        let slot = locks.slot("user-1").await;
        assert!(Arc::ptr_eq(&slot, &locks.slot("user-1").await));
        drop(slot);

        tokio::time::sleep(Duration::from_millis(120)).await;
        locks.run_pending_tasks().await;
        assert!(!locks.contains("user-1").await);
    }
}
