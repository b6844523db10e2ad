//! Authorization-code sign-in and sign-out
//!
//! Each redirect to the provider is paired with a random state token. The
//! attempt is recorded in a store the flow shares across all requests, and
//! the browser's session gets a binding marker under the same token. A
//! callback must present the marker, then removes the attempt from the
//! shared store; the removal is atomic, so every authorization attempt can
//! complete at most once even when callbacks race.
//!
//! ```text
//! Anonymous --begin_sign_in--> PendingAuthorization --handle_callback--> Authenticated
//! Authenticated --begin_sign_out--> (provider) --handle_sign_out_callback--> Anonymous
//! ```

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use resource_guard::Claims;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::options::{
    ClientOptions, PARAM_CODE, PARAM_CODE_CHALLENGE, PARAM_CODE_CHALLENGE_METHOD,
    PARAM_END_SESSION_ID, PARAM_STATE,
};
use crate::pkce::{self, PkceMethod};
use crate::provider::{CodeExchange, EndSession, IdentityProvider};
use crate::session::SessionStore;
use crate::token_store::TokenStore;

/// Unredeemed attempts older than this are dropped.
pub const PENDING_STATE_TTL: Duration = Duration::from_secs(600);

/// Upper bound on attempts awaiting their callback.
pub const MAX_PENDING_STATES: u64 = 100_000;

/// Record kept for one authorization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub return_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce: Option<PkceProof>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PkceProof {
    pub verifier: String,
    pub method: PkceMethod,
}

/// Query of the sign-in callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Query of the sign-out callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignOutParams {
    pub state: Option<String>,
    pub es_id: Option<String>,
}

/// Outcome of a successful callback.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedIn {
    pub redirect: String,
    pub subject: String,
}

/// Attempt awaiting its callback, tied to the session that started it.
#[derive(Debug, Clone)]
struct PendingState {
    binding: String,
    entry: AuthorizationState,
}

/// The client-side OAuth state machine.
pub struct AuthorizationFlow {
    options: Arc<ClientOptions>,
    provider: Arc<dyn IdentityProvider>,
    pending: Cache<String, PendingState>,
}

impl AuthorizationFlow {
    pub fn new(options: Arc<ClientOptions>, provider: Arc<dyn IdentityProvider>) -> Self {
        Self::with_state_ttl(options, provider, PENDING_STATE_TTL)
    }

    pub fn with_state_ttl(
        options: Arc<ClientOptions>,
        provider: Arc<dyn IdentityProvider>,
        ttl: Duration,
    ) -> Self {
        let pending = Cache::builder()
            .max_capacity(MAX_PENDING_STATES)
            .time_to_live(ttl)
            .build();
        Self {
            options,
            provider,
            pending,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// URL to send the browser to for signing in.
    ///
    /// A client that already holds a readable token goes straight to
    /// `return_url`.
    pub async fn begin_sign_in(
        &self,
        session: &dyn SessionStore,
        tokens: &dyn TokenStore,
        return_url: Option<&str>,
    ) -> Result<String> {
        let return_url = local_return_url(return_url);

        if let Ok(Some(_)) = tokens.get_token() {
            debug!(return_url = %return_url, "already signed in");
            return Ok(return_url);
        }
        self.authorize_url(session, &return_url).await
    }

    /// Record a new authorization attempt and return the provider URL for it,
    /// whether or not the client already holds a token.
    pub async fn authorize_url(
        &self,
        session: &dyn SessionStore,
        return_url: &str,
    ) -> Result<String> {
        let return_url = local_return_url(Some(return_url));
        let state = pkce::generate_state();
        let (entry, challenge) = if self.options.pkce_required {
            let method = self.options.pkce_method;
            let verifier = pkce::generate_verifier();
            let challenge = pkce::compute_challenge(&verifier, method);
            let entry = AuthorizationState {
                return_url,
                pkce: Some(PkceProof { verifier, method }),
            };
            (entry, Some((challenge, method)))
        } else {
            let entry = AuthorizationState {
                return_url,
                pkce: None,
            };
            (entry, None)
        };

        self.store_state(session, &state, &entry).await?;
        let url = pkce::build_authorization_url(
            &self.options,
            &state,
            challenge.as_ref().map(|(c, m)| (c.as_str(), *m)),
        )?;

        record_event("sign_in_started");
        info!(return_url = %entry.return_url, pkce = entry.pkce.is_some(), "sign-in started");
        Ok(url)
    }

    /// Complete sign-in with the provider's callback query.
    pub async fn handle_callback(
        &self,
        session: &dyn SessionStore,
        tokens: &dyn TokenStore,
        params: &CallbackParams,
    ) -> Result<SignedIn> {
        let entry = self.take_state(session, params.state.as_deref()).await?;

        let pkce = match &entry.pkce {
            Some(proof) => {
                if let Err(err) = check_pkce(proof, params) {
                    record_event("callback_rejected");
                    return Err(err);
                }
                Some((proof.verifier.as_str(), proof.method))
            }
            None => None,
        };

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidRequest(format!("missing {PARAM_CODE}")))?;

        let previous = tokens.get_token().ok().flatten();
        let exchange = CodeExchange {
            code,
            pkce,
            previous_refresh_token: previous.as_ref().and_then(|t| t.refresh_token.as_deref()),
        };
        let token = self
            .provider
            .exchange_code(exchange)
            .await
            .map_err(|e| match e {
                Error::TokenExchange(msg) | Error::Http(msg) => Error::TokenExchange(msg),
                other => other,
            })?;

        let claims = token.claims()?;
        let subject = claims
            .claims
            .sub
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MalformedToken("access token has no sub claim".into()))?;

        let names = &self.options.names;
        session.insert(&names.user_id, subject.clone()).await?;
        session.insert(&names.user_json, claims.raw.to_string()).await?;
        tokens.save_token(&token)?;

        record_event("signed_in");
        info!(subject = %subject, "user signed in");
        Ok(SignedIn {
            redirect: entry.return_url,
            subject,
        })
    }

    /// URL of the provider's end-session endpoint.
    pub async fn begin_sign_out(
        &self,
        session: &dyn SessionStore,
        return_url: Option<&str>,
    ) -> Result<String> {
        let state = pkce::generate_state();
        let entry = AuthorizationState {
            return_url: local_return_url(return_url),
            pkce: None,
        };
        self.store_state(session, &state, &entry).await?;

        let mut url = url::Url::parse(&self.options.end_session_endpoint)
            .map_err(|e| Error::Config(format!("invalid end session endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.options.client_id)
            .append_pair("redirect_uri", &self.options.sign_out_redirect_url)
            .append_pair(PARAM_STATE, &state);

        record_event("sign_out_started");
        Ok(url.into())
    }

    /// Finish sign-out: revoke at the provider, then forget the user locally.
    ///
    /// Revocation is best effort; local state is cleared regardless.
    pub async fn handle_sign_out_callback(
        &self,
        session: &dyn SessionStore,
        tokens: &dyn TokenStore,
        params: &SignOutParams,
    ) -> Result<String> {
        let state = params.state.as_deref().unwrap_or_default();
        let entry = self.take_state(session, Some(state)).await?;

        let es_id = params
            .es_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidRequest(format!("missing {PARAM_END_SESSION_ID}")))?;

        let refresh_token = tokens
            .get_token()
            .ok()
            .flatten()
            .and_then(|t| t.refresh_token);
        if let Some(refresh_token) = refresh_token {
            let request = EndSession {
                state,
                end_session_id: es_id,
                refresh_token: &refresh_token,
            };
            if let Err(err) = self.provider.end_session(request).await {
                warn!(error = %err, "end session revocation failed");
            }
        }

        tokens.clear();
        session.flush().await?;

        record_event("signed_out");
        info!("user signed out");
        Ok(entry.return_url)
    }

    /// Subject of the signed-in user.
    pub async fn subject(&self, session: &dyn SessionStore) -> Result<Option<String>> {
        Ok(session
            .get(&self.options.names.user_id)
            .await?
            .filter(|s| !s.is_empty()))
    }

    /// Claims recorded at sign-in. Unreadable session data counts as signed out.
    pub async fn current_user(&self, session: &dyn SessionStore) -> Result<Option<Claims>> {
        let Some(json) = session.get(&self.options.names.user_json).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(claims) => Ok(Some(claims)),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable user session data");
                Ok(None)
            }
        }
    }

    async fn store_state(
        &self,
        session: &dyn SessionStore,
        state: &str,
        entry: &AuthorizationState,
    ) -> Result<()> {
        let binding = pkce::generate_state();
        session.insert(state, binding.clone()).await?;
        self.pending
            .insert(
                state.to_string(),
                PendingState {
                    binding,
                    entry: entry.clone(),
                },
            )
            .await;
        Ok(())
    }

    /// Redeem `state` for the session presenting it. At most one caller wins.
    async fn take_state(
        &self,
        session: &dyn SessionStore,
        state: Option<&str>,
    ) -> Result<AuthorizationState> {
        let state = state.filter(|s| !s.is_empty()).ok_or(Error::InvalidState)?;
        // Another browser's callback must not burn the attempt
        let Some(binding) = session.get(state).await? else {
            record_event("callback_rejected");
            return Err(Error::InvalidState);
        };
        let Some(pending) = self.pending.remove(state).await else {
            record_event("callback_rejected");
            debug!("state already redeemed or expired");
            return Err(Error::InvalidState);
        };
        session.take(state).await?;
        if pending.binding != binding {
            record_event("callback_rejected");
            warn!("state presented by a different session");
            return Err(Error::InvalidState);
        }
        Ok(pending.entry)
    }

    /// Attempts awaiting their callback.
    pub async fn pending_states(&self) -> u64 {
        self.pending.run_pending_tasks().await;
        self.pending.entry_count()
    }
}

fn check_pkce(proof: &PkceProof, params: &CallbackParams) -> Result<()> {
    let method: PkceMethod = params
        .code_challenge_method
        .as_deref()
        .ok_or_else(|| Error::PkceMismatch(format!("missing {PARAM_CODE_CHALLENGE_METHOD}")))?
        .parse()?;
    if method != proof.method {
        return Err(Error::PkceMismatch(format!(
            "transformation method does not match: expected {}, got {method}",
            proof.method
        )));
    }
    let challenge = params
        .code_challenge
        .as_deref()
        .ok_or_else(|| Error::PkceMismatch(format!("missing {PARAM_CODE_CHALLENGE}")))?;
    if !pkce::verify(&proof.verifier, proof.method, challenge) {
        return Err(Error::PkceMismatch(
            "code verifier and challenge do not match".into(),
        ));
    }
    Ok(())
}

/// `raw` when it is a local path, `/` otherwise.
pub fn local_return_url(raw: Option<&str>) -> String {
    match raw {
        Some(url) if url.starts_with('/') && !url.starts_with("//") && !url.starts_with("/\\") => {
            url.to_string()
        }
        _ => "/".to_string(),
    }
}

fn record_event(event: &'static str) {
    metrics::counter!("oauth_flow_events_total", "event" => event).increment(1);
}
