//! Axum routes for the client flow and the session-based route guard
//!
//! Endpoints (paths configurable, defaults shown):
//! - GET /signin         - redirect to the provider, `ReturnUrl` remembered
//! - GET /signin-oauth   - provider callback, sets the token cookie
//! - GET /signout        - redirect to the provider's end-session endpoint
//! - GET /signout-oauth  - end-session callback, clears cookie and session
//! - GET /accessdenied   - landing page for refused signed-in users
//!
//! The router expects a `tower_sessions::SessionManagerLayer` around it.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest::{Method, RequestBuilder};
use resource_guard::{PermissionAuditor, RouteDescriptor, RouteError, RouteKey};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{debug, warn};

use crate::error::Result;
use crate::flow::{AuthorizationFlow, CallbackParams, SignOutParams};
use crate::options::PARAM_RETURN_URL;
use crate::outbound::OutboundClient;
use crate::refresh::RefreshCoordinator;
use crate::token::OAuthToken;
use crate::token_store::{CookieProtector, CookieTokenStore};

/// Shared state for the client routes and guard.
#[derive(Clone)]
pub struct ClientState {
    flow: Arc<AuthorizationFlow>,
    refresh: Arc<RefreshCoordinator>,
    protector: Arc<CookieProtector>,
    auditor: Arc<dyn PermissionAuditor>,
    secure_cookies: bool,
}

impl ClientState {
    pub fn new(
        flow: Arc<AuthorizationFlow>,
        refresh: Arc<RefreshCoordinator>,
        protector: Arc<CookieProtector>,
        auditor: Arc<dyn PermissionAuditor>,
    ) -> Self {
        Self {
            flow,
            refresh,
            protector,
            auditor,
            secure_cookies: true,
        }
    }

    /// Whether the token cookie is marked `Secure`. On by default.
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    pub fn flow(&self) -> &AuthorizationFlow {
        &self.flow
    }

    /// Token store over the request's cookies.
    pub fn token_store(&self, headers: &HeaderMap) -> CookieTokenStore {
        CookieTokenStore::from_headers(
            Arc::clone(&self.protector),
            self.flow.options().names.token_cookie.clone(),
            headers,
        )
        .with_secure(self.secure_cookies)
    }

    /// Local sign-in URL that comes back to `return_url`.
    pub fn sign_in_location(&self, return_url: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(PARAM_RETURN_URL, return_url)
            .finish();
        format!("{}?{query}", self.flow.options().paths.sign_in)
    }

    /// Live access token of the signed-in user, refreshed when needed.
    pub async fn access_token(
        &self,
        session: &Session,
        tokens: &CookieTokenStore,
    ) -> Result<Option<OAuthToken>> {
        let subject = self.flow.subject(session).await?;
        self.refresh
            .access_token(subject.as_deref(), session, tokens)
            .await
    }

    /// Request to `url` on behalf of the signed-in user, or `None` when
    /// nobody is signed in.
    pub async fn user_request(
        &self,
        outbound: &OutboundClient,
        session: &Session,
        tokens: &CookieTokenStore,
        method: Method,
        url: &str,
    ) -> Result<Option<RequestBuilder>> {
        Ok(self
            .access_token(session, tokens)
            .await?
            .map(|token| outbound.bearer(method, url, &token)))
    }

    /// Guard state for one browser-facing route.
    pub fn protect(&self, route_key: &str) -> std::result::Result<ClientGuardState, RouteError> {
        Ok(ClientGuardState {
            client: self.clone(),
            route: Some(RouteDescriptor::parse(route_key)?),
        })
    }
}

#[derive(Deserialize)]
struct ReturnParams {
    #[serde(rename = "ReturnUrl")]
    return_url: Option<String>,
}

/// Router serving the flow endpoints.
pub fn router(state: ClientState) -> Router {
    let paths = state.flow.options().paths.clone();
    Router::new()
        .route(&paths.sign_in, get(sign_in))
        .route(&paths.sign_in_callback, get(sign_in_callback))
        .route(&paths.sign_out, get(sign_out))
        .route(&paths.sign_out_callback, get(sign_out_callback))
        .route(&paths.access_denied, get(access_denied))
        .with_state(state)
}

fn redirect(location: &str, tokens: Option<&CookieTokenStore>) -> Response {
    let mut response = (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response();
    if let Some(tokens) = tokens {
        tokens.write_to(response.headers_mut());
    }
    response
}

async fn sign_in(
    State(state): State<ClientState>,
    session: Session,
    headers: HeaderMap,
    Query(params): Query<ReturnParams>,
) -> Response {
    let tokens = state.token_store(&headers);
    match state
        .flow
        .begin_sign_in(&session, &tokens, params.return_url.as_deref())
        .await
    {
        Ok(url) => redirect(&url, None),
        Err(err) => err.into_response(),
    }
}

async fn sign_in_callback(
    State(state): State<ClientState>,
    session: Session,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let tokens = state.token_store(&headers);
    match state.flow.handle_callback(&session, &tokens, &params).await {
        Ok(signed_in) => redirect(&signed_in.redirect, Some(&tokens)),
        Err(err) => {
            warn!(error = %err, "sign-in callback rejected");
            err.into_response()
        }
    }
}

async fn sign_out(
    State(state): State<ClientState>,
    session: Session,
    Query(params): Query<ReturnParams>,
) -> Response {
    match state
        .flow
        .begin_sign_out(&session, params.return_url.as_deref())
        .await
    {
        Ok(url) => redirect(&url, None),
        Err(err) => err.into_response(),
    }
}

async fn sign_out_callback(
    State(state): State<ClientState>,
    session: Session,
    headers: HeaderMap,
    Query(params): Query<SignOutParams>,
) -> Response {
    let tokens = state.token_store(&headers);
    match state
        .flow
        .handle_sign_out_callback(&session, &tokens, &params)
        .await
    {
        Ok(url) => redirect(&url, Some(&tokens)),
        Err(err) => {
            warn!(error = %err, "sign-out callback rejected");
            err.into_response()
        }
    }
}

async fn access_denied() -> impl IntoResponse {
    (StatusCode::FORBIDDEN, "access denied")
}

/// State for [`client_guard`].
#[derive(Clone)]
pub struct ClientGuardState {
    client: ClientState,
    route: Option<RouteDescriptor>,
}

impl ClientGuardState {
    /// Route taken from a [`RouteKey`] request extension.
    pub fn new(client: ClientState) -> Self {
        Self {
            client,
            route: None,
        }
    }
}

/// Session-based guard for browser-facing routes.
///
/// Signed-in users the auditor refuses go to the access-denied page;
/// anonymous users are let through when role 0 may see the route, otherwise
/// sent to sign in with the current URL as return URL.
pub async fn client_guard(
    State(state): State<ClientGuardState>,
    session: Session,
    request: Request,
    next: Next,
) -> Response {
    let route = match &state.route {
        Some(route) => route.clone(),
        None => match request
            .extensions()
            .get::<RouteKey>()
            .map(RouteKey::descriptor)
        {
            Some(Ok(route)) => route,
            _ => {
                warn!(path = %request.uri().path(), "guarded page has no usable route key");
                return (StatusCode::INTERNAL_SERVER_ERROR, "invalid route key").into_response();
            }
        },
    };

    let client = &state.client;
    let user = match client.flow.current_user(&session).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    let allowed = |role: i64, level: i32, scopes: &[String]| {
        client.auditor.check_route_with_level(
            &route.area,
            &route.controller,
            &route.action,
            role,
            level,
            scopes,
        )
    };

    match user {
        Some(claims) => {
            if allowed(claims.role.unwrap_or(0), claims.level.unwrap_or(0), &claims.scope) {
                next.run(request).await
            } else {
                debug!(subject = ?claims.sub, route = %route, "signed-in user refused");
                redirect(&client.flow.options().paths.access_denied, None)
            }
        }
        None if allowed(0, 0, &[]) => next.run(request).await,
        None => {
            let return_url = request.uri().to_string();
            match client.flow.authorize_url(&session, &return_url).await {
                Ok(url) => redirect(&url, None),
                Err(err) => err.into_response(),
            }
        }
    }
}
