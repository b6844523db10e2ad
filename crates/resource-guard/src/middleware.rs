//! Axum middleware guarding resource routes with bearer JWTs
//!
//! Mount per route with `from_fn_with_state`:
//!
//! ```ignore
//! let orders = GuardState::for_route(guard.clone(), "api_orders_list")?;
//! Router::new()
//!     .route("/orders", get(list_orders))
//!     .route_layer(axum::middleware::from_fn_with_state(orders, require_bearer));
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{FromRequestParts, OptionalFromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auditor::PermissionAuditor;
use crate::claims::Claims;
use crate::error::AuthError;
use crate::jwt::JwtValidator;
use crate::route::{RouteDescriptor, RouteError, RouteKey};

/// What to do with a request that carries no `Authorization` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTokenPolicy {
    /// Refuse with 401.
    #[default]
    Reject,
    /// Let the handler run without an [`AuthContext`].
    Continue,
    /// Ask the auditor with role 0, level 0 and no scopes.
    Anonymous,
}

/// Host supplied claims check; `Some(reason)` refuses the request.
pub type ClaimsValidator = dyn Fn(&Claims) -> Option<String> + Send + Sync;

/// Identity of an authorized caller, available to handlers as an extractor.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: Option<String>,
    pub claims: Arc<Claims>,
    /// The raw bearer token, for forwarding to downstream services.
    pub token: String,
}

impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AuthError::MissingHeader)
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for AuthContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthContext>().cloned())
    }
}

/// Token verification plus permission check. Shared by every guarded route.
pub struct ResourceGuard {
    validator: JwtValidator,
    auditor: Arc<dyn PermissionAuditor>,
    missing_token: MissingTokenPolicy,
    claims_validator: Option<Arc<ClaimsValidator>>,
}

impl ResourceGuard {
    pub fn new(validator: JwtValidator, auditor: Arc<dyn PermissionAuditor>) -> Self {
        Self {
            validator,
            auditor,
            missing_token: MissingTokenPolicy::default(),
            claims_validator: None,
        }
    }

    pub fn with_missing_token(mut self, policy: MissingTokenPolicy) -> Self {
        self.missing_token = policy;
        self
    }

    /// Run `check` after the standard JWT checks and before the role check.
    pub fn with_claims_validator<F>(mut self, check: F) -> Self
    where
        F: Fn(&Claims) -> Option<String> + Send + Sync + 'static,
    {
        self.claims_validator = Some(Arc::new(check));
        self
    }

    /// Middleware state for one route.
    pub fn protect(self: &Arc<Self>, route_key: &str) -> Result<GuardState, RouteError> {
        GuardState::for_route(Arc::clone(self), route_key)
    }

    /// Decide whether a request with `headers` may reach `route`.
    ///
    /// `Ok(None)` means the request proceeds without an identity.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        route: &RouteDescriptor,
    ) -> Result<Option<AuthContext>, AuthError> {
        let Some(header) = headers.get(AUTHORIZATION) else {
            return match self.missing_token {
                MissingTokenPolicy::Reject => Err(AuthError::MissingHeader),
                MissingTokenPolicy::Continue => Ok(None),
                MissingTokenPolicy::Anonymous => {
                    self.check(route, 0, 0, &[])?;
                    Ok(None)
                }
            };
        };

        let token = bearer_token(header.to_str().map_err(|_| AuthError::MalformedHeader)?)?;
        let claims = self.validator.validate(token)?;

        if let Some(check) = &self.claims_validator
            && let Some(reason) = check(&claims)
        {
            return Err(AuthError::Rejected(reason));
        }

        let role = claims.role.ok_or(AuthError::MissingRole)?;
        self.check(route, role, claims.level.unwrap_or(0), &claims.scope)?;

        Ok(Some(AuthContext {
            subject: claims.sub.clone(),
            claims: Arc::new(claims),
            token: token.to_string(),
        }))
    }

    fn check(
        &self,
        route: &RouteDescriptor,
        role: i64,
        level: i32,
        scopes: &[String],
    ) -> Result<(), AuthError> {
        let allowed = self.auditor.check_route_with_level(
            &route.area,
            &route.controller,
            &route.action,
            role,
            level,
            scopes,
        );
        if allowed {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied)
        }
    }
}

/// `Bearer <token>`, exactly two space separated parts.
fn bearer_token(value: &str) -> Result<&str, AuthError> {
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::MalformedHeader),
    }
}

/// State for [`require_bearer`].
#[derive(Clone)]
pub struct GuardState {
    guard: Arc<ResourceGuard>,
    route: Option<RouteDescriptor>,
}

impl GuardState {
    /// Route taken from a [`RouteKey`] request extension.
    pub fn new(guard: Arc<ResourceGuard>) -> Self {
        Self { guard, route: None }
    }

    pub fn for_route(guard: Arc<ResourceGuard>, route_key: &str) -> Result<Self, RouteError> {
        Ok(Self {
            guard,
            route: Some(RouteDescriptor::parse(route_key)?),
        })
    }

    fn route(&self, request: &Request) -> Result<RouteDescriptor, AuthError> {
        if let Some(route) = &self.route {
            return Ok(route.clone());
        }
        request
            .extensions()
            .get::<RouteKey>()
            .ok_or(AuthError::InvalidRoute)?
            .descriptor()
            .map_err(|_| AuthError::InvalidRoute)
    }
}

/// Axum middleware: verify the bearer token and consult the auditor.
pub async fn require_bearer(
    State(state): State<GuardState>,
    mut request: Request,
    next: Next,
) -> Response {
    let route = match state.route(&request) {
        Ok(route) => route,
        Err(err) => {
            warn!(path = %request.uri().path(), "guarded request has no usable route key");
            return reject(err);
        }
    };

    match state.guard.authorize(request.headers(), &route) {
        Ok(Some(context)) => {
            debug!(subject = ?context.subject, route = %route, "request authorized");
            record_decision("allowed");
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Ok(None) => {
            debug!(route = %route, "request proceeds without identity");
            record_decision("anonymous");
            next.run(request).await
        }
        Err(err) => {
            warn!(route = %route, error = %err, "request rejected");
            reject(err)
        }
    }
}

fn reject(err: AuthError) -> Response {
    record_decision(err.outcome());
    err.into_response()
}

fn record_decision(outcome: &'static str) {
    metrics::counter!("auth_guard_decisions_total", "outcome" => outcome).increment(1);
}
