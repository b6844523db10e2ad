//! Bearer-token authorization for resource servers
//!
//! Validates inbound `Authorization: Bearer <jwt>` headers against a
//! configured public key and issuer/audience allow-lists, then asks a
//! [`PermissionAuditor`] whether the caller's role, level and scopes may
//! reach the requested `(area, controller, action)` route.
//!
//! Request flow:
//! 1. Host mounts [`require_bearer`] with a [`GuardState`] per route
//! 2. [`JwtValidator`] checks signature, validity window, audience, issuer
//! 3. [`PermissionAuditor::check_route_with_level`] makes the allow/deny call
//! 4. Allowed requests carry an [`AuthContext`] extension to the handler

pub mod auditor;
pub mod claims;
pub mod error;
pub mod jwt;
pub mod middleware;
pub mod route;

pub use auditor::{PermissionAuditor, PolicyRule, StaticPolicy};
pub use claims::Claims;
pub use error::AuthError;
pub use jwt::{JwtError, JwtValidator};
pub use middleware::{
    AuthContext, ClaimsValidator, GuardState, MissingTokenPolicy, ResourceGuard, require_bearer,
};
pub use route::{ROUTE_SEPARATOR, RouteDescriptor, RouteError, RouteKey};
