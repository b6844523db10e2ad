//! OAuth2 authorization-code client for server-rendered web apps
//!
//! Runs the browser side of sign-in against an OIDC provider: PKCE-protected
//! authorization redirects, the callback exchange, provider-side sign-out,
//! and an encrypted cookie holding the user's tokens. Expired access tokens
//! are refreshed transparently, once per subject no matter how many
//! requests arrive at the same time.
//!
//! Request flow:
//! 1. `/signin` records state and the PKCE verifier, redirects
//! 2. `/signin-oauth` checks state and PKCE, exchanges the code, sets the cookie
//! 3. Pages behind [`client_guard`] see the signed-in user's claims
//! 4. [`RefreshCoordinator`] keeps the access token live for outbound calls
//!    made through [`OutboundClient`]

pub mod error;
pub mod flow;
pub mod options;
pub mod outbound;
pub mod pkce;
pub mod provider;
pub mod refresh;
pub mod session;
pub mod token;
pub mod token_store;
pub mod web;

pub use error::{Error, Result};
pub use flow::{AuthorizationFlow, CallbackParams, SignOutParams, SignedIn, local_return_url};
pub use options::{ClientOptions, PARAM_RETURN_URL, RoutePaths, SessionNames};
pub use outbound::OutboundClient;
pub use pkce::PkceMethod;
pub use provider::{CodeExchange, EndSession, HttpIdentityProvider, IdentityProvider};
pub use refresh::{RefreshCoordinator, SubjectLocks};
pub use session::{MemorySessionStore, SessionStore};
pub use token::{OAuthToken, TokenResponse};
pub use token_store::{CookieProtector, CookieTokenStore, TokenStore};
pub use web::{ClientGuardState, ClientState, client_guard, router};
