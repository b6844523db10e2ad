//! Client configuration and well-known names
//!
//! Defaults mirror the paths and session keys existing deployments already
//! link to, so an empty `[oauth]` section (apart from endpoints) works.

use common::Secret;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pkce::PkceMethod;

/// Query parameter carrying the post sign-in destination.
pub const PARAM_RETURN_URL: &str = "ReturnUrl";
pub const PARAM_STATE: &str = "state";
pub const PARAM_CODE: &str = "code";
pub const PARAM_CODE_CHALLENGE: &str = "code_challenge";
pub const PARAM_CODE_CHALLENGE_METHOD: &str = "code_challenge_method";
/// End-session id returned by the provider on sign-out.
pub const PARAM_END_SESSION_ID: &str = "es_id";

/// Default provider call timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Everything the flow needs to talk to the identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientOptions {
    pub client_id: String,

    /// Never read from the config file; injected from env or a secret file.
    #[serde(skip)]
    pub client_secret: Secret<String>,

    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub end_session_endpoint: String,

    /// OIDC userinfo endpoint, queried with the signed-in user's token.
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Callback URL registered with the provider.
    pub redirect_url: String,
    pub sign_out_redirect_url: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default = "default_true")]
    pub pkce_required: bool,

    #[serde(default)]
    pub pkce_method: PkceMethod,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub paths: RoutePaths,

    #[serde(default)]
    pub names: SessionNames,
}

/// Paths the client routes are mounted on.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutePaths {
    pub sign_in: String,
    pub sign_in_callback: String,
    pub sign_out: String,
    pub sign_out_callback: String,
    pub access_denied: String,
}

impl Default for RoutePaths {
    fn default() -> Self {
        Self {
            sign_in: "/signin".into(),
            sign_in_callback: "/signin-oauth".into(),
            sign_out: "/signout".into(),
            sign_out_callback: "/signout-oauth".into(),
            access_denied: "/accessdenied".into(),
        }
    }
}

/// Session keys and the token cookie name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionNames {
    pub user_json: String,
    pub user_id: String,
    pub token_cookie: String,
}

impl Default for SessionNames {
    fn default() -> Self {
        Self {
            user_json: "USERJSON".into(),
            user_id: "USERID".into(),
            token_cookie: "go.cookie2".into(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ClientOptions {
    /// Check the fields serde cannot: non-empty ids and http(s) URLs.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Config("oauth.client_id must not be empty".into()));
        }
        for (name, value) in [
            ("authorize_endpoint", &self.authorize_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("end_session_endpoint", &self.end_session_endpoint),
            ("redirect_url", &self.redirect_url),
            ("sign_out_redirect_url", &self.sign_out_redirect_url),
        ]
        .into_iter()
        .chain(
            self.userinfo_endpoint
                .as_ref()
                .map(|value| ("userinfo_endpoint", value)),
        ) {
            let url = url::Url::parse(value)
                .map_err(|e| Error::Config(format!("oauth.{name} '{value}' is not a URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "oauth.{name} must be an http or https URL, got '{value}'"
                )));
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("oauth.timeout_secs must be > 0".into()));
        }
        for (name, path) in [
            ("sign_in", &self.paths.sign_in),
            ("sign_in_callback", &self.paths.sign_in_callback),
            ("sign_out", &self.paths.sign_out),
            ("sign_out_callback", &self.paths.sign_out_callback),
            ("access_denied", &self.paths.access_denied),
        ] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "oauth.paths.{name} must start with '/', got '{path}'"
                )));
            }
        }
        Ok(())
    }

    /// Space separated scope string sent to the provider.
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }
}
