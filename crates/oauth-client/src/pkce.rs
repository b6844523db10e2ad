//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Generates the state token, the code verifier and its challenge, and builds
//! the authorize-endpoint URL. The verifier stays on the server;
//! only the challenge leaves the process before the code exchange.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::options::{
    ClientOptions, PARAM_CODE_CHALLENGE, PARAM_CODE_CHALLENGE_METHOD, PARAM_STATE,
};

/// Challenge transformation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
    #[default]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl PkceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PkceMethod::S256 => "S256",
            PkceMethod::Plain => "plain",
        }
    }
}

impl fmt::Display for PkceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PkceMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "S256" => Ok(PkceMethod::S256),
            "plain" => Ok(PkceMethod::Plain),
            other => Err(Error::PkceMismatch(format!(
                "unsupported code_challenge_method '{other}'"
            ))),
        }
    }
}

fn random_token<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random state token: 32 bytes, base64url without padding (43 chars).
pub fn generate_state() -> String {
    random_token::<32>()
}

/// Random code verifier: 64 bytes, base64url without padding (86 chars).
///
/// RFC 7636 allows 43-128 characters.
pub fn generate_verifier() -> String {
    random_token::<64>()
}

/// Challenge for `verifier` under `method`.
///
/// `S256`: `BASE64URL(SHA256(verifier))`; `plain`: the verifier itself.
pub fn compute_challenge(verifier: &str, method: PkceMethod) -> String {
    match method {
        PkceMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        PkceMethod::Plain => verifier.to_string(),
    }
}

/// Whether `presented` is the challenge of `verifier` under `method`.
pub fn verify(verifier: &str, method: PkceMethod, presented: &str) -> bool {
    compute_challenge(verifier, method) == presented
}

/// Authorize-endpoint URL for a new sign-in attempt.
///
/// `challenge` is `(code_challenge, method)` when PKCE is in use.
pub fn build_authorization_url(
    options: &ClientOptions,
    state: &str,
    challenge: Option<(&str, PkceMethod)>,
) -> Result<String> {
    let mut url = url::Url::parse(&options.authorize_endpoint)
        .map_err(|e| Error::Config(format!("invalid authorize endpoint: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &options.client_id)
            .append_pair("redirect_uri", &options.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &options.scope())
            .append_pair(PARAM_STATE, state);
        if let Some((challenge, method)) = challenge {
            query
                .append_pair(PARAM_CODE_CHALLENGE, challenge)
                .append_pair(PARAM_CODE_CHALLENGE_METHOD, method.as_str());
        }
    }
    Ok(url.into())
}
