//! OAuth tokens as held by the client
//!
//! The provider's token endpoint answers with a relative `expires_in`; it is
//! turned into an absolute unix timestamp when the token is stored so a
//! persisted artifact can be judged without knowing when it was issued.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use resource_guard::Claims;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A token expiring within this many seconds counts as expired.
pub const EXPIRY_SKEW_SECS: i64 = 10;

/// Response body of the token endpoint (code exchange, refresh, client credentials).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Access token plus what is needed to renew it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, unix seconds. `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl OAuthToken {
    pub fn from_response(response: TokenResponse, now: i64) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|rt| !rt.is_empty()),
            expires_at: response.expires_in.map(|secs| now + secs),
        }
    }

    /// Usable at `now`, with [`EXPIRY_SKEW_SECS`] of margin.
    pub fn is_live_at(&self, now: i64) -> bool {
        self.expires_at
            .is_none_or(|expires_at| now + EXPIRY_SKEW_SECS < expires_at)
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(unix_now())
    }

    /// Whether this token outlives `other`.
    pub fn newer_than(&self, other: &OAuthToken) -> bool {
        self.expires_at.unwrap_or(i64::MAX) > other.expires_at.unwrap_or(i64::MAX)
    }

    /// Claims of the access token, signature not checked.
    pub fn claims(&self) -> Result<UnverifiedClaims> {
        UnverifiedClaims::decode(&self.access_token)
    }
}

/// Payload of a JWT read without verification.
///
/// The client trusts its own token endpoint over TLS, so the access token's
/// payload is only decoded for display and session data. Resource servers
/// verify it properly.
#[derive(Debug, Clone)]
pub struct UnverifiedClaims {
    pub claims: Claims,
    /// The payload exactly as issued.
    pub raw: serde_json::Value,
}

impl UnverifiedClaims {
    pub fn decode(token: &str) -> Result<Self> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => {
                return Err(Error::MalformedToken(
                    "access token is not a three-part JWT".into(),
                ));
            }
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::MalformedToken(format!("payload is not base64url: {e}")))?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedToken(format!("payload is not JSON: {e}")))?;
        let claims = serde_json::from_value(raw.clone())
            .map_err(|e| Error::MalformedToken(format!("unexpected claims: {e}")))?;

        Ok(Self { claims, raw })
    }

    /// Refresh-token expiry (`rexp`, unix seconds) when the provider sets one.
    pub fn refresh_expires_at(&self) -> Option<i64> {
        match self.raw.get("rexp")? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Unsigned JWT-shaped string carrying `payload`.
    pub(crate) fn jwt(payload: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"PS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.c2ln")
    }

    #[test]
    fn token_response_deserializes() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600,"token_type":"Bearer"}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let token = OAuthToken::from_response(response, 1_000);
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(token.expires_at, Some(4_600));
    }

    #[test]
    fn minimal_token_response_never_expires() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token":"at"}"#).unwrap();
        let token = OAuthToken::from_response(response, 1_000);
        assert_eq!(token.refresh_token, None);
        assert!(token.is_live_at(i64::MAX - EXPIRY_SKEW_SECS - 1));
    }

    #[test]
    fn expiry_skew_is_applied() {
        let token = OAuthToken {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: Some(1_000),
        };
        assert!(token.is_live_at(989));
        assert!(!token.is_live_at(990));
        assert!(!token.is_live_at(1_000));
    }

    #[test]
    fn later_expiry_is_newer() {
        let old = OAuthToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Some(100),
        };
        let new = OAuthToken {
            expires_at: Some(200),
            ..old.clone()
        };
        assert!(new.newer_than(&old));
        assert!(!old.newer_than(&new));
        assert!(!old.newer_than(&old));
    }

    #[test]
    fn decodes_unverified_claims() {
        let token = jwt(&json!({ "sub": "u-42", "role": "3", "name": "Ada", "rexp": 1_900_000_000 }));
        let claims = UnverifiedClaims::decode(&token).unwrap();
        assert_eq!(claims.claims.sub.as_deref(), Some("u-42"));
        assert_eq!(claims.claims.role, Some(3));
        assert_eq!(claims.raw["name"], "Ada");
        assert_eq!(claims.refresh_expires_at(), Some(1_900_000_000));
    }

    #[test]
    fn rejects_non_jwt_access_token() {
        for token in ["opaque-token", "a.b", "a.b.c.d", "a.!!!.c"] {
            let err = UnverifiedClaims::decode(token).unwrap_err();
            assert!(matches!(err, Error::MalformedToken(_)), "token: {token}");
        }
    }
}
