//! JWT verification against a configured public key
//!
//! The signature is checked by `jsonwebtoken` with its own claim checks
//! switched off. Validity window, audience and issuer are then checked here,
//! in that order, so each failure produces its own reason.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::claims::Claims;

/// Errors from token verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JwtError {
    #[error("invalid verification key: {0}")]
    Key(String),

    #[error("token rejected: {0}")]
    Token(String),

    #[error("current time not in token's valid period")]
    OutsideValidPeriod,

    #[error("invalid audience")]
    InvalidAudience,

    #[error("invalid issuer")]
    InvalidIssuer,
}

/// Verifies bearer tokens. Immutable after construction.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
    valid_issuers: Vec<String>,
    valid_audiences: Vec<String>,
    leeway_secs: i64,
}

impl JwtValidator {
    /// Build a validator from a PEM encoded public key.
    ///
    /// The key family follows the algorithm: RSA for `RS*`/`PS*`, EC for
    /// `ES*`, Ed25519 for `EdDSA`.
    pub fn from_pem(
        pem: &[u8],
        algorithm: Algorithm,
        valid_issuers: Vec<String>,
        valid_audiences: Vec<String>,
    ) -> Result<Self, JwtError> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                return Err(JwtError::Key(format!(
                    "{algorithm:?} is symmetric, a public key algorithm is required"
                )));
            }
        }
        .map_err(|e| JwtError::Key(e.to_string()))?;

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        Ok(Self {
            key,
            validation,
            valid_issuers,
            valid_audiences,
            leeway_secs: 0,
        })
    }

    /// Clock skew tolerated on `exp`/`nbf`.
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    /// Verify `token` at the current time.
    pub fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.validate_at(token, now)
    }

    /// Verify `token` as of `now` (unix seconds).
    pub fn validate_at(&self, token: &str, now: i64) -> Result<Claims, JwtError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| JwtError::Token(e.to_string()))?
            .claims;

        if !claims.valid_at(now, self.leeway_secs) {
            return Err(JwtError::OutsideValidPeriod);
        }
        if !claims.has_any_audience(&self.valid_audiences) {
            return Err(JwtError::InvalidAudience);
        }
        if !claims.issued_by_any(&self.valid_issuers) {
            return Err(JwtError::InvalidIssuer);
        }

        Ok(claims)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    pub(crate) const SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/signing_key.pem");
    pub(crate) const PUBLIC_KEY: &[u8] = include_bytes!("../tests/fixtures/signing_key.pub.pem");
    const OTHER_KEY: &[u8] = include_bytes!("../tests/fixtures/other_key.pem");

    pub(crate) const ISSUER: &str = "https://id.example.com";
    pub(crate) const AUDIENCE: &str = "orders-api";
    const NOW: i64 = 1_750_000_000;

    pub(crate) fn sign(claims: &serde_json::Value, key: &[u8]) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::PS256),
            claims,
            &EncodingKey::from_rsa_pem(key).unwrap(),
        )
        .unwrap()
    }

    pub(crate) fn validator() -> JwtValidator {
        JwtValidator::from_pem(
            PUBLIC_KEY,
            Algorithm::PS256,
            vec![ISSUER.to_string()],
            vec![AUDIENCE.to_string(), "billing-api".to_string()],
        )
        .unwrap()
    }

    fn good_claims() -> serde_json::Value {
        json!({
            "sub": "user-1",
            "iss": ISSUER,
            "aud": [AUDIENCE],
            "nbf": NOW - 60,
            "exp": NOW + 600,
            "role": "2",
            "level": "1",
        })
    }

    #[test]
    fn accepts_valid_token() {
        let token = sign(&good_claims(), SIGNING_KEY);
        let claims = validator().validate_at(&token, NOW).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user-1"));
        assert_eq!(claims.role, Some(2));
        assert_eq!(claims.level, Some(1));
    }

    #[test]
    fn rejects_token_signed_with_other_key() {
        let token = sign(&good_claims(), OTHER_KEY);
        let err = validator().validate_at(&token, NOW).unwrap_err();
        assert!(matches!(err, JwtError::Token(_)), "got: {err:?}");
    }

    #[test]
    fn rejects_expired_token() {
        let token = sign(&good_claims(), SIGNING_KEY);
        assert_eq!(
            validator().validate_at(&token, NOW + 601),
            Err(JwtError::OutsideValidPeriod)
        );
    }

    #[test]
    fn rejects_token_before_not_before() {
        let token = sign(&good_claims(), SIGNING_KEY);
        assert_eq!(
            validator().validate_at(&token, NOW - 61),
            Err(JwtError::OutsideValidPeriod)
        );
    }

    #[test]
    fn leeway_widens_the_window() {
        let token = sign(&good_claims(), SIGNING_KEY);
        assert!(
            validator()
                .with_leeway(30)
                .validate_at(&token, NOW + 620)
                .is_ok()
        );
    }

    #[test]
    fn rejects_foreign_audience() {
        let mut claims = good_claims();
        claims["aud"] = json!(["inventory-api"]);
        let token = sign(&claims, SIGNING_KEY);
        assert_eq!(
            validator().validate_at(&token, NOW),
            Err(JwtError::InvalidAudience)
        );
    }

    #[test]
    fn any_matching_audience_is_enough() {
        let mut claims = good_claims();
        claims["aud"] = json!(["inventory-api", "billing-api"]);
        let token = sign(&claims, SIGNING_KEY);
        assert!(validator().validate_at(&token, NOW).is_ok());
    }

    #[test]
    fn rejects_foreign_issuer() {
        let mut claims = good_claims();
        claims["iss"] = json!("https://evil.example.com");
        let token = sign(&claims, SIGNING_KEY);
        assert_eq!(
            validator().validate_at(&token, NOW),
            Err(JwtError::InvalidIssuer)
        );
    }

    #[test]
    fn rejects_garbage() {
        let err = validator().validate_at("not.a.jwt", NOW).unwrap_err();
        assert!(matches!(err, JwtError::Token(_)));
    }

    #[test]
    fn symmetric_algorithms_are_refused() {
        let result = JwtValidator::from_pem(PUBLIC_KEY, Algorithm::HS256, vec![], vec![]);
        assert!(matches!(result, Err(JwtError::Key(_))));
    }
}
