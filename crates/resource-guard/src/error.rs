use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::jwt::JwtError;

/// Why a request was refused by the resource guard.
///
/// The reason text is the response body, so it stays short and never echoes
/// token contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,

    #[error("invalid authorization header")]
    MalformedHeader,

    #[error("invalid token")]
    InvalidToken,

    #[error("current time not in token's valid period")]
    OutsideValidPeriod,

    #[error("invalid audience")]
    InvalidAudience,

    #[error("invalid issuer")]
    InvalidIssuer,

    /// Refused by a host supplied claims validator.
    #[error("{0}")]
    Rejected(String),

    #[error("token doesn't have role field")]
    MissingRole,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid route key")]
    InvalidRoute,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MalformedHeader => StatusCode::BAD_REQUEST,
            AuthError::InvalidRoute => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Short label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "missing_header",
            AuthError::MalformedHeader => "malformed_header",
            AuthError::InvalidToken => "invalid_token",
            AuthError::OutsideValidPeriod => "expired",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::InvalidIssuer => "invalid_issuer",
            AuthError::Rejected(_) => "rejected",
            AuthError::MissingRole => "missing_role",
            AuthError::PermissionDenied => "denied",
            AuthError::InvalidRoute => "invalid_route",
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::OutsideValidPeriod => AuthError::OutsideValidPeriod,
            JwtError::InvalidAudience => AuthError::InvalidAudience,
            JwtError::InvalidIssuer => AuthError::InvalidIssuer,
            JwtError::Key(_) | JwtError::Token(_) => AuthError::InvalidToken,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
