//! Error types for the OAuth client flow

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Errors from the authorization flow, token storage and refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// State token unknown, expired or already redeemed.
    #[error("invalid state")]
    InvalidState,

    #[error("pkce verification failed: {0}")]
    PkceMismatch(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token artifact error: {0}")]
    Encryption(String),

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidState | Error::PkceMismatch(_) | Error::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::RefreshFailed(_) => StatusCode::UNAUTHORIZED,
            Error::TokenExchange(_)
            | Error::Encryption(_)
            | Error::MalformedToken(_)
            | Error::Http(_)
            | Error::Session(_)
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body. Only provider text from a failed exchange is echoed;
    /// everything else gets a fixed reason.
    pub fn reason(&self) -> String {
        match self {
            Error::InvalidState => "invalid state".to_string(),
            Error::PkceMismatch(_) => "pkce verification failed".to_string(),
            Error::InvalidRequest(msg) => msg.clone(),
            Error::TokenExchange(msg) => msg.clone(),
            Error::RefreshFailed(_) => "session expired, please sign in again".to_string(),
            Error::Encryption(_)
            | Error::MalformedToken(_)
            | Error::Http(_)
            | Error::Session(_)
            | Error::Config(_) => "internal error".to_string(),
        }
    }
}

impl From<tower_sessions::session::Error> for Error {
    fn from(err: tower_sessions::session::Error) -> Self {
        Error::Session(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "oauth client error");
        }
        (status, self.reason()).into_response()
    }
}
