//! Error types for ark-relay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for ark-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ark-relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A required upstream setting was absent at startup and is needed now.
    #[error("Missing setting: {0}")]
    MissingSetting(&'static str),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The upstream stream broke after fragments had started flowing.
    #[error("Upstream stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status used when this error is rendered as a response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::MissingSetting(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::StreamInterrupted(_) => StatusCode::BAD_GATEWAY,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "relay_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
