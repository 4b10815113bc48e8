use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the multiplexer, kept as kinds rather than exception
/// types so the same value can be turned into an HTTP status, a WebSocket
/// `error` message, or a log line.
#[derive(Debug, Error, Clone)]
pub enum AgentMuxError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ToolUnavailable(String),
    #[error("spawn watchdog expired before the child produced output")]
    SpawnHang,
    #[error("{0}")]
    Persistence(String),
    #[error("{0}")]
    RateLimit(String),
    #[error("authentication failed")]
    AuthFailure,
}

impl AgentMuxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ToolUnavailable(_) => StatusCode::BAD_REQUEST,
            Self::SpawnHang => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AgentMuxError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}
