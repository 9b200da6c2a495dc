use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::SessionError;

/// Structured error type for the front door handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly. Proxy failures are not represented
/// here; they render as HTML from the proxy itself.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Session name contains characters not allowed in a folder name.
    InvalidSessionName(String),
    /// 403 - Trusted identity header missing or naming another user.
    Forbidden,
    /// 500 - No backend context exists for the session.
    SessionNotRunning(String),
    /// 500 - Starting the backend failed.
    SessionStartFailed(String),
    /// 500 - Stopping the backend failed.
    SessionStopFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidSessionName(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::SessionNotRunning(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::SessionStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::SessionStopFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidSessionName(_) => "invalid_session_name",
            ApiError::Forbidden => "forbidden",
            ApiError::SessionNotRunning(_) => "session_not_running",
            ApiError::SessionStartFailed(_) => "session_start_failed",
            ApiError::SessionStopFailed(_) => "session_stop_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidSessionName(name) => format!("Invalid session name: {}.", name),
            ApiError::Forbidden => "Not allowed to access this session.".to_string(),
            ApiError::SessionNotRunning(name) => {
                format!("Notebook backend is not running for {}.", name)
            }
            ApiError::SessionStartFailed(detail) => {
                format!("Failed to start notebook: {}.", detail)
            }
            ApiError::SessionStopFailed(detail) => {
                format!("Failed to stop notebook: {}.", detail)
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }

    pub(crate) fn start_failed(err: SessionError) -> Self {
        match err {
            SessionError::InvalidName(name) => ApiError::InvalidSessionName(name),
            other => ApiError::SessionStartFailed(other.to_string()),
        }
    }

    pub(crate) fn stop_failed(err: SessionError) -> Self {
        match err {
            SessionError::InvalidName(name) => ApiError::InvalidSessionName(name),
            other => ApiError::SessionStopFailed(other.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidName(name) => ApiError::InvalidSessionName(name),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
