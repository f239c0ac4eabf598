//! Error taxonomy for the engine, shared by the PTY/execution internals and
//! the HTTP layer that wraps them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Errors surfaced by the engine's internal components (`terminal`, `reader`,
/// `execution`, `service`, `topic`).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn terminal: {0}")]
    SpawnError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("reader error: {0}")]
    ReaderError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("fanout error: {0}")]
    FanoutError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::TransportError(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SpawnError(_) => StatusCode::OK,
            EngineError::ReaderError(_) => StatusCode::OK,
            EngineError::FanoutError(_) => StatusCode::OK,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Top-level HTTP error wrapper. Anything that bubbles out of a handler
/// unhandled becomes an `Internal` here and is reported as HTTP 500, matching
/// spec's "top-level middleware catches any other exception" policy.
impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            EngineError::Internal(detail) => ErrorBody {
                error: "Internal Server Error".to_string(),
                detail: Some(detail.clone()),
            },
            other => ErrorBody {
                error: other.to_string(),
                detail: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
