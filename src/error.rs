use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::protocol::FrameError;
use crate::resolver::ResolveError;
use crate::socks::ProxyError;

/// Failure modes of a single probe attempt. JSON parse failures are not
/// errors: the scan still succeeds with the raw payload preserved.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed before status response")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coordinator-side error taxonomy mapped onto HTTP statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid or missing API key")]
    Auth,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("database error")]
    Db(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Db(err) => {
                tracing::error!(error = %err, "database error while handling request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
