//! HTTP API error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::OrchestratorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The request cannot succeed until configuration or permissions change.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// The tracker failed; the request may succeed later.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match &err {
            OrchestratorError::UnknownIssue(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::Gateway(e) if e.is_not_found() => ApiError::NotFound(err.to_string()),
            _ if err.is_fatal() => ApiError::Unprocessable(err.to_string()),
            _ => ApiError::Upstream(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}
