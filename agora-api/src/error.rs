//! Error types for agora-api

use crate::buffer::BufferError;
use crate::exports::ExportRejected;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Buffer refused the event
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Export refused before it was queued
    #[error(transparent)]
    Export(#[from] ExportRejected),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// agora-common error
    #[error("Common error: {0}")]
    Common(#[from] agora_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Buffer(BufferError::Invalid(_)) => (StatusCode::BAD_REQUEST, "INVALID_EVENT"),
            ApiError::Buffer(BufferError::ShuttingDown(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN")
            }
            ApiError::Export(ExportRejected::AlreadyActive { .. }) => {
                (StatusCode::CONFLICT, "EXPORT_ACTIVE")
            }
            ApiError::Export(ExportRejected::CooldownActive { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "EXPORT_COOLDOWN")
            }
            ApiError::Export(ExportRejected::NoOpinions) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "NO_OPINIONS")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Common(agora_common::Error::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Common(agora_common::Error::InvalidInput(_)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST")
            }
            ApiError::Common(_) => (StatusCode::INTERNAL_SERVER_ERROR, "COMMON_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(code = error_code, error = %message, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Buffer(BufferError::ShuttingDown("votes")), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::Export(ExportRejected::NoOpinions), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ApiError::Common(agora_common::Error::NotFound("conversation 1".into())),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
