//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::CallError;
use serde_json::json;
use thiserror::Error;

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Call(#[from] CallError),
}

impl ApiError {
    /// Status and machine-readable code of the error.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            ApiError::Call(e) => match e {
                CallError::Offline(_) => (StatusCode::BAD_REQUEST, "USER_OFFLINE"),
                CallError::SelfCall => (StatusCode::BAD_REQUEST, "SELF_CALL"),
                CallError::InvalidKind(_) => (StatusCode::BAD_REQUEST, "INVALID_CALL_TYPE"),
                CallError::InvalidDecision(_) => (StatusCode::BAD_REQUEST, "INVALID_RESPONSE"),
                CallError::NotFound(_) => (StatusCode::NOT_FOUND, "CALL_NOT_FOUND"),
                CallError::NotCallee(_) | CallError::NotParticipant(_) => {
                    (StatusCode::FORBIDDEN, "FORBIDDEN")
                }
                CallError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match self {
            ApiError::Unauthorized(msg)
            | ApiError::BadRequest(msg)
            | ApiError::ServiceUnavailable(msg) => msg,
            ApiError::Call(e) => e.to_string(),
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}
