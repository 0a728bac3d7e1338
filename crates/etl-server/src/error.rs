//! Server-specific error types

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use etl_common::error::EtlError;
use thiserror::Error;

use crate::api::response::ErrorResponse;

/// Result type alias for request handlers
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Etl(#[from] EtlError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl AppError {
    /// HTTP status and machine-readable code for this error.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Etl(e) => match e {
                EtlError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                EtlError::Packaging(_) => (StatusCode::BAD_REQUEST, "PACKAGING_ERROR"),
                EtlError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                EtlError::AlreadyExists(_) => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
                EtlError::Lifecycle(_) => (StatusCode::CONFLICT, "LIFECYCLE_ERROR"),
                EtlError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                EtlError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
                EtlError::Serialization(_) => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
                EtlError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            },
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(code, error = %self, "Request failed");
        } else {
            tracing::debug!(code, error = %self, "Request rejected");
        }
        (status, Json(ErrorResponse::new(code, self.to_string()))).into_response()
    }
}
