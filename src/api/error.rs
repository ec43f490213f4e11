use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bankd_core::StorageError;
use serde::Serialize;

use crate::error::BankError;

/// Error response: a status plus a machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
    code: &'a str,
    retryable: bool,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal server error")
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        let message = e.to_string();
        match e {
            StorageError::NotFound { .. } => Self::not_found(message),
            StorageError::AlreadyExists(_) => Self::new(StatusCode::CONFLICT, "ALREADY_EXISTS", message),
            StorageError::IdempotencyConflict(_) => {
                Self::new(StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT", message)
            }
            StorageError::InsufficientFunds { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_FUNDS", message)
            }
            StorageError::AccountInactive(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "ACCOUNT_INACTIVE", message)
            }
            StorageError::InvalidState(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_STATE", message),
            StorageError::Busy(_) => {
                tracing::warn!(error = %message, "Storage busy");
                Self {
                    retryable: true,
                    ..Self::new(StatusCode::SERVICE_UNAVAILABLE, "STORAGE_BUSY", "storage is busy, retry the request")
                }
            }
            StorageError::Corrupt(_) | StorageError::Other(_) => {
                tracing::error!(error = %message, "Storage failure");
                Self::internal()
            }
        }
    }
}

impl From<BankError> for ApiError {
    fn from(e: BankError) -> Self {
        match e {
            BankError::Validation(message) => Self::bad_request(message),
            BankError::InvalidCredentials => {
                Self::new(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", "invalid credentials")
            }
            BankError::Unauthorized(message) => Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message),
            BankError::Forbidden(message) => Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message),
            BankError::Storage(e) => e.into(),
            BankError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                Self::internal()
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: &self.message,
            code: self.code,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}
