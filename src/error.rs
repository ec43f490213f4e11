use bankd_core::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BankError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BankError {
    pub fn validation(message: impl Into<String>) -> Self {
        BankError::Validation(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BankError::Storage(e) if e.is_retryable())
    }
}

impl From<tokio::task::JoinError> for BankError {
    fn from(e: tokio::task::JoinError) -> Self {
        BankError::Internal(format!("background task failed: {}", e))
    }
}
