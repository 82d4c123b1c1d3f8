//! Transfer Error Types
//!
//! One error surface for the engine, orchestrator and RPC layer. `code()` is
//! the stable string clients see, `http_status()` the gateway mapping.

use thiserror::Error;

use crate::compensation::AuditError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Source and target account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    // === Lookup / Idempotency Errors ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Request id reused with a different payload: {0}")]
    RequestConflict(String),

    // === Business Failures (saga reached FAILED) ===
    #[error("{message}")]
    Business { code: String, message: String },

    /// Client-side wait bound hit; the saga keeps running
    #[error("{0}")]
    SyncWaitTimeout(String),

    // === System Errors ===

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &str {
        match self {
            TransferError::Validation(_) => "VALIDATION_ERROR",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::UnsupportedCurrency(_) => "INVALID_CURRENCY",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::RequestConflict(_) => "REQUEST_CONFLICT",
            TransferError::Business { code, .. } => code,
            TransferError::SyncWaitTimeout(_) => "SYNC_WAIT_TIMEOUT",
            TransferError::StorageError(_) => "STORAGE_ERROR",
            TransferError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Validation(_)
            | TransferError::SameAccount
            | TransferError::InvalidAmount
            | TransferError::UnsupportedCurrency(_) => 400,
            TransferError::TransferNotFound(_) => 404,
            TransferError::RequestConflict(_) => 409,
            TransferError::Business { .. } => 422,
            TransferError::SyncWaitTimeout(_) => 504,
            TransferError::ServiceUnavailable(_) => 503,
            TransferError::StorageError(_)
            | TransferError::InvalidStateTransition(_)
            | TransferError::SystemError(_) => 500,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::StorageError(e.to_string())
    }
}

impl From<bincode::Error> for TransferError {
    fn from(e: bincode::Error) -> Self {
        TransferError::StorageError(format!("codec: {}", e))
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::StorageError(e.to_string())
    }
}

impl From<AuditError> for TransferError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::NotFound(id) => TransferError::TransferNotFound(id),
            AuditError::InvalidStateTransition(msg) => TransferError::InvalidStateTransition(msg),
            other => TransferError::StorageError(other.to_string()),
        }
    }
}
