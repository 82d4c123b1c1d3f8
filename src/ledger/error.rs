//! Participant error classification

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a ledger participant may return
///
/// `code()` is the stable classification string the activity runtime matches
/// against its `non_retryable_error_types` list.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    #[error("Insufficient funds on account {account}: balance={balance}, requested={requested}")]
    InsufficientFunds {
        account: String,
        balance: i64,
        requested: i64,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account is blocked: {0}")]
    AccountBlocked(String),

    #[error("Account is not active: {0}")]
    AccountInactive(String),

    #[error("Account is closed: {0}")]
    AccountClosed(String),

    #[error("Invalid currency for account {account}: expected {expected}, got {got}")]
    InvalidCurrency {
        account: String,
        expected: String,
        got: String,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Reversal does not match transaction {original_tx_id}: {reason}")]
    ReversalMismatch {
        original_tx_id: String,
        reason: String,
    },

    #[error("Transaction already reversed: {0}")]
    AlreadyReversed(String),

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(String),

    #[error("Transient ledger error: {0}")]
    Transient(String),
}

impl LedgerError {
    pub const INSUFFICIENT_FUNDS: &'static str = "INSUFFICIENT_FUNDS";
    pub const ACCOUNT_NOT_FOUND: &'static str = "ACCOUNT_NOT_FOUND";
    pub const ACCOUNT_BLOCKED: &'static str = "ACCOUNT_BLOCKED";
    pub const INVALID_CURRENCY: &'static str = "INVALID_CURRENCY";
    pub const ACCOUNT_INACTIVE: &'static str = "ACCOUNT_INACTIVE";
    pub const ACCOUNT_CLOSED: &'static str = "ACCOUNT_CLOSED";
    pub const TRANSACTION_NOT_FOUND: &'static str = "TRANSACTION_NOT_FOUND";
    pub const REVERSAL_MISMATCH: &'static str = "REVERSAL_MISMATCH";
    pub const ALREADY_REVERSED: &'static str = "ALREADY_REVERSED";
    pub const BALANCE_OVERFLOW: &'static str = "BALANCE_OVERFLOW";

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => Self::INSUFFICIENT_FUNDS,
            LedgerError::AccountNotFound(_) => Self::ACCOUNT_NOT_FOUND,
            LedgerError::AccountBlocked(_) => Self::ACCOUNT_BLOCKED,
            LedgerError::AccountInactive(_) => Self::ACCOUNT_INACTIVE,
            LedgerError::AccountClosed(_) => Self::ACCOUNT_CLOSED,
            LedgerError::InvalidCurrency { .. } => Self::INVALID_CURRENCY,
            LedgerError::TransactionNotFound(_) => Self::TRANSACTION_NOT_FOUND,
            LedgerError::ReversalMismatch { .. } => Self::REVERSAL_MISMATCH,
            LedgerError::AlreadyReversed(_) => Self::ALREADY_REVERSED,
            LedgerError::BalanceOverflow(_) => Self::BALANCE_OVERFLOW,
            LedgerError::Transient(_) => "TRANSIENT",
        }
    }

    /// The default non-retryable set used by banking-tuned activity policies
    pub fn default_non_retryable() -> Vec<String> {
        [
            Self::INSUFFICIENT_FUNDS,
            Self::ACCOUNT_NOT_FOUND,
            Self::INVALID_CURRENCY,
            Self::ACCOUNT_BLOCKED,
            Self::ACCOUNT_INACTIVE,
            Self::ACCOUNT_CLOSED,
            Self::TRANSACTION_NOT_FOUND,
            Self::REVERSAL_MISMATCH,
            Self::ALREADY_REVERSED,
            Self::BALANCE_OVERFLOW,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}
