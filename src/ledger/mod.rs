//! Ledger Participants
//!
//! The four balance operations a transfer saga drives against an account ledger:
//! `CheckBalance`, `Debit`, `Credit` and `CompensateDebit`.
//!
//! # Contract
//!
//! 1. **Idempotency**: every mutating call carries an `idempotency_key`. Two calls
//!    with the same key MUST produce the same observable effect and the same result.
//! 2. **Serialization**: the participant serializes conflicting operations on one
//!    account. The engine never holds locks across participants.
//! 3. **Classification**: errors carry a stable code; the activity runtime decides
//!    retryability from that code alone.

pub mod error;
pub mod memory;

pub use error::LedgerError;
pub use memory::{AccountStatus, InMemoryLedger, LedgerEntry, LedgerEntryKind};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::Heartbeat;
use crate::currency::Currency;

/// Result of a balance check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub sufficient_funds: bool,
    pub current_balance: i64,
    pub currency: Currency,
    pub status: AccountStatus,
}

/// Receipt returned by every balance-mutating operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    /// Participant-assigned transaction id
    pub tx_id: String,
    pub previous_balance: i64,
    pub new_balance: i64,
    pub completed_at: DateTime<Utc>,
}

/// Evidence that a step took effect on an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalanceChange {
    pub account_id: String,
    pub previous_balance: i64,
    pub new_balance: i64,
    pub delta: i64,
    pub reason: String,
    pub caused_by_tx_id: String,
}

/// Debit / Credit input
#[derive(Debug, Clone)]
pub struct Posting<'a> {
    pub account: &'a str,
    pub amount: i64,
    pub currency: Currency,
    pub idempotency_key: &'a str,
    pub reference: &'a str,
}

/// CompensateDebit input
#[derive(Debug, Clone)]
pub struct Reversal<'a> {
    pub original_tx_id: &'a str,
    pub account: &'a str,
    pub amount: i64,
    pub currency: Currency,
    pub idempotency_key: &'a str,
    pub reason: &'a str,
}

/// Ledger participant trait
///
/// All mutating methods MUST be idempotent on `idempotency_key`.
/// Implementations may call [`Heartbeat::beat`] at any point to prove liveness
/// during long operations.
#[async_trait]
pub trait LedgerParticipant: Send + Sync {
    /// Participant name for logging
    fn name(&self) -> &'static str;

    /// Read-only balance lookup
    async fn check_balance(
        &self,
        account: &str,
        amount: i64,
        currency: Currency,
        heartbeat: &Heartbeat,
    ) -> Result<BalanceCheck, LedgerError>;

    /// Atomically deduct `amount`. Rejects with `INSUFFICIENT_FUNDS` when short.
    async fn debit(
        &self,
        posting: &Posting<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Atomically add `amount`. Rejects inactive accounts and currency mismatch.
    async fn credit(
        &self,
        posting: &Posting<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Reverse a previous debit.
    ///
    /// Succeeds on any account that is not permanently closed.
    async fn compensate_debit(
        &self,
        reversal: &Reversal<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Reachability check for health reporting
    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
