//! Compensation Audit Store
//!
//! Durable record of every compensation the saga engine runs. One record is
//! opened per reversal (only after a debit succeeded) and moves forward only:
//!
//! ```text
//! pending ──► completed | failed | timeout | manual_required
//! ```
//!
//! Terminal records are immutable. `attempts` only grows and `completed_at` is
//! set exactly when a terminal status is written.

pub mod db;
pub mod memory;
pub mod wal;

pub use db::PgAuditStore;
pub use memory::MemoryAuditStore;
pub use wal::WalAuditStore;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::TransferId;

/// Stale `pending` records older than this show up in the pending view
pub const DEFAULT_PENDING_GRACE: Duration = Duration::from_secs(300);

/// Default stats window
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(24 * 3600);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuditError {
    #[error("Compensation record not found: {0}")]
    NotFound(String),

    #[error("Invalid compensation status transition: {0}")]
    InvalidStateTransition(String),

    #[error("Audit database error: {0}")]
    Database(String),

    #[error("Audit log error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        AuditError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationType {
    DebitReversal,
    CreditReversal,
    Manual,
}

impl CompensationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationType::DebitReversal => "debit_reversal",
            CompensationType::CreditReversal => "credit_reversal",
            CompensationType::Manual => "manual",
        }
    }
}

impl FromStr for CompensationType {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit_reversal" => Ok(CompensationType::DebitReversal),
            "credit_reversal" => Ok(CompensationType::CreditReversal),
            "manual" => Ok(CompensationType::Manual),
            other => Err(AuditError::Database(format!(
                "Invalid compensation_type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
    ManualRequired,
}

impl CompensationStatus {
    pub const ALL: [CompensationStatus; 5] = [
        CompensationStatus::Pending,
        CompensationStatus::Completed,
        CompensationStatus::Failed,
        CompensationStatus::Timeout,
        CompensationStatus::ManualRequired,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompensationStatus::Pending)
    }

    /// Terminal statuses an operator has to look at
    #[inline]
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            CompensationStatus::Failed
                | CompensationStatus::Timeout
                | CompensationStatus::ManualRequired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStatus::Pending => "pending",
            CompensationStatus::Completed => "completed",
            CompensationStatus::Failed => "failed",
            CompensationStatus::Timeout => "timeout",
            CompensationStatus::ManualRequired => "manual_required",
        }
    }
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompensationStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompensationStatus::ALL
            .iter()
            .find(|st| st.as_str() == s)
            .copied()
            .ok_or_else(|| AuditError::Database(format!("Invalid compensation_status: {}", s)))
    }
}

/// One compensation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAudit {
    pub id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub transfer_id: TransferId,
    pub original_debit_tx_id: String,
    pub reason: String,
    pub compensation_type: CompensationType,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensation_tx_id: Option<String>,
    pub failure_reason: Option<String>,
    pub timeout_duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
}

impl CompensationAudit {
    /// Fresh `pending` record with zero attempts
    pub fn open(new: NewCompensation, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("comp_{}", ulid::Ulid::new()),
            workflow_id: new.workflow_id,
            run_id: new.run_id,
            transfer_id: new.transfer_id,
            original_debit_tx_id: new.original_debit_tx_id,
            reason: new.reason,
            compensation_type: new.compensation_type,
            status: CompensationStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            compensation_tx_id: None,
            failure_reason: None,
            timeout_duration_ms: None,
            metadata: new.metadata,
        }
    }

    /// Record one attempt and, for a terminal status, close the record
    pub fn apply_update(
        &mut self,
        update: &CompensationUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        if self.status.is_terminal() {
            return Err(AuditError::InvalidStateTransition(format!(
                "{} is already {} and cannot become {}",
                self.id, self.status, update.status
            )));
        }
        self.attempts += 1;
        self.updated_at = now;
        if update.status.is_terminal() {
            self.status = update.status;
            self.completed_at = Some(now);
        }
        if let Some(tx) = &update.compensation_tx_id {
            self.compensation_tx_id = Some(tx.clone());
        }
        if let Some(reason) = &update.failure_reason {
            self.failure_reason = Some(reason.clone());
        }
        if let Some(ms) = update.timeout_duration_ms {
            self.timeout_duration_ms = Some(ms);
        }
        Ok(())
    }

    /// Member of the operator pending view at `now`
    pub fn is_pending_attention(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.status {
            CompensationStatus::Pending => {
                let age = now.signed_duration_since(self.created_at);
                age.to_std().map(|a| a >= grace).unwrap_or(false)
            }
            status => status.needs_attention(),
        }
    }
}

/// Input to `open`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCompensation {
    pub workflow_id: String,
    pub run_id: String,
    pub transfer_id: TransferId,
    pub original_debit_tx_id: String,
    pub reason: String,
    pub compensation_type: CompensationType,
    pub metadata: serde_json::Value,
}

/// Input to `update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationUpdate {
    pub status: CompensationStatus,
    pub compensation_tx_id: Option<String>,
    pub failure_reason: Option<String>,
    pub timeout_duration_ms: Option<i64>,
}

impl CompensationUpdate {
    /// Another attempt, status unchanged
    pub fn attempt(failure_reason: Option<String>) -> Self {
        Self {
            status: CompensationStatus::Pending,
            compensation_tx_id: None,
            failure_reason,
            timeout_duration_ms: None,
        }
    }

    pub fn completed(compensation_tx_id: String) -> Self {
        Self {
            status: CompensationStatus::Completed,
            compensation_tx_id: Some(compensation_tx_id),
            failure_reason: None,
            timeout_duration_ms: None,
        }
    }

    pub fn failed(reason: String) -> Self {
        Self {
            status: CompensationStatus::Failed,
            compensation_tx_id: None,
            failure_reason: Some(reason),
            timeout_duration_ms: None,
        }
    }

    pub fn timed_out(reason: String, elapsed: Duration) -> Self {
        Self {
            status: CompensationStatus::Timeout,
            compensation_tx_id: None,
            failure_reason: Some(reason),
            timeout_duration_ms: Some(elapsed.as_millis() as i64),
        }
    }
}

/// Aggregates over a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompensationStats {
    pub window_secs: u64,
    pub total: u64,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub manual_required: u64,
    /// completed / terminal, 0 when nothing is terminal
    pub success_rate: f64,
    pub avg_attempts: f64,
}

impl CompensationStats {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a CompensationAudit>,
        window: Duration,
    ) -> Self {
        let mut stats = CompensationStats {
            window_secs: window.as_secs(),
            ..Default::default()
        };
        let mut attempts = 0u64;
        for r in records {
            stats.total += 1;
            attempts += r.attempts as u64;
            match r.status {
                CompensationStatus::Pending => stats.pending += 1,
                CompensationStatus::Completed => stats.completed += 1,
                CompensationStatus::Failed => stats.failed += 1,
                CompensationStatus::Timeout => stats.timeout += 1,
                CompensationStatus::ManualRequired => stats.manual_required += 1,
            }
        }
        let terminal = stats.total - stats.pending;
        if terminal > 0 {
            stats.success_rate = stats.completed as f64 / terminal as f64;
        }
        if stats.total > 0 {
            stats.avg_attempts = attempts as f64 / stats.total as f64;
        }
        stats
    }
}

/// Lower bound of a stats window ending at `now`
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Audit store contract
///
/// `update` addresses the newest record of a transfer.
#[async_trait]
pub trait CompensationAuditStore: Send + Sync {
    async fn open(&self, new: NewCompensation) -> Result<CompensationAudit, AuditError>;

    async fn update(
        &self,
        transfer_id: &TransferId,
        update: CompensationUpdate,
    ) -> Result<CompensationAudit, AuditError>;

    /// Newest first
    async fn by_transfer(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Vec<CompensationAudit>, AuditError>;

    /// Stale `pending` plus records needing attention, oldest first
    async fn pending(&self, limit: usize) -> Result<Vec<CompensationAudit>, AuditError>;

    async fn stats(&self, window: Duration) -> Result<CompensationStats, AuditError>;

    /// Reachability
    async fn ping(&self) -> Result<(), AuditError> {
        Ok(())
    }
}
