//! Transfer Saga - durable account-to-account money transfers
//!
//! A transfer runs as a saga: validate, check balance, debit the source,
//! credit the target, confirm. When the credit leg cannot complete the debit
//! is reversed by an audited compensation.
//!
//! # Modules
//!
//! - [`currency`] - ISO currency codes accepted by the ledger
//! - [`ledger`] - Ledger participant contract and the in-memory ledger
//! - [`activity`] - Retry policy, timeouts, heartbeats and cancellation for participant calls
//! - [`compensation`] - Compensation audit records and stores (memory, PostgreSQL)
//! - [`transfer`] - Saga state machine, engine, RPC, orchestrator, recovery worker
//! - [`wal`] - Write-Ahead Log backing the saga store
//! - [`metrics`] - Saga counters and latency samples
//! - [`gateway`] - HTTP API
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

pub mod activity;
pub mod compensation;
pub mod config;
pub mod currency;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod transfer;
pub mod wal;

// Convenient re-exports at crate root
pub use activity::{ActivityOptions, ActivityRuntime, RetryPolicy};
pub use compensation::{CompensationAudit, CompensationAuditStore, CompensationStatus};
pub use currency::Currency;
pub use ledger::{InMemoryLedger, LedgerError, LedgerParticipant};
pub use metrics::SagaMetrics;
pub use transfer::{
    SagaEngine, TransferError, TransferId, TransferOrchestrator, TransferRequest, TransferStatus,
};
