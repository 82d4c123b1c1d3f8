//! Transfer Saga
//!
//! Moves funds between two ledger accounts as a durable saga:
//! check balance, debit, credit, confirm, with an audited compensating
//! reversal when the credit leg cannot complete.
//!
//! # Architecture
//!
//! ```text
//! gateway ──► TransferOrchestrator ──rpc──► SagaEngine ──► ActivityRuntime ──► LedgerParticipant
//!                                              │
//!                                              ├──► SagaStore (event log)
//!                                              └──► CompensationAuditStore
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: every transition is appended before the effect
//! 2. **Idempotency**: participant calls carry a key stable per (request, step)
//! 3. **Reversal Only After Debit**: compensation audits exist only for applied debits

pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod rpc;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

// Re-exports for convenience
pub use engine::{CancelOutcome, EngineConfig, SagaEngine, StartOutcome};
pub use error::TransferError;
pub use orchestrator::{OrchestratorConfig, TransferCommand, TransferOrchestrator, TransferResult};
pub use rpc::{EngineClient, ExecuteTransferRequest, engine_channel, serve};
pub use state::{CompensationCause, SagaEvent, SagaPhase, SagaState, TransferStatus};
pub use store::{MemorySagaStore, SagaStore, WalSagaStore};
pub use types::{KeyScheme, SagaStep, StepAttempt, TransferId, TransferRequest};
pub use worker::{RecoveryWorker, WorkerConfig};
