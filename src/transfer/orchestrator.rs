//! Transfer Orchestrator
//!
//! Client-facing service over the engine RPC. Validates request shapes,
//! starts or attaches to a saga, and optionally waits for its terminal status.
//! It only ever reads saga state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::error::TransferError;
use super::rpc::{
    CancelTransferResponse, EngineClient, ExecuteTransferRequest, GetTransferStatusResponse,
    HealthResponse,
};
use super::state::TransferStatus;
use super::types::TransferId;

pub const ACCOUNT_ID_LEN: usize = 12;
pub const MAX_AMOUNT: i64 = 1_000_000_000;
pub const MAX_DESCRIPTION_LEN: usize = 100;
pub const MAX_REFERENCE_LEN: usize = 50;

pub const SYNC_WAIT_TIMEOUT_MESSAGE: &str =
    "sync wait timeout reached; transfer continues in background";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Client-side sync wait bound
    pub sync_wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sync_wait_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// ExecuteTransfer input
#[derive(Debug, Clone)]
pub struct TransferCommand {
    pub request: ExecuteTransferRequest,
    pub wait_for_completion: bool,
}

/// ExecuteTransfer result
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub transaction_id: String,
    pub status: TransferStatus,
    pub workflow_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_applied: bool,
    /// Sync wait gave up before a terminal status
    pub wait_timed_out: bool,
    pub message: Option<String>,
}

impl TransferResult {
    fn from_status(s: GetTransferStatusResponse) -> Self {
        Self {
            transaction_id: s.transaction_id,
            status: s.status,
            workflow_id: s.workflow_execution.workflow_id,
            run_id: s.workflow_execution.run_id,
            created_at: s.created_at,
            completed_at: s.completed_at,
            error_code: s.error_code,
            error_message: s.error_message,
            compensation_applied: s.compensation_applied,
            wait_timed_out: false,
            message: None,
        }
    }
}

pub struct TransferOrchestrator {
    client: EngineClient,
    config: OrchestratorConfig,
}

impl TransferOrchestrator {
    pub fn new(client: EngineClient, config: OrchestratorConfig) -> Self {
        Self { client, config }
    }

    /// ExecuteTransfer
    pub async fn execute_transfer(
        &self,
        command: TransferCommand,
    ) -> Result<TransferResult, TransferError> {
        validate_shape(&command.request)?;

        let started = self.client.execute(command.request).await?;
        info!(
            transaction_id = %started.transaction_id,
            created = started.created,
            wait = command.wait_for_completion,
            "Transfer accepted"
        );

        if !command.wait_for_completion {
            return Ok(TransferResult {
                transaction_id: started.transaction_id,
                status: started.status,
                workflow_id: started.workflow_id,
                run_id: started.run_id,
                created_at: started.created_at,
                completed_at: None,
                error_code: None,
                error_message: None,
                compensation_applied: false,
                wait_timed_out: false,
                message: None,
            });
        }

        self.wait_for_terminal(&started.transaction_id).await
    }

    /// Poll until terminal or the sync wait bound. The saga keeps running on timeout.
    async fn wait_for_terminal(&self, transaction_id: &str) -> Result<TransferResult, TransferError> {
        let deadline = Instant::now() + self.config.sync_wait_timeout;
        loop {
            let status = self.client.get_status(transaction_id).await?;
            if status.status.is_terminal() {
                return Ok(TransferResult::from_status(status));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(transaction_id, "Sync wait timed out");
                let mut result = TransferResult::from_status(status);
                result.status = TransferStatus::Processing;
                result.wait_timed_out = true;
                result.message = Some(SYNC_WAIT_TIMEOUT_MESSAGE.to_string());
                return Ok(result);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// GetTransferStatus; never blocks on the saga
    pub async fn get_transfer_status(
        &self,
        transaction_id: &str,
    ) -> Result<GetTransferStatusResponse, TransferError> {
        self.client.get_status(transaction_id).await
    }

    /// CancelTransfer; the saga finishes cancellation on its own run
    pub async fn cancel_transfer(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<CancelTransferResponse, TransferError> {
        let response = self.client.cancel(transaction_id, reason).await?;
        info!(transaction_id, success = response.success, "Cancel processed");
        Ok(response)
    }

    pub async fn health(&self) -> Result<HealthResponse, TransferError> {
        self.client.health().await
    }

    /// Transfer id a request id maps to
    pub fn transaction_id_for(request_id: &str) -> String {
        TransferId::from_request_id(request_id).to_string()
    }
}

/// Field-shape checks; business rules are left to the engine
pub fn validate_shape(request: &ExecuteTransferRequest) -> Result<(), TransferError> {
    for (field, value) in [
        ("from_account", &request.from_account),
        ("to_account", &request.to_account),
    ] {
        if value.chars().count() != ACCOUNT_ID_LEN {
            return Err(TransferError::Validation(format!(
                "{} must be {} characters",
                field, ACCOUNT_ID_LEN
            )));
        }
    }
    if request.amount < 1 || request.amount > MAX_AMOUNT {
        return Err(TransferError::Validation(format!(
            "amount must be between 1 and {}",
            MAX_AMOUNT
        )));
    }
    if request.currency.chars().count() != 3 {
        return Err(TransferError::Validation(
            "currency must be a 3-letter code".into(),
        ));
    }
    if request.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(TransferError::Validation(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    if request.reference_id.chars().count() > MAX_REFERENCE_LEN {
        return Err(TransferError::Validation(format!(
            "reference_id exceeds {} characters",
            MAX_REFERENCE_LEN
        )));
    }
    if request.request_id.is_empty() {
        return Err(TransferError::Validation("request_id is required".into()));
    }
    Ok(())
}
