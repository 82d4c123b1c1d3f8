//! Engine RPC
//!
//! Typed request/response frames between the orchestrator and the saga
//! engine. Frames travel over an mpsc channel; each carries a oneshot
//! responder for its reply.
//!
//! ```text
//! EngineClient ──mpsc──► serve() ──spawn──► SagaEngine
//!      ▲                                        │
//!      └───────────────── oneshot ──────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::engine::{CancelOutcome, SagaEngine};
use super::error::TransferError;
use super::state::{SagaPhase, SagaState, TransferStatus};
use super::types::{TransferId, TransferRequest};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTransferRequest {
    pub from_account: String,
    pub to_account: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub reference_id: String,
    pub request_id: String,
}

impl From<ExecuteTransferRequest> for TransferRequest {
    fn from(r: ExecuteTransferRequest) -> Self {
        TransferRequest {
            from_account: r.from_account,
            to_account: r.to_account,
            amount: r.amount,
            currency: r.currency,
            description: r.description,
            reference_id: r.reference_id,
            request_id: r.request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTransferResponse {
    pub transaction_id: String,
    pub status: TransferStatus,
    pub workflow_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// false when the request attached to an existing saga
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
    /// Internal saga phase
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTransferStatusResponse {
    pub transaction_id: String,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub workflow_execution: WorkflowExecution,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_applied: bool,
}

impl From<&SagaState> for GetTransferStatusResponse {
    fn from(s: &SagaState) -> Self {
        Self {
            transaction_id: s.transfer_id.to_string(),
            status: s.status(),
            created_at: s.started_at,
            completed_at: s.completed_at,
            workflow_execution: WorkflowExecution {
                workflow_id: s.workflow_id.clone(),
                run_id: s.run_id.clone(),
                status: s.phase.as_str().to_string(),
            },
            error_code: s.error_code.clone(),
            error_message: s.error_message.clone(),
            compensation_applied: s.compensation_applied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransferResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub serving: bool,
    pub running_sagas: usize,
    pub detail: Option<String>,
}

/// One request frame
#[derive(Debug)]
pub enum EngineRequest {
    Execute {
        request: ExecuteTransferRequest,
        reply: oneshot::Sender<Result<ExecuteTransferResponse, TransferError>>,
    },
    GetStatus {
        transaction_id: String,
        reply: oneshot::Sender<Result<GetTransferStatusResponse, TransferError>>,
    },
    Cancel {
        transaction_id: String,
        reason: String,
        reply: oneshot::Sender<Result<CancelTransferResponse, TransferError>>,
    },
    Health {
        reply: oneshot::Sender<HealthResponse>,
    },
}

// ============================================================================
// Client
// ============================================================================

/// Sender side, cheap to clone
#[derive(Clone)]
pub struct EngineClient {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineClient {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, TransferError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| TransferError::ServiceUnavailable("engine channel closed".into()))?;
        response
            .await
            .map_err(|_| TransferError::ServiceUnavailable("engine dropped the request".into()))
    }

    pub async fn execute(
        &self,
        request: ExecuteTransferRequest,
    ) -> Result<ExecuteTransferResponse, TransferError> {
        self.call(|reply| EngineRequest::Execute { request, reply })
            .await?
    }

    pub async fn get_status(
        &self,
        transaction_id: &str,
    ) -> Result<GetTransferStatusResponse, TransferError> {
        let transaction_id = transaction_id.to_string();
        self.call(|reply| EngineRequest::GetStatus {
            transaction_id,
            reply,
        })
        .await?
    }

    pub async fn cancel(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<CancelTransferResponse, TransferError> {
        let (transaction_id, reason) = (transaction_id.to_string(), reason.to_string());
        self.call(|reply| EngineRequest::Cancel {
            transaction_id,
            reason,
            reply,
        })
        .await?
    }

    pub async fn health(&self) -> Result<HealthResponse, TransferError> {
        self.call(|reply| EngineRequest::Health { reply }).await
    }
}

/// Receiver side, owned by [`serve`]
pub struct EngineReceiver {
    rx: mpsc::Receiver<EngineRequest>,
}

impl EngineReceiver {
    pub async fn recv(&mut self) -> Option<EngineRequest> {
        self.rx.recv().await
    }
}

/// Create a new engine channel pair
pub fn engine_channel(buffer: usize) -> (EngineClient, EngineReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EngineClient { tx }, EngineReceiver { rx })
}

// ============================================================================
// Server
// ============================================================================

/// Dispatch frames until every client is dropped
pub async fn serve(engine: Arc<SagaEngine>, mut receiver: EngineReceiver) {
    while let Some(request) = receiver.recv().await {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { dispatch(&engine, request).await });
    }
    debug!("Engine channel closed, RPC server stopping");
}

async fn dispatch(engine: &Arc<SagaEngine>, request: EngineRequest) {
    // Reply errors mean the caller went away
    match request {
        EngineRequest::Execute { request, reply } => {
            let _ = reply.send(execute(engine, request).await);
        }
        EngineRequest::GetStatus {
            transaction_id,
            reply,
        } => {
            let _ = reply.send(get_status(engine, &transaction_id).await);
        }
        EngineRequest::Cancel {
            transaction_id,
            reason,
            reply,
        } => {
            let _ = reply.send(cancel(engine, &transaction_id, &reason).await);
        }
        EngineRequest::Health { reply } => {
            let _ = reply.send(health(engine).await);
        }
    }
}

fn parse_id(transaction_id: &str) -> Result<TransferId, TransferError> {
    transaction_id
        .parse()
        .map_err(|_| TransferError::TransferNotFound(transaction_id.to_string()))
}

async fn execute(
    engine: &Arc<SagaEngine>,
    request: ExecuteTransferRequest,
) -> Result<ExecuteTransferResponse, TransferError> {
    let started = engine.start(request.into()).await?;
    let state = &started.state;
    Ok(ExecuteTransferResponse {
        transaction_id: state.transfer_id.to_string(),
        status: state.status(),
        workflow_id: state.workflow_id.clone(),
        run_id: started.run_id.clone(),
        created_at: state.started_at,
        created: started.created,
    })
}

async fn get_status(
    engine: &SagaEngine,
    transaction_id: &str,
) -> Result<GetTransferStatusResponse, TransferError> {
    let id = parse_id(transaction_id)?;
    let state = engine.status(&id).await?;
    let mut response = GetTransferStatusResponse::from(&state);
    if let Some(run_id) = engine.current_run(&id) {
        response.workflow_execution.run_id = run_id;
    }
    Ok(response)
}

async fn cancel(
    engine: &Arc<SagaEngine>,
    transaction_id: &str,
    reason: &str,
) -> Result<CancelTransferResponse, TransferError> {
    let id = parse_id(transaction_id)?;
    Ok(match engine.cancel(id, reason).await? {
        CancelOutcome::Accepted(state) => CancelTransferResponse {
            success: true,
            message: cancel_ack(state.phase),
        },
        CancelOutcome::AlreadyTerminal(state) => CancelTransferResponse {
            success: false,
            message: format!("transfer already {}", state.status()),
        },
    })
}

/// Cancellation is best effort: a ledger posting already in flight finishes
fn cancel_ack(phase: SagaPhase) -> String {
    match phase {
        SagaPhase::Debiting | SagaPhase::Crediting => format!(
            "cancel requested in {}; best effort: the in-flight ledger posting finishes and may still complete the transfer",
            phase
        ),
        _ => format!(
            "cancel requested in {}; best effort: poll status for the final outcome",
            phase
        ),
    }
}

async fn health(engine: &SagaEngine) -> HealthResponse {
    match engine.ping().await {
        Ok(()) => HealthResponse {
            serving: true,
            running_sagas: engine.running_count(),
            detail: None,
        },
        Err(e) => {
            warn!(error = %e, "Engine health check failed");
            HealthResponse {
                serving: false,
                running_sagas: engine.running_count(),
                detail: Some(e.to_string()),
            }
        }
    }
}
