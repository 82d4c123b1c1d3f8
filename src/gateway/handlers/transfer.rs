//! Transfer handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};

use super::super::state::AppState;
use super::super::types::{
    ApiError, CancelBody, CancelResponse, ErrorBody, TransferBody, TransferResponse,
    TransferStatusResponse, ValidatedJson,
};
use crate::transfer::{TransferCommand, TransferError, TransferResult, TransferStatus};

const DEFAULT_FAILURE_CODE: &str = "TRANSFER_FAILED";

/// Execute a transfer
///
/// Starts the saga or attaches to the one already running for `request_id`.
/// With `wait_for_completion` the call blocks until a terminal status or the
/// sync wait bound; the saga keeps running after a 504.
#[utoipa::path(
    post,
    path = "/transfer",
    request_body = TransferBody,
    responses(
        (status = 200, description = "Accepted or completed", body = TransferResponse),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 409, description = "request_id reused with a different payload", body = ErrorBody),
        (status = 422, description = "Transfer failed", body = ErrorBody),
        (status = 503, description = "Engine unavailable", body = ErrorBody),
        (status = 504, description = "Sync wait timed out", body = ErrorBody)
    ),
    tag = "Transfer"
)]
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    ValidatedJson(body): ValidatedJson<TransferBody>,
) -> Result<Json<TransferResponse>, ApiError> {
    let wait_for_completion = body.wait_for_completion;
    let command = TransferCommand {
        request: body.into_request(),
        wait_for_completion,
    };

    let result = state.orchestrator.execute_transfer(command).await?;

    if result.wait_timed_out {
        let message = result.message.clone().unwrap_or_default();
        return Err(with_result(TransferError::SyncWaitTimeout(message), result));
    }

    if result.status == TransferStatus::Failed {
        let code = result
            .error_code
            .clone()
            .unwrap_or_else(|| DEFAULT_FAILURE_CODE.to_string());
        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| "transfer failed".to_string());
        return Err(with_result(TransferError::Business { code, message }, result));
    }

    Ok(Json(result.into()))
}

/// Error response carrying the transfer projection in `details`
fn with_result(err: TransferError, result: TransferResult) -> ApiError {
    let api = ApiError::from(err);
    match serde_json::to_value(TransferResponse::from(result)) {
        Ok(details) => api.with_details(details),
        Err(_) => api,
    }
}

/// Transfer status
#[utoipa::path(
    get,
    path = "/transfer/{transaction_id}",
    params(("transaction_id" = String, Path, description = "Transfer id")),
    responses(
        (status = 200, description = "Current status", body = TransferStatusResponse),
        (status = 404, description = "Unknown transfer", body = ErrorBody)
    ),
    tag = "Transfer"
)]
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransferStatusResponse>, ApiError> {
    let status = state
        .orchestrator
        .get_transfer_status(&transaction_id)
        .await?;
    Ok(Json(status.into()))
}

/// Request cancellation
///
/// `success=false` when the transfer is already terminal.
#[utoipa::path(
    post,
    path = "/transfer/{transaction_id}/cancel",
    params(("transaction_id" = String, Path, description = "Transfer id")),
    request_body = CancelBody,
    responses(
        (status = 200, description = "Cancel acknowledged", body = CancelResponse),
        (status = 404, description = "Unknown transfer", body = ErrorBody)
    ),
    tag = "Transfer"
)]
pub async fn cancel_transfer(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
    ValidatedJson(body): ValidatedJson<CancelBody>,
) -> Result<Json<CancelResponse>, ApiError> {
    let reason = body.reason.unwrap_or_default();
    let ack = state
        .orchestrator
        .cancel_transfer(&transaction_id, &reason)
        .await?;
    Ok(Json(ack.into()))
}
