//! Gateway request/response DTOs and the unified error body
//!
//! - [`ApiError`]: every non-2xx response is `{error, code, details?}`
//! - [`ValidatedJson`]: JSON extractor that runs `validator` rules before the handler
//! - Request bodies: [`TransferBody`], [`CancelBody`]
//! - Response bodies mirroring the orchestrator results

use axum::{
    Json,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::compensation::{AuditError, CompensationAudit, CompensationStats};
use crate::transfer::rpc::{CancelTransferResponse, GetTransferStatusResponse};
use crate::transfer::{ExecuteTransferRequest, TransferError, TransferResult};

pub const MALFORMED_REQUEST: &str = "MALFORMED_REQUEST";

// ============================================================================
// Errors
// ============================================================================

/// Error response body
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Human readable message
    #[schema(example = "Transfer not found: 0d4c...")]
    pub error: String,
    /// Stable error code
    #[schema(example = "TRANSFER_NOT_FOUND")]
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                code: code.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.body.details = Some(details);
        self
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        ApiError::new(status, e.code(), e.to_string())
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        TransferError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = %self.body.code, error = %self.body.error, "Request failed");
        }
        (self.status, Json(self.body)).into_response()
    }
}

// ============================================================================
// ValidatedJson: Axum Framework Integration
// ============================================================================

/// JSON body that already passed its `validator` rules.
///
/// Malformed JSON and rule violations are both rejected with 400 before the
/// handler runs.
#[derive(Debug)]
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value): Json<T> = Json::from_request(req, state).await.map_err(|e| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                MALFORMED_REQUEST,
                format!("Invalid JSON: {}", e.body_text()),
            )
        })?;

        value.validate().map_err(|errors| {
            let err = ApiError::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "request validation failed",
            );
            match serde_json::to_value(&errors) {
                Ok(details) => err.with_details(details),
                Err(_) => err,
            }
        })?;

        Ok(ValidatedJson(value))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Transfer request body
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct TransferBody {
    #[validate(length(equal = 12))]
    #[schema(example = "100000000001")]
    pub from_account: String,
    #[validate(length(equal = 12))]
    #[schema(example = "100000000002")]
    pub to_account: String,
    /// Minor units
    #[validate(range(min = 1, max = 1_000_000_000))]
    #[schema(example = 2500)]
    pub amount: i64,
    #[validate(length(equal = 3))]
    #[schema(example = "USD")]
    pub currency: String,
    #[validate(length(max = 100))]
    pub description: Option<String>,
    #[validate(length(max = 50))]
    pub reference_id: Option<String>,
    /// Idempotency key; generated when absent
    pub request_id: Option<String>,
    /// Block until a terminal status or the sync wait bound
    #[serde(default)]
    pub wait_for_completion: bool,
}

impl TransferBody {
    /// Engine request; `request_id` falls back to a fresh ULID
    pub fn into_request(self) -> ExecuteTransferRequest {
        let request_id = self
            .request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        ExecuteTransferRequest {
            from_account: self.from_account,
            to_account: self.to_account,
            amount: self.amount,
            currency: self.currency,
            description: self.description.unwrap_or_default(),
            reference_id: self.reference_id.unwrap_or_default(),
            request_id,
        }
    }
}

/// Cancel request body
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CancelBody {
    #[validate(length(max = 200))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct PendingQuery {
    /// Max records (default 50, capped at 500)
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct StatsQuery {
    /// Window in seconds (default 24h)
    pub window_secs: Option<u64>,
}

// ============================================================================
// Responses
// ============================================================================

/// Transfer execution result
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferResponse {
    #[schema(example = "0d4c2f6e-6a4b-5c7e-9a61-0b1c2d3e4f50")]
    pub transaction_id: String,
    /// PENDING | PROCESSING | COMPLETED | FAILED | CANCELLED
    #[schema(example = "COMPLETED")]
    pub status: String,
    pub workflow_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<TransferResult> for TransferResponse {
    fn from(r: TransferResult) -> Self {
        Self {
            transaction_id: r.transaction_id,
            status: r.status.as_str().to_string(),
            workflow_id: r.workflow_id,
            run_id: r.run_id,
            created_at: r.created_at,
            completed_at: r.completed_at,
            error_code: r.error_code,
            error_message: r.error_message,
            compensation_applied: r.compensation_applied,
            message: r.message,
        }
    }
}

/// Transfer status projection
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferStatusResponse {
    pub transaction_id: String,
    #[schema(example = "PROCESSING")]
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub workflow_id: String,
    pub run_id: String,
    /// Internal saga phase
    #[schema(example = "Crediting")]
    pub phase: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_applied: bool,
}

impl From<GetTransferStatusResponse> for TransferStatusResponse {
    fn from(s: GetTransferStatusResponse) -> Self {
        Self {
            transaction_id: s.transaction_id,
            status: s.status.as_str().to_string(),
            created_at: s.created_at,
            completed_at: s.completed_at,
            workflow_id: s.workflow_execution.workflow_id,
            run_id: s.workflow_execution.run_id,
            phase: s.workflow_execution.status,
            error_code: s.error_code,
            error_message: s.error_message,
            compensation_applied: s.compensation_applied,
        }
    }
}

/// Cancel acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelResponse {
    pub success: bool,
    #[schema(example = "cancel requested in CREDITING; best effort: the in-flight ledger posting finishes and may still complete the transfer")]
    pub message: String,
}

impl From<CancelTransferResponse> for CancelResponse {
    fn from(r: CancelTransferResponse) -> Self {
        Self {
            success: r.success,
            message: r.message,
        }
    }
}

/// Compensation audit record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompensationView {
    #[schema(example = "comp_01J9Z3K8W6Q2V4X7Y5T0R1S2P3")]
    pub id: String,
    pub transfer_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub original_transaction_id: String,
    pub compensation_transaction_id: Option<String>,
    pub reason: String,
    #[schema(example = "debit_reversal")]
    pub compensation_type: String,
    #[schema(example = "pending")]
    pub status: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub timeout_duration_ms: Option<i64>,
}

impl From<CompensationAudit> for CompensationView {
    fn from(a: CompensationAudit) -> Self {
        Self {
            id: a.id,
            transfer_id: a.transfer_id.to_string(),
            workflow_id: a.workflow_id,
            run_id: a.run_id,
            original_transaction_id: a.original_debit_tx_id,
            compensation_transaction_id: a.compensation_tx_id,
            reason: a.reason,
            compensation_type: a.compensation_type.as_str().to_string(),
            status: a.status.as_str().to_string(),
            attempts: a.attempts,
            created_at: a.created_at,
            updated_at: a.updated_at,
            completed_at: a.completed_at,
            failure_reason: a.failure_reason,
            timeout_duration_ms: a.timeout_duration_ms,
        }
    }
}

/// Compensation aggregates over a window
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompensationStatsView {
    pub window_secs: u64,
    pub total: u64,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub manual_required: u64,
    #[schema(example = 0.98)]
    pub success_rate: f64,
    pub avg_attempts: f64,
}

impl From<CompensationStats> for CompensationStatsView {
    fn from(s: CompensationStats) -> Self {
        Self {
            window_secs: s.window_secs,
            total: s.total,
            pending: s.pending,
            completed: s.completed,
            failed: s.failed,
            timeout: s.timeout,
            manual_required: s.manual_required,
            success_rate: s.success_rate,
            avg_attempts: s.avg_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> TransferBody {
        TransferBody {
            from_account: "100000000001".into(),
            to_account: "100000000002".into(),
            amount: 100,
            currency: "USD".into(),
            description: None,
            reference_id: Some("INV-1".into()),
            request_id: None,
            wait_for_completion: false,
        }
    }

    #[test]
    fn test_transfer_body_rules() {
        assert!(body().validate().is_ok());

        let mut b = body();
        b.from_account = "1234".into();
        assert!(b.validate().is_err());

        let mut b = body();
        b.amount = 0;
        assert!(b.validate().is_err());

        let mut b = body();
        b.amount = 1_000_000_001;
        assert!(b.validate().is_err());

        let mut b = body();
        b.currency = "US".into();
        assert!(b.validate().is_err());

        let mut b = body();
        b.description = Some("d".repeat(101));
        assert!(b.validate().is_err());

        let mut b = body();
        b.reference_id = Some("r".repeat(51));
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_request_id_generated_when_absent() {
        let a = body().into_request();
        let b = body().into_request();
        assert_eq!(a.request_id.len(), 26);
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.description, "");
        assert_eq!(a.reference_id, "INV-1");

        let mut blank = body();
        blank.request_id = Some("  ".into());
        assert_eq!(blank.into_request().request_id.len(), 26);

        let mut given = body();
        given.request_id = Some("req-7".into());
        assert_eq!(given.into_request().request_id, "req-7");
    }

    #[test]
    fn test_wait_flag_defaults_false() {
        let b: TransferBody = serde_json::from_str(
            r#"{"from_account":"100000000001","to_account":"100000000002","amount":5,"currency":"EUR"}"#,
        )
        .unwrap();
        assert!(!b.wait_for_completion);
        assert!(b.request_id.is_none());
    }

    #[test]
    fn test_transfer_error_mapping() {
        let err = ApiError::from(TransferError::TransferNotFound("x".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.body.code, "TRANSFER_NOT_FOUND");

        let err = ApiError::from(TransferError::ServiceUnavailable("down".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::from(TransferError::RequestConflict("r".into()));
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_body_omits_empty_details() {
        let err = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "bad");
        let json = serde_json::to_value(&err.body).unwrap();
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert!(json.get("details").is_none());
    }
}
