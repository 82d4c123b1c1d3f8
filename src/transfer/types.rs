//! Transfer identifiers, requests and step records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::AttemptOutcome;

/// Namespace for deriving transfer ids from client request ids
const TRANSFER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_4b0d_5c39_9e83_27a4_d1f6_08bb);

/// Saga identity, derived from the client's request id
///
/// The same `request_id` always maps to the same `TransferId`, so a resubmitted
/// request attaches to the existing saga instead of starting a second one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn from_request_id(request_id: &str) -> Self {
        TransferId(Uuid::new_v5(&TRANSFER_NAMESPACE, request_id.as_bytes()))
    }

    /// Random id, for requests that carry no usable request id
    pub fn fresh() -> Self {
        TransferId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Stable workflow identity
    pub fn workflow_id(&self) -> String {
        format!("transfer-{}", self.0)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TransferId)
    }
}

/// Transfer submitted by a client
///
/// Currency is kept as the raw code; the engine rejects unknown codes during
/// validation so the rejection lands in the saga log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account: String,
    pub to_account: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub reference_id: String,
    pub request_id: String,
}

/// Participant-facing steps of the saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStep {
    CheckBalance,
    Debit,
    Credit,
    CompensateDebit,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::CheckBalance => "CheckBalance",
            SagaStep::Debit => "Debit",
            SagaStep::Credit => "Credit",
            SagaStep::CompensateDebit => "CompensateDebit",
        }
    }

    fn key_suffix(&self) -> &'static str {
        match self {
            SagaStep::CheckBalance => "check",
            SagaStep::Debit => "debit",
            SagaStep::Credit => "credit",
            SagaStep::CompensateDebit => "compensate",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of participant idempotency keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    /// `{request_id}-{step}`
    #[default]
    Plain,
    /// `{request_id}_{transfer_id}_{step}`
    Scoped,
}

impl KeyScheme {
    /// Stable per (request, step): identical across retries and restarts
    pub fn idempotency_key(&self, request_id: &str, transfer_id: &TransferId, step: SagaStep) -> String {
        match self {
            KeyScheme::Plain => format!("{}-{}", request_id, step.key_suffix()),
            KeyScheme::Scoped => format!("{}_{}_{}", request_id, transfer_id, step.key_suffix()),
        }
    }
}

/// One attempt of one step, as persisted in the saga log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub step: SagaStep,
    pub attempt_number: u32,
    pub idempotency_key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_code: Option<String>,
    pub error: Option<String>,
    /// Participant transaction id, set on success
    pub tx_id: Option<String>,
}
