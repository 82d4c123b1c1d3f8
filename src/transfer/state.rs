//! Saga FSM State Definitions
//!
//! The saga is event-sourced: `SagaState` is never written directly, only
//! rebuilt by applying `SagaEvent`s in log order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{SagaStep, StepAttempt, TransferId, TransferRequest};

/// Internal saga phase
///
/// Phase IDs are stable for storage. Terminal: COMPLETED (40), FAILED (-10),
/// CANCELLED (-40).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum SagaPhase {
    /// Created, not yet validated
    New = 0,
    Validating = 5,
    /// Balance check in progress
    Checking = 10,
    /// Debit initiated (persist-before-call)
    Debiting = 20,
    /// Debit confirmed, credit initiated. Funds are in flight.
    Crediting = 30,
    /// Terminal: both legs applied
    Completed = 40,
    /// Terminal
    Failed = -10,
    /// Reversing the debit
    Compensating = -20,
    /// Cancel accepted, deciding whether a reversal is needed
    Cancelling = -30,
    /// Terminal
    Cancelled = -40,
}

impl SagaPhase {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaPhase::Completed | SagaPhase::Failed | SagaPhase::Cancelled
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SagaPhase::New),
            5 => Some(SagaPhase::Validating),
            10 => Some(SagaPhase::Checking),
            20 => Some(SagaPhase::Debiting),
            30 => Some(SagaPhase::Crediting),
            40 => Some(SagaPhase::Completed),
            -10 => Some(SagaPhase::Failed),
            -20 => Some(SagaPhase::Compensating),
            -30 => Some(SagaPhase::Cancelling),
            -40 => Some(SagaPhase::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaPhase::New => "NEW",
            SagaPhase::Validating => "VALIDATING",
            SagaPhase::Checking => "CHECKING",
            SagaPhase::Debiting => "DEBITING",
            SagaPhase::Crediting => "CREDITING",
            SagaPhase::Completed => "COMPLETED",
            SagaPhase::Failed => "FAILED",
            SagaPhase::Compensating => "COMPENSATING",
            SagaPhase::Cancelling => "CANCELLING",
            SagaPhase::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// External transfer status (wire enum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum TransferStatus {
    Unspecified = 0,
    Pending = 1,
    Processing = 2,
    Completed = 3,
    Failed = 4,
    /// Accepted on decode only; the engine reports FAILED + compensation_applied
    Compensated = 5,
    Cancelled = 6,
}

impl TransferStatus {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(TransferStatus::Unspecified),
            1 => Some(TransferStatus::Pending),
            2 => Some(TransferStatus::Processing),
            3 => Some(TransferStatus::Completed),
            4 => Some(TransferStatus::Failed),
            5 => Some(TransferStatus::Compensated),
            6 => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Unspecified => "UNSPECIFIED",
            TransferStatus::Pending => "PENDING",
            TransferStatus::Processing => "PROCESSING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Compensated => "COMPENSATED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Compensated
                | TransferStatus::Cancelled
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SagaPhase> for TransferStatus {
    fn from(phase: SagaPhase) -> Self {
        match phase {
            SagaPhase::New | SagaPhase::Validating => TransferStatus::Pending,
            SagaPhase::Checking
            | SagaPhase::Debiting
            | SagaPhase::Crediting
            | SagaPhase::Compensating
            | SagaPhase::Cancelling => TransferStatus::Processing,
            SagaPhase::Completed => TransferStatus::Completed,
            SagaPhase::Failed => TransferStatus::Failed,
            SagaPhase::Cancelled => TransferStatus::Cancelled,
        }
    }
}

/// Why a debit is being reversed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationCause {
    CreditFailed,
    Cancelled,
    WorkflowTimeout,
}

impl CompensationCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationCause::CreditFailed => "credit_failed",
            CompensationCause::Cancelled => "cancelled",
            CompensationCause::WorkflowTimeout => "workflow_timeout",
        }
    }
}

/// Saga log entry payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SagaEvent {
    Created {
        request: TransferRequest,
    },
    RunStarted {
        run_id: String,
    },
    PhaseChanged {
        phase: SagaPhase,
    },
    StepRecorded {
        attempt: StepAttempt,
    },
    Debited {
        tx_id: String,
    },
    Credited {
        tx_id: String,
    },
    CompensationStarted {
        cause: CompensationCause,
        reason: String,
    },
    AuditOpened {
        audit_id: String,
    },
    Compensated {
        tx_id: String,
    },
    CancelRequested {
        reason: String,
    },
    Finished {
        phase: SagaPhase,
        error_code: Option<String>,
        error_message: Option<String>,
    },
}

/// Saga log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEnvelope {
    pub transfer_id: TransferId,
    pub at: DateTime<Utc>,
    pub event: SagaEvent,
}

impl SagaEnvelope {
    pub fn now(transfer_id: TransferId, event: SagaEvent) -> Self {
        Self {
            transfer_id,
            at: Utc::now(),
            event,
        }
    }
}

/// Durable saga state, rebuilt from the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub transfer_id: TransferId,
    pub workflow_id: String,
    pub run_id: String,
    pub request: TransferRequest,
    pub phase: SagaPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_applied: bool,
    pub debit_tx_id: Option<String>,
    pub credit_tx_id: Option<String>,
    pub compensation_tx_id: Option<String>,
    pub cancel_reason: Option<String>,
    pub compensation_cause: Option<CompensationCause>,
    pub compensation_reason: Option<String>,
    pub audit_id: Option<String>,
    pub step_log: Vec<StepAttempt>,
}

impl SagaState {
    fn created(transfer_id: TransferId, request: TransferRequest, at: DateTime<Utc>) -> Self {
        Self {
            transfer_id,
            workflow_id: transfer_id.workflow_id(),
            run_id: String::new(),
            request,
            phase: SagaPhase::New,
            started_at: at,
            updated_at: at,
            completed_at: None,
            error_code: None,
            error_message: None,
            compensation_applied: false,
            debit_tx_id: None,
            credit_tx_id: None,
            compensation_tx_id: None,
            cancel_reason: None,
            compensation_cause: None,
            compensation_reason: None,
            audit_id: None,
            step_log: Vec::new(),
        }
    }

    /// Rebuild from an ordered event stream. None if the stream has no `Created`.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a SagaEnvelope>) -> Option<Self> {
        let mut state: Option<SagaState> = None;
        for env in events {
            if let Some(s) = state.as_mut() {
                s.apply(env);
                continue;
            }
            if let SagaEvent::Created { request } = &env.event {
                state = Some(SagaState::created(env.transfer_id, request.clone(), env.at));
            }
        }
        state
    }

    /// Apply one event
    ///
    /// A terminal phase is final: later phase events are ignored.
    pub fn apply(&mut self, env: &SagaEnvelope) {
        self.updated_at = env.at;
        match &env.event {
            SagaEvent::Created { .. } => {}
            SagaEvent::RunStarted { run_id } => self.run_id = run_id.clone(),
            SagaEvent::PhaseChanged { phase } => {
                if !self.phase.is_terminal() {
                    self.phase = *phase;
                }
            }
            SagaEvent::StepRecorded { attempt } => self.step_log.push(attempt.clone()),
            SagaEvent::Debited { tx_id } => {
                self.debit_tx_id = Some(tx_id.clone());
                self.tag_last_success(SagaStep::Debit, tx_id);
            }
            SagaEvent::Credited { tx_id } => {
                self.credit_tx_id = Some(tx_id.clone());
                self.tag_last_success(SagaStep::Credit, tx_id);
            }
            SagaEvent::CompensationStarted { cause, reason } => {
                if !self.phase.is_terminal() {
                    self.phase = SagaPhase::Compensating;
                }
                self.compensation_cause = Some(*cause);
                self.compensation_reason = Some(reason.clone());
            }
            SagaEvent::AuditOpened { audit_id } => self.audit_id = Some(audit_id.clone()),
            SagaEvent::Compensated { tx_id } => {
                self.compensation_tx_id = Some(tx_id.clone());
                self.compensation_applied = true;
                self.tag_last_success(SagaStep::CompensateDebit, tx_id);
            }
            SagaEvent::CancelRequested { reason } => {
                if self.cancel_reason.is_none() {
                    self.cancel_reason = Some(reason.clone());
                }
            }
            SagaEvent::Finished {
                phase,
                error_code,
                error_message,
            } => {
                if !self.phase.is_terminal() {
                    self.phase = *phase;
                    self.error_code = error_code.clone();
                    self.error_message = error_message.clone();
                    self.completed_at = Some(env.at);
                }
            }
        }
    }

    fn tag_last_success(&mut self, step: SagaStep, tx_id: &str) {
        if let Some(a) = self.step_log.iter_mut().rev().find(|a| a.step == step) {
            a.tx_id = Some(tx_id.to_string());
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.phase.into()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Debit applied and not reversed
    pub fn has_outstanding_debit(&self) -> bool {
        self.debit_tx_id.is_some() && !self.compensation_applied
    }
}
