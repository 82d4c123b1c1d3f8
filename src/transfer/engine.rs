//! Saga Engine
//!
//! Drives each transfer through the saga FSM, one task per transfer.
//!
//! # Driver
//!
//! Every boundary reloads the folded state from the [`SagaStore`] and decides
//! the next step from the persisted phase alone, so a crashed run resumes from
//! exactly where the log stops:
//!
//! ```text
//! NEW → VALIDATING → CHECKING → DEBITING → CREDITING → COMPLETED
//!                                   │          └──► COMPENSATING → FAILED (+compensation_applied)
//! any non-terminal ──cancel──► CANCELLING ──► COMPENSATING (if debited) → CANCELLED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: the phase is appended before the participant call
//! 2. **Single Writer**: at most one run per transfer id in this process
//! 3. **No Silent Loss**: an outstanding debit never reaches a terminal phase
//!    without a compensation audit record

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::error::TransferError;
use super::state::{CompensationCause, SagaEvent, SagaPhase, SagaState};
use super::store::SagaStore;
use super::types::{KeyScheme, SagaStep, StepAttempt, TransferId, TransferRequest};
use crate::activity::{
    ActivityFailure, ActivityOptions, ActivityOutcome, ActivityRuntime, AttemptContext,
    AttemptOutcome, AttemptRecorder, AttemptReport, CancelHandle, CancelSignal, FailureKind,
};
use crate::compensation::{
    CompensationAudit, CompensationAuditStore, CompensationStatus, CompensationType,
    CompensationUpdate, NewCompensation,
};
use crate::currency::Currency;
use crate::ledger::{LedgerError, LedgerParticipant, LedgerReceipt, Posting, Reversal};
use crate::metrics::SagaMetrics;

pub const WORKFLOW_TIMEOUT: &str = "WORKFLOW_TIMEOUT";
pub const COMPENSATION_FAILED: &str = "COMPENSATION_FAILED";
pub const COMPENSATION_TIMEOUT: &str = "COMPENSATION_TIMEOUT";
pub const CREDIT_FAILED: &str = "CREDIT_FAILED";

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// End-to-end bound, measured from `started_at` across restarts
    pub execution_timeout: Duration,
    /// Bound for a single run
    pub run_timeout: Duration,
    pub key_scheme: KeyScheme,
    pub check_options: ActivityOptions,
    pub debit_options: ActivityOptions,
    pub credit_options: ActivityOptions,
    pub compensate_options: ActivityOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_activity_options(ActivityOptions::default())
    }
}

impl EngineConfig {
    /// Same options for every step. Ledger-mutating steps always let the
    /// in-flight attempt finish on cancel.
    pub fn with_activity_options(options: ActivityOptions) -> Self {
        let mutating = options.clone().with_abandon_on_cancel(false);
        Self {
            execution_timeout: Duration::from_secs(10 * 60),
            run_timeout: Duration::from_secs(5 * 60),
            key_scheme: KeyScheme::default(),
            check_options: options,
            debit_options: mutating.clone(),
            credit_options: mutating.clone(),
            compensate_options: mutating,
        }
    }

    pub fn options_for(&self, step: SagaStep) -> &ActivityOptions {
        match step {
            SagaStep::CheckBalance => &self.check_options,
            SagaStep::Debit => &self.debit_options,
            SagaStep::Credit => &self.credit_options,
            SagaStep::CompensateDebit => &self.compensate_options,
        }
    }
}

/// Result of [`SagaEngine::start`]
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub state: SagaState,
    /// false when the call attached to an existing saga
    pub created: bool,
    /// Run driving the saga, or the last run of a finished one
    pub run_id: String,
}

/// Result of [`SagaEngine::cancel`]
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Accepted(SagaState),
    AlreadyTerminal(SagaState),
}

struct RunningSaga {
    run_id: String,
    cancel: CancelHandle,
}

/// Per-run driver context
struct Run {
    deadline: Instant,
    /// Which wall-clock bound `deadline` comes from
    bound: &'static str,
    stop: CancelSignal,
    /// step_log length when this run started
    baseline: usize,
}

/// Registration of a live run. Dropping it frees the slot so recovery can
/// resume the saga, including when the run task panicked.
struct RunGuard<'a> {
    engine: &'a SagaEngine,
    transfer_id: TransferId,
    run_id: &'a str,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn enter(engine: &'a SagaEngine, transfer_id: TransferId, run_id: &'a str) -> Self {
        engine.metrics.run_entered();
        Self {
            engine,
            transfer_id,
            run_id,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                transfer_id = %self.transfer_id,
                run_id = %self.run_id,
                "Saga run ended abnormally, left for recovery"
            );
        }
        self.engine.metrics.run_exited();
        self.engine
            .running
            .remove_if(&self.transfer_id, |_, r| r.run_id == self.run_id);
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Interrupt {
    Cancel(String),
    Timeout(&'static str),
}

pub struct SagaEngine {
    store: Arc<dyn SagaStore>,
    audits: Arc<dyn CompensationAuditStore>,
    ledger: Arc<dyn LedgerParticipant>,
    runtime: Arc<ActivityRuntime>,
    metrics: Arc<SagaMetrics>,
    config: EngineConfig,
    running: DashMap<TransferId, RunningSaga>,
}

impl SagaEngine {
    pub fn new(
        store: Arc<dyn SagaStore>,
        audits: Arc<dyn CompensationAuditStore>,
        ledger: Arc<dyn LedgerParticipant>,
        runtime: Arc<ActivityRuntime>,
        metrics: Arc<SagaMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            audits,
            ledger,
            runtime,
            metrics,
            config,
            running: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SagaMetrics> {
        &self.metrics
    }

    pub fn audit_store(&self) -> &Arc<dyn CompensationAuditStore> {
        &self.audits
    }

    /// Start a saga, or attach to the one already registered for the request id
    ///
    /// An empty `request_id` gets a fresh transfer id; the saga then fails
    /// validation on its own log.
    pub async fn start(
        self: &Arc<Self>,
        request: TransferRequest,
    ) -> Result<StartOutcome, TransferError> {
        let transfer_id = if request.request_id.is_empty() {
            TransferId::fresh()
        } else {
            TransferId::from_request_id(&request.request_id)
        };

        let (state, created) = self.store.create_if_absent(transfer_id, &request).await?;
        if !created && state.request != request {
            warn!(transfer_id = %transfer_id, request_id = %request.request_id, "Request id reused with a different payload");
            return Err(TransferError::RequestConflict(request.request_id));
        }

        if created {
            self.metrics.saga_started();
            info!(
                transfer_id = %transfer_id,
                request_id = %request.request_id,
                amount = request.amount,
                currency = %request.currency,
                "Transfer saga created: {} -> {}", request.from_account, request.to_account
            );
        } else {
            debug!(transfer_id = %transfer_id, phase = %state.phase, "Attached to existing saga");
        }

        let mut run_id = state.run_id.clone();
        if !state.is_terminal() {
            self.ensure_running(transfer_id);
            if let Some(current) = self.current_run(&transfer_id) {
                run_id = current;
            }
        }
        Ok(StartOutcome {
            state,
            created,
            run_id,
        })
    }

    /// Current persisted state
    pub async fn status(&self, transfer_id: &TransferId) -> Result<SagaState, TransferError> {
        self.store
            .load(transfer_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))
    }

    /// Persist a cancel request and signal the running saga
    pub async fn cancel(
        self: &Arc<Self>,
        transfer_id: TransferId,
        reason: &str,
    ) -> Result<CancelOutcome, TransferError> {
        let state = self.status(&transfer_id).await?;
        if state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(state));
        }

        let reason = if reason.trim().is_empty() {
            "cancelled by client"
        } else {
            reason
        };
        let state = self
            .store
            .append(
                transfer_id,
                SagaEvent::CancelRequested {
                    reason: reason.to_string(),
                },
            )
            .await?;
        if state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(state));
        }
        info!(transfer_id = %transfer_id, phase = %state.phase, reason, "Cancel requested");

        let signalled = self
            .running
            .get(&transfer_id)
            .map(|r| r.cancel.cancel())
            .is_some();
        if !signalled {
            self.ensure_running(transfer_id);
        }
        Ok(CancelOutcome::Accepted(state))
    }

    /// Resume every non-terminal saga not already running
    pub async fn resume_all(self: &Arc<Self>) -> Result<usize, TransferError> {
        let mut resumed = 0;
        for state in self.store.non_terminal().await? {
            if self.ensure_running(state.transfer_id) {
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed non-terminal sagas");
        }
        Ok(resumed)
    }

    /// Resume idle non-terminal sagas untouched for longer than `threshold`
    pub async fn resume_stale(
        self: &Arc<Self>,
        threshold: Duration,
        batch_size: usize,
    ) -> Result<usize, TransferError> {
        let cutoff = crate::compensation::window_start(Utc::now(), threshold);
        let mut resumed = 0;
        for state in self.store.non_terminal().await? {
            if resumed >= batch_size {
                break;
            }
            if state.updated_at > cutoff || self.is_running(&state.transfer_id) {
                continue;
            }
            if self.ensure_running(state.transfer_id) {
                debug!(transfer_id = %state.transfer_id, phase = %state.phase, "Resuming stale saga");
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub fn is_running(&self, transfer_id: &TransferId) -> bool {
        self.running.contains_key(transfer_id)
    }

    /// Run id of the live run in this process
    pub fn current_run(&self, transfer_id: &TransferId) -> Option<String> {
        self.running.get(transfer_id).map(|r| r.run_id.clone())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Reachability of the saga store, audit store and ledger
    pub async fn ping(&self) -> Result<(), TransferError> {
        self.store.ping().await?;
        self.audits.ping().await?;
        self.ledger
            .ping()
            .await
            .map_err(|e| TransferError::ServiceUnavailable(format!("{}: {}", self.ledger.name(), e)))
    }

    /// Spawn a run unless one is registered. Returns whether a run was spawned.
    fn ensure_running(self: &Arc<Self>, transfer_id: TransferId) -> bool {
        let run_id = Ulid::new().to_string();
        let (handle, user_cancel) = CancelSignal::channel();
        match self.running.entry(transfer_id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(v) => {
                v.insert(RunningSaga {
                    run_id: run_id.clone(),
                    cancel: handle,
                });
            }
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let guard = RunGuard::enter(&engine, transfer_id, &run_id);
            match engine.drive(transfer_id, &run_id, user_cancel).await {
                Ok(state) if state.is_terminal() => {
                    debug!(transfer_id = %transfer_id, run_id = %run_id, status = %state.status(), "Saga run finished");
                }
                Ok(state) => {
                    warn!(transfer_id = %transfer_id, run_id = %run_id, phase = %state.phase, "Saga run stopped before a terminal phase");
                }
                Err(e) => {
                    error!(transfer_id = %transfer_id, run_id = %run_id, error = %e, "Saga run aborted");
                }
            }
            guard.finish();
        });
        true
    }

    async fn drive(
        &self,
        transfer_id: TransferId,
        run_id: &str,
        user_cancel: CancelSignal,
    ) -> Result<SagaState, TransferError> {
        let state = self.status(&transfer_id).await?;
        if state.is_terminal() {
            return Ok(state);
        }
        let state = self
            .store
            .append(
                transfer_id,
                SagaEvent::RunStarted {
                    run_id: run_id.to_string(),
                },
            )
            .await?;

        let (deadline, bound) = self.deadline_for(&state);
        let (stop_handle, stop) = CancelSignal::channel();
        let watcher = AbortOnDrop(tokio::spawn(async move {
            tokio::select! {
                _ = user_cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            stop_handle.cancel();
        }));

        let run = Run {
            deadline,
            bound,
            stop,
            baseline: state.step_log.len(),
        };
        debug!(transfer_id = %transfer_id, run_id, phase = %state.phase, "Saga run started");

        let result = self.run_to_end(transfer_id, &run).await;
        drop(watcher);
        result
    }

    fn deadline_for(&self, state: &SagaState) -> (Instant, &'static str) {
        let elapsed = (Utc::now() - state.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let execution_left = self.config.execution_timeout.saturating_sub(elapsed);
        let now = Instant::now();
        if execution_left <= self.config.run_timeout {
            (now + execution_left, "workflow_execution")
        } else {
            (now + self.config.run_timeout, "workflow_run")
        }
    }

    async fn run_to_end(
        &self,
        transfer_id: TransferId,
        run: &Run,
    ) -> Result<SagaState, TransferError> {
        loop {
            let state = self.status(&transfer_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            self.advance(state, run).await?;
        }
    }

    /// Execute one step from the persisted phase
    async fn advance(&self, state: SagaState, run: &Run) -> Result<SagaState, TransferError> {
        let interruptible = !matches!(
            state.phase,
            SagaPhase::Compensating | SagaPhase::Cancelling
        );
        if interruptible && let Some(interrupt) = Self::interrupt(&state, run) {
            return self.step_interrupted(state, interrupt, run).await;
        }

        match state.phase {
            SagaPhase::New => self.transition(state.transfer_id, SagaPhase::Validating).await,
            SagaPhase::Validating => self.step_validating(state).await,
            SagaPhase::Checking => self.step_checking(state, run).await,
            SagaPhase::Debiting => self.step_debiting(state, run).await,
            SagaPhase::Crediting => self.step_crediting(state, run).await,
            SagaPhase::Compensating => self.step_compensating(state).await,
            SagaPhase::Cancelling => self.step_cancelling(state).await,
            SagaPhase::Completed | SagaPhase::Failed | SagaPhase::Cancelled => Ok(state),
        }
    }

    fn interrupt(state: &SagaState, run: &Run) -> Option<Interrupt> {
        if let Some(reason) = &state.cancel_reason {
            return Some(Interrupt::Cancel(reason.clone()));
        }
        if Instant::now() >= run.deadline || run.stop.is_cancelled() {
            return Some(Interrupt::Timeout(run.bound));
        }
        None
    }

    // ========================================================================
    // Step handlers
    // ========================================================================

    async fn step_validating(&self, state: SagaState) -> Result<SagaState, TransferError> {
        match validate(&state.request) {
            Ok(_) => self.transition(state.transfer_id, SagaPhase::Checking).await,
            Err(e) => {
                warn!(transfer_id = %state.transfer_id, code = e.code(), error = %e, "Transfer rejected");
                self.finish(
                    state.transfer_id,
                    SagaPhase::Failed,
                    Some(e.code()),
                    Some(e.to_string()),
                )
                .await
            }
        }
    }

    async fn step_checking(&self, state: SagaState, run: &Run) -> Result<SagaState, TransferError> {
        let req = &state.request;
        let currency = request_currency(req)?;
        let key = self.idempotency_key(&state, SagaStep::CheckBalance);
        let ledger = self.ledger.as_ref();
        let account = req.from_account.as_str();
        let amount = req.amount;

        let outcome = self
            .call(&state, SagaStep::CheckBalance, &key, &run.stop, move |ctx| async move {
                ledger
                    .check_balance(account, amount, currency, &ctx.heartbeat)
                    .await
            })
            .await?;

        match outcome {
            ActivityOutcome::Completed(check) if check.sufficient_funds => {
                self.transition(state.transfer_id, SagaPhase::Debiting).await
            }
            ActivityOutcome::Completed(check) => {
                self.finish(
                    state.transfer_id,
                    SagaPhase::Failed,
                    Some(LedgerError::INSUFFICIENT_FUNDS),
                    Some(format!(
                        "Insufficient funds on account {}: balance={}, requested={}",
                        req.from_account, check.current_balance, req.amount
                    )),
                )
                .await
            }
            ActivityOutcome::Failed(f) if f.kind == FailureKind::Cancelled => Ok(state),
            ActivityOutcome::Failed(f) => {
                self.finish(
                    state.transfer_id,
                    SagaPhase::Failed,
                    Some(&failure_code(&f)),
                    Some(f.to_string()),
                )
                .await
            }
        }
    }

    async fn step_debiting(&self, state: SagaState, run: &Run) -> Result<SagaState, TransferError> {
        if state.debit_tx_id.is_some() {
            return self.transition(state.transfer_id, SagaPhase::Crediting).await;
        }

        match self.post(&state, SagaStep::Debit, &run.stop).await? {
            ActivityOutcome::Completed(receipt) => {
                self.record_posting(state.transfer_id, SagaStep::Debit, receipt)
                    .await?;
                self.transition(state.transfer_id, SagaPhase::Crediting).await
            }
            ActivityOutcome::Failed(f) if f.kind == FailureKind::Cancelled => Ok(state),
            ActivityOutcome::Failed(f) => {
                // Pre-debit boundary: nothing to reverse
                warn!(transfer_id = %state.transfer_id, error = %f, "Debit failed");
                self.finish(
                    state.transfer_id,
                    SagaPhase::Failed,
                    Some(&failure_code(&f)),
                    Some(f.to_string()),
                )
                .await
            }
        }
    }

    async fn step_crediting(&self, state: SagaState, run: &Run) -> Result<SagaState, TransferError> {
        if state.credit_tx_id.is_some() {
            return self
                .finish(state.transfer_id, SagaPhase::Completed, None, None)
                .await;
        }

        match self.post(&state, SagaStep::Credit, &run.stop).await? {
            ActivityOutcome::Completed(receipt) => {
                self.record_posting(state.transfer_id, SagaStep::Credit, receipt)
                    .await?;
                self.finish(state.transfer_id, SagaPhase::Completed, None, None)
                    .await
            }
            ActivityOutcome::Failed(f) if f.kind == FailureKind::Cancelled => Ok(state),
            ActivityOutcome::Failed(f) => {
                warn!(transfer_id = %state.transfer_id, error = %f, "Credit failed after debit, compensating");
                self.begin_compensation(
                    state.transfer_id,
                    CompensationCause::CreditFailed,
                    f.to_string(),
                )
                .await
            }
        }
    }

    async fn step_cancelling(&self, state: SagaState) -> Result<SagaState, TransferError> {
        let reason = state
            .cancel_reason
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());
        if state.has_outstanding_debit() {
            self.begin_compensation(state.transfer_id, CompensationCause::Cancelled, reason)
                .await
        } else {
            self.finish(state.transfer_id, SagaPhase::Cancelled, None, Some(reason))
                .await
        }
    }

    async fn step_compensating(&self, state: SagaState) -> Result<SagaState, TransferError> {
        let transfer_id = state.transfer_id;
        let cause = state
            .compensation_cause
            .unwrap_or(CompensationCause::CreditFailed);

        let Some(debit_tx) = state.debit_tx_id.clone() else {
            return self.close_after_reversal(&state, cause).await;
        };
        if state.compensation_applied {
            return self.close_after_reversal(&state, cause).await;
        }

        let audit = self.ensure_audit(&state, &debit_tx, cause).await?;
        match audit.status {
            CompensationStatus::Pending => {}
            CompensationStatus::Completed => {
                let state = self
                    .store
                    .append(
                        transfer_id,
                        SagaEvent::Compensated {
                            tx_id: audit.compensation_tx_id.clone().unwrap_or_default(),
                        },
                    )
                    .await?;
                return self.close_after_reversal(&state, cause).await;
            }
            CompensationStatus::Timeout => {
                return self
                    .close_unreversed(&state, cause, &audit, COMPENSATION_TIMEOUT)
                    .await;
            }
            CompensationStatus::Failed | CompensationStatus::ManualRequired => {
                return self
                    .close_unreversed(&state, cause, &audit, COMPENSATION_FAILED)
                    .await;
            }
        }

        let req = &state.request;
        let currency = request_currency(req)?;
        let key = self.idempotency_key(&state, SagaStep::CompensateDebit);
        let reason = state
            .compensation_reason
            .clone()
            .unwrap_or_else(|| cause.as_str().to_string());
        let ledger = self.ledger.as_ref();
        let (account, amount) = (req.from_account.as_str(), req.amount);
        let (original_tx_id, reason_ref, key_ref) =
            (debit_tx.as_str(), reason.as_str(), key.as_str());

        let recorder = StepRecorder {
            store: self.store.as_ref(),
            audits: Some(self.audits.as_ref()),
            transfer_id,
            step: SagaStep::CompensateDebit,
            idempotency_key: &key,
        };
        // Reversal always runs to a final outcome; cancel and deadline no longer apply
        let outcome = self
            .runtime
            .execute(
                SagaStep::CompensateDebit.as_str(),
                &self.config.compensate_options,
                &CancelSignal::never(),
                &recorder,
                move |ctx: AttemptContext| async move {
                    let reversal = Reversal {
                        original_tx_id,
                        account,
                        amount,
                        currency,
                        idempotency_key: key_ref,
                        reason: reason_ref,
                    };
                    ledger.compensate_debit(&reversal, &ctx.heartbeat).await
                },
            )
            .await?;

        match outcome {
            ActivityOutcome::Completed(receipt) => {
                let audit = self
                    .audits
                    .update(&transfer_id, CompensationUpdate::completed(receipt.tx_id.clone()))
                    .await?;
                self.metrics.compensation(CompensationStatus::Completed.as_str());
                info!(transfer_id = %transfer_id, audit_id = %audit.id, tx_id = %receipt.tx_id, "Debit reversed");
                let state = self
                    .store
                    .append(transfer_id, SagaEvent::Compensated { tx_id: receipt.tx_id })
                    .await?;
                self.close_after_reversal(&state, cause).await
            }
            ActivityOutcome::Failed(f) if f.kind == FailureKind::TimedOut => {
                let audit = self
                    .audits
                    .update(
                        &transfer_id,
                        CompensationUpdate::timed_out(f.to_string(), f.elapsed),
                    )
                    .await?;
                self.metrics.compensation(CompensationStatus::Timeout.as_str());
                error!(transfer_id = %transfer_id, audit_id = %audit.id, error = %f, "Compensation timed out, manual reconciliation required");
                self.close_unreversed(&state, cause, &audit, COMPENSATION_TIMEOUT)
                    .await
            }
            ActivityOutcome::Failed(f) => {
                let audit = self
                    .audits
                    .update(&transfer_id, CompensationUpdate::failed(f.to_string()))
                    .await?;
                self.metrics.compensation(CompensationStatus::Failed.as_str());
                error!(transfer_id = %transfer_id, audit_id = %audit.id, error = %f, "Compensation failed, manual reconciliation required");
                self.close_unreversed(&state, cause, &audit, COMPENSATION_FAILED)
                    .await
            }
        }
    }

    /// Cancel or deadline observed at a step boundary
    async fn step_interrupted(
        &self,
        state: SagaState,
        interrupt: Interrupt,
        run: &Run,
    ) -> Result<SagaState, TransferError> {
        let transfer_id = state.transfer_id;
        let mut state = state;

        // A posting that may have landed must be settled before deciding
        match state.phase {
            SagaPhase::Debiting
                if state.debit_tx_id.is_none() && !settled(&state, SagaStep::Debit, run) =>
            {
                state = self.reconcile(state, SagaStep::Debit).await?;
            }
            SagaPhase::Crediting
                if state.credit_tx_id.is_none() && !settled(&state, SagaStep::Credit, run) =>
            {
                state = self.reconcile(state, SagaStep::Credit).await?;
                if state.credit_tx_id.is_some() {
                    info!(transfer_id = %transfer_id, "Credit already applied, completing despite interrupt");
                    return self
                        .finish(transfer_id, SagaPhase::Completed, None, None)
                        .await;
                }
            }
            _ => {}
        }

        match interrupt {
            Interrupt::Cancel(reason) => {
                info!(transfer_id = %transfer_id, phase = %state.phase, reason = %reason, "Cancelling saga");
                self.transition(transfer_id, SagaPhase::Cancelling).await
            }
            Interrupt::Timeout(bound) => {
                let message = format!("{} timeout exceeded in {}", bound, state.phase);
                warn!(transfer_id = %transfer_id, phase = %state.phase, bound, "Saga deadline exceeded");
                if state.has_outstanding_debit() {
                    self.begin_compensation(transfer_id, CompensationCause::WorkflowTimeout, message)
                        .await
                } else {
                    self.finish(
                        transfer_id,
                        SagaPhase::Failed,
                        Some(WORKFLOW_TIMEOUT),
                        Some(message),
                    )
                    .await
                }
            }
        }
    }

    /// Re-issue a posting under its original key to learn whether it landed
    async fn reconcile(&self, state: SagaState, step: SagaStep) -> Result<SagaState, TransferError> {
        debug!(transfer_id = %state.transfer_id, step = %step, "Reconciling ambiguous posting");
        match self.post(&state, step, &CancelSignal::never()).await? {
            ActivityOutcome::Completed(receipt) => {
                self.record_posting(state.transfer_id, step, receipt).await
            }
            ActivityOutcome::Failed(f) => {
                warn!(transfer_id = %state.transfer_id, step = %step, error = %f, "Posting not applied");
                Ok(state)
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn call<T, F, Fut>(
        &self,
        state: &SagaState,
        step: SagaStep,
        key: &str,
        cancel: &CancelSignal,
        op: F,
    ) -> Result<ActivityOutcome<T>, TransferError>
    where
        F: FnMut(AttemptContext) -> Fut + Send,
        Fut: Future<Output = Result<T, LedgerError>> + Send,
        T: Send,
    {
        let recorder = StepRecorder {
            store: self.store.as_ref(),
            audits: None,
            transfer_id: state.transfer_id,
            step,
            idempotency_key: key,
        };
        self.runtime
            .execute(
                step.as_str(),
                self.config.options_for(step),
                cancel,
                &recorder,
                op,
            )
            .await
    }

    /// Debit or Credit
    async fn post(
        &self,
        state: &SagaState,
        step: SagaStep,
        cancel: &CancelSignal,
    ) -> Result<ActivityOutcome<LedgerReceipt>, TransferError> {
        let req = &state.request;
        let currency = request_currency(req)?;
        let key = self.idempotency_key(state, step);
        let reference = state.transfer_id.to_string();
        let ledger = self.ledger.as_ref();
        let account = match step {
            SagaStep::Debit => req.from_account.as_str(),
            _ => req.to_account.as_str(),
        };
        let (amount, key_ref, reference_ref) = (req.amount, key.as_str(), reference.as_str());

        self.call(state, step, &key, cancel, move |ctx| async move {
            let posting = Posting {
                account,
                amount,
                currency,
                idempotency_key: key_ref,
                reference: reference_ref,
            };
            match step {
                SagaStep::Debit => ledger.debit(&posting, &ctx.heartbeat).await,
                _ => ledger.credit(&posting, &ctx.heartbeat).await,
            }
        })
        .await
    }

    async fn record_posting(
        &self,
        transfer_id: TransferId,
        step: SagaStep,
        receipt: LedgerReceipt,
    ) -> Result<SagaState, TransferError> {
        debug!(
            transfer_id = %transfer_id,
            step = %step,
            tx_id = %receipt.tx_id,
            new_balance = receipt.new_balance,
            "Posting applied"
        );
        let event = match step {
            SagaStep::Debit => SagaEvent::Debited {
                tx_id: receipt.tx_id,
            },
            _ => SagaEvent::Credited {
                tx_id: receipt.tx_id,
            },
        };
        self.store.append(transfer_id, event).await
    }

    async fn begin_compensation(
        &self,
        transfer_id: TransferId,
        cause: CompensationCause,
        reason: String,
    ) -> Result<SagaState, TransferError> {
        info!(transfer_id = %transfer_id, cause = cause.as_str(), reason = %reason, "Compensation started");
        self.store
            .append(transfer_id, SagaEvent::CompensationStarted { cause, reason })
            .await
    }

    /// Reuse the open audit record of this saga, or open one
    async fn ensure_audit(
        &self,
        state: &SagaState,
        debit_tx: &str,
        cause: CompensationCause,
    ) -> Result<CompensationAudit, TransferError> {
        let transfer_id = state.transfer_id;
        let existing = self.audits.by_transfer(&transfer_id).await?;
        let found = match &state.audit_id {
            Some(audit_id) => existing.into_iter().find(|a| &a.id == audit_id),
            None => existing
                .into_iter()
                .next()
                .filter(|a| a.original_debit_tx_id == debit_tx),
        };
        if let Some(audit) = found {
            if state.audit_id.is_none() {
                self.store
                    .append(
                        transfer_id,
                        SagaEvent::AuditOpened {
                            audit_id: audit.id.clone(),
                        },
                    )
                    .await?;
            }
            return Ok(audit);
        }

        let req = &state.request;
        let reason = state
            .compensation_reason
            .clone()
            .unwrap_or_else(|| cause.as_str().to_string());
        let audit = self
            .audits
            .open(NewCompensation {
                workflow_id: state.workflow_id.clone(),
                run_id: state.run_id.clone(),
                transfer_id,
                original_debit_tx_id: debit_tx.to_string(),
                reason: reason.clone(),
                compensation_type: CompensationType::DebitReversal,
                metadata: serde_json::json!({
                    "request_id": req.request_id,
                    "from_account": req.from_account,
                    "to_account": req.to_account,
                    "amount": req.amount,
                    "currency": req.currency,
                    "cause": cause.as_str(),
                    "reason": reason,
                }),
            })
            .await?;
        self.store
            .append(
                transfer_id,
                SagaEvent::AuditOpened {
                    audit_id: audit.id.clone(),
                },
            )
            .await?;
        Ok(audit)
    }

    /// Terminal phase once the debit is reversed (or was never taken)
    async fn close_after_reversal(
        &self,
        state: &SagaState,
        cause: CompensationCause,
    ) -> Result<SagaState, TransferError> {
        let reason = state
            .compensation_reason
            .clone()
            .unwrap_or_else(|| cause.as_str().to_string());
        let suffix = if state.compensation_applied {
            "; debit reversed"
        } else {
            ""
        };
        match cause {
            CompensationCause::Cancelled => {
                self.finish(
                    state.transfer_id,
                    SagaPhase::Cancelled,
                    None,
                    Some(format!("{}{}", reason, suffix)),
                )
                .await
            }
            CompensationCause::CreditFailed => {
                self.finish(
                    state.transfer_id,
                    SagaPhase::Failed,
                    Some(CREDIT_FAILED),
                    Some(format!("credit failed: {}{}", reason, suffix)),
                )
                .await
            }
            CompensationCause::WorkflowTimeout => {
                self.finish(
                    state.transfer_id,
                    SagaPhase::Failed,
                    Some(WORKFLOW_TIMEOUT),
                    Some(format!("{}{}", reason, suffix)),
                )
                .await
            }
        }
    }

    /// FAILED with the debit still outstanding; the audit record carries it
    async fn close_unreversed(
        &self,
        state: &SagaState,
        cause: CompensationCause,
        audit: &CompensationAudit,
        code: &str,
    ) -> Result<SagaState, TransferError> {
        let what = match cause {
            CompensationCause::CreditFailed => "credit failed",
            CompensationCause::Cancelled => "transfer cancelled",
            CompensationCause::WorkflowTimeout => "workflow timed out",
        };
        let how = if code == COMPENSATION_TIMEOUT {
            "compensation timed out"
        } else {
            "compensation failed"
        };
        let detail = audit
            .failure_reason
            .clone()
            .unwrap_or_else(|| audit.status.to_string());
        self.finish(
            state.transfer_id,
            SagaPhase::Failed,
            Some(code),
            Some(format!(
                "{} and {} (audit {}): {}",
                what, how, audit.id, detail
            )),
        )
        .await
    }

    async fn transition(
        &self,
        transfer_id: TransferId,
        phase: SagaPhase,
    ) -> Result<SagaState, TransferError> {
        debug!(transfer_id = %transfer_id, phase = %phase, "Phase changed");
        self.store
            .append(transfer_id, SagaEvent::PhaseChanged { phase })
            .await
    }

    async fn finish(
        &self,
        transfer_id: TransferId,
        phase: SagaPhase,
        error_code: Option<&str>,
        error_message: Option<String>,
    ) -> Result<SagaState, TransferError> {
        let state = self
            .store
            .append(
                transfer_id,
                SagaEvent::Finished {
                    phase,
                    error_code: error_code.map(str::to_string),
                    error_message,
                },
            )
            .await?;
        self.metrics.saga_finished(state.status().as_str());
        if state.phase == SagaPhase::Completed {
            info!(transfer_id = %transfer_id, "Transfer completed");
        } else {
            info!(
                transfer_id = %transfer_id,
                status = %state.status(),
                code = state.error_code.as_deref().unwrap_or(""),
                compensation_applied = state.compensation_applied,
                "Transfer finished"
            );
        }
        Ok(state)
    }

    fn idempotency_key(&self, state: &SagaState, step: SagaStep) -> String {
        self.config
            .key_scheme
            .idempotency_key(&state.request.request_id, &state.transfer_id, step)
    }
}

/// Persists every attempt of one step before the runtime moves on
struct StepRecorder<'a> {
    store: &'a dyn SagaStore,
    /// Set for compensation: non-final attempts bump the audit counter
    audits: Option<&'a dyn CompensationAuditStore>,
    transfer_id: TransferId,
    step: SagaStep,
    idempotency_key: &'a str,
}

#[async_trait]
impl AttemptRecorder for StepRecorder<'_> {
    async fn record(&self, report: &AttemptReport) -> Result<(), TransferError> {
        self.store
            .append(
                self.transfer_id,
                SagaEvent::StepRecorded {
                    attempt: StepAttempt {
                        step: self.step,
                        attempt_number: report.attempt,
                        idempotency_key: self.idempotency_key.to_string(),
                        started_at: report.started_at,
                        ended_at: report.ended_at,
                        outcome: report.outcome,
                        error_code: report.error_code.clone(),
                        error: report.error.clone(),
                        tx_id: None,
                    },
                },
            )
            .await?;

        if let Some(audits) = self.audits
            && report.outcome == AttemptOutcome::Retried
        {
            audits
                .update(
                    &self.transfer_id,
                    CompensationUpdate::attempt(report.error.clone()),
                )
                .await?;
        }
        Ok(())
    }
}

/// Engine-side request validation; no participant is called before it passes
pub fn validate(request: &TransferRequest) -> Result<Currency, TransferError> {
    if request.request_id.is_empty() {
        return Err(TransferError::Validation("request_id is required".into()));
    }
    if request.from_account.is_empty() || request.to_account.is_empty() {
        return Err(TransferError::Validation("account ids are required".into()));
    }
    if request.from_account == request.to_account {
        return Err(TransferError::SameAccount);
    }
    if request.amount <= 0 {
        return Err(TransferError::InvalidAmount);
    }
    request_currency(request)
}

fn request_currency(request: &TransferRequest) -> Result<Currency, TransferError> {
    request
        .currency
        .parse()
        .map_err(|_| TransferError::UnsupportedCurrency(request.currency.clone()))
}

fn failure_code(f: &ActivityFailure) -> String {
    match (&f.code, f.kind) {
        (Some(code), FailureKind::Permanent | FailureKind::RetriesExhausted) => code.clone(),
        (_, FailureKind::TimedOut) => "ACTIVITY_TIMEOUT".to_string(),
        (Some(code), _) => code.clone(),
        (None, _) => "ACTIVITY_FAILED".to_string(),
    }
}

/// Whether this run already saw a definitive participant answer for `step`
///
/// Attempts from earlier runs are ignored: a crash may have cut one short.
/// A participant error code is definitive; a timeout or an unreported attempt
/// is not.
fn settled(state: &SagaState, step: SagaStep, run: &Run) -> bool {
    state
        .step_log
        .iter()
        .skip(run.baseline)
        .rev()
        .find(|a| a.step == step && a.outcome != AttemptOutcome::Cancelled)
        .is_some_and(|a| a.outcome != AttemptOutcome::Ok && a.error_code.is_some())
}
