//! End-to-end saga scenarios against a fault-injecting ledger

mod common;

use std::time::Duration;

use common::*;
use transfer_saga::activity::RetryPolicy;
use transfer_saga::compensation::{CompensationAuditStore, CompensationStatus, CompensationUpdate};
use transfer_saga::ledger::{AccountStatus, LedgerEntryKind, LedgerError};
use transfer_saga::transfer::engine::{
    COMPENSATION_FAILED, COMPENSATION_TIMEOUT, CREDIT_FAILED, WORKFLOW_TIMEOUT,
};
use transfer_saga::transfer::{
    CancelOutcome, EngineConfig, SagaPhase, SagaStep, TransferId, TransferStatus,
};

fn blocked_credit() -> Fault {
    Fault::Fail(LedgerError::AccountBlocked(TO.to_string()))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn s1_happy_path() {
    let h = harness(1000);
    let started = h.engine.start(request("s1", 250)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Completed);
    assert!(state.completed_at.is_some());
    assert_eq!(h.bank.balance(FROM), Some(750));
    assert_eq!(h.bank.balance(TO), Some(250));
    assert!(h.audits.by_transfer(&state.transfer_id).await.unwrap().is_empty());
    assert_eq!(h.engine.metrics().finished("COMPLETED"), 1);
}

#[tokio::test]
async fn s2_insufficient_funds() {
    let h = harness(100);
    let started = h.engine.start(request("s2", 250)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
    assert_eq!(h.ledger.calls(Op::Debit), 0);
    assert!(h.bank.entries_for(FROM, LedgerEntryKind::Debit).is_empty());
    assert_eq!(h.bank.balance(FROM), Some(100));
    assert!(h.audits.by_transfer(&state.transfer_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn s3_credit_transient_then_blocked_is_compensated() {
    let h = harness(1000);
    h.ledger.script(
        Op::Credit,
        [
            Fault::Fail(transient("timeout talking to core banking")),
            Fault::Fail(transient("timeout talking to core banking")),
            blocked_credit(),
        ],
    );

    let started = h.engine.start(request("s3", 250)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.error_code.as_deref(), Some(CREDIT_FAILED));
    assert!(state.compensation_applied);
    assert_eq!(h.ledger.calls(Op::Credit), 3);
    assert_eq!(h.bank.balance(FROM), Some(1000));
    assert_eq!(h.bank.balance(TO), Some(0));

    let audits = h.audits.by_transfer(&state.transfer_id).await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].status, CompensationStatus::Completed);
    assert_eq!(audits[0].original_debit_tx_id, state.debit_tx_id.clone().unwrap());
    assert_eq!(audits[0].compensation_tx_id, state.compensation_tx_id);
}

#[tokio::test]
async fn s4_compensation_timeout_is_audited() {
    let mut config = EngineConfig::with_activity_options(fast_options());
    config.compensate_options = fast_options()
        .with_start_to_close(Duration::from_secs(5))
        .with_schedule_to_close(Duration::from_millis(200));
    let h = harness_with(1000, config);
    h.ledger.script(Op::Credit, [blocked_credit()]);
    h.ledger.always(Op::Compensate, Fault::Delay(Duration::from_secs(2)));

    let started = h.engine.start(request("s4", 250)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.error_code.as_deref(), Some(COMPENSATION_TIMEOUT));
    assert!(!state.compensation_applied);
    // Debit stays applied until an operator reconciles
    assert_eq!(h.bank.balance(FROM), Some(750));
    assert!(h.bank.entries_for(FROM, LedgerEntryKind::CompensateDebit).is_empty());

    let audits = h.audits.by_transfer(&state.transfer_id).await.unwrap();
    assert_eq!(audits[0].status, CompensationStatus::Timeout);
    assert!(audits[0].timeout_duration_ms.unwrap() >= 200);
    assert!(audits[0].completed_at.is_some());

    let pending = h.audits.pending(10).await.unwrap();
    assert!(pending.iter().any(|a| a.id == audits[0].id));
}

#[tokio::test]
async fn s5_cancel_during_credit_retry() {
    let mut config = EngineConfig::with_activity_options(fast_options());
    config.credit_options = fast_options()
        .with_schedule_to_close(Duration::from_secs(30))
        .with_abandon_on_cancel(false)
        .with_retry(RetryPolicy {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(50),
            max_attempts: 1000,
            ..RetryPolicy::default()
        });
    let h = harness_with(1000, config);
    h.ledger.always(Op::Credit, Fault::Fail(transient("core banking offline")));

    let started = h.engine.start(request("s5", 250)).await.unwrap();
    let id = started.state.transfer_id;
    wait_until(&h.engine, id, |s| {
        s.step_log.iter().any(|a| a.step == SagaStep::Credit)
    })
    .await;

    let outcome = h.engine.cancel(id, "client changed their mind").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Accepted(_)));

    let state = wait_terminal(&h.engine, id).await;
    assert_eq!(state.status(), TransferStatus::Cancelled);
    assert!(state.compensation_applied);
    assert_eq!(state.cancel_reason.as_deref(), Some("client changed their mind"));
    assert_eq!(h.bank.balance(FROM), Some(1000));
    assert_eq!(h.bank.balance(TO), Some(0));

    let audits = h.audits.by_transfer(&id).await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].status, CompensationStatus::Completed);
    assert_eq!(audits[0].metadata["cause"], "cancelled");
}

#[tokio::test]
async fn s6_duplicate_submission_runs_once() {
    let h = harness(1000);
    let (a, b) = tokio::join!(
        h.engine.start(request("s6", 250)),
        h.engine.start(request("s6", 250)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.state.transfer_id, b.state.transfer_id);
    assert!(a.created ^ b.created);

    let id = a.state.transfer_id;
    let first = wait_terminal(&h.engine, id).await;
    let again = h.engine.start(request("s6", 250)).await.unwrap();
    assert!(!again.created);
    assert_eq!(first.status(), TransferStatus::Completed);
    assert_eq!(again.state.status(), TransferStatus::Completed);

    assert_eq!(h.bank.entries_for(FROM, LedgerEntryKind::Debit).len(), 1);
    assert_eq!(h.bank.entries_for(TO, LedgerEntryKind::Credit).len(), 1);
    assert_eq!(h.bank.balance(FROM), Some(750));
}

/// Credit keeps failing transiently well past the saga deadline
fn unavailable_credit_config() -> EngineConfig {
    let mut config = EngineConfig::with_activity_options(fast_options());
    config.credit_options = fast_options()
        .with_schedule_to_close(Duration::from_secs(30))
        .with_retry(RetryPolicy {
            initial_interval: Duration::from_millis(40),
            max_interval: Duration::from_millis(40),
            max_attempts: 1000,
            ..RetryPolicy::default()
        });
    config
}

async fn assert_timed_out_and_reversed(h: &Harness, request_id: &str, bound: &str) {
    let started = h.engine.start(request(request_id, 400)).await.unwrap();
    let id = started.state.transfer_id;
    let state = wait_terminal(&h.engine, id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.error_code.as_deref(), Some(WORKFLOW_TIMEOUT));
    assert!(state.compensation_applied);
    assert!(state.error_message.as_deref().unwrap().contains(bound));
    assert!(state.debit_tx_id.is_some());
    assert!(state.credit_tx_id.is_none());
    assert!(h.ledger.calls(Op::Credit) >= 2);

    assert_eq!(h.bank.balance(FROM), Some(1000));
    assert_eq!(h.bank.balance(TO), Some(0));
    let reversals = h.bank.entries_for(FROM, LedgerEntryKind::CompensateDebit);
    assert_eq!(reversals.len(), 1);
    assert_eq!(
        reversals[0].metadata["original_transaction_id"],
        state.debit_tx_id.clone().unwrap()
    );

    let audits = h.audits.by_transfer(&id).await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].status, CompensationStatus::Completed);
    assert_eq!(audits[0].metadata["cause"], "workflow_timeout");
    assert_eq!(audits[0].compensation_tx_id, state.compensation_tx_id);
    assert_eq!(state.audit_id.as_deref(), Some(audits[0].id.as_str()));
}

#[tokio::test]
async fn run_timeout_while_crediting_reverses_debit() {
    let mut config = unavailable_credit_config();
    config.run_timeout = Duration::from_millis(300);
    let h = harness_with(1000, config);
    h.ledger.always(Op::Credit, Fault::Fail(transient("core banking offline")));

    assert_timed_out_and_reversed(&h, "t1", "workflow_run").await;
}

#[tokio::test]
async fn execution_timeout_while_crediting_reverses_debit() {
    let mut config = unavailable_credit_config();
    config.execution_timeout = Duration::from_millis(300);
    config.run_timeout = Duration::from_secs(60);
    let h = harness_with(1000, config);
    h.ledger.always(Op::Credit, Fault::Fail(transient("core banking offline")));

    assert_timed_out_and_reversed(&h, "t2", "workflow_execution").await;
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn submission_is_idempotent() {
    let h = harness(1000);
    let submissions = (0..8).map(|_| h.engine.start(request("p1", 100)));
    let outcomes = futures::future::join_all(submissions).await;

    let mut created = 0;
    for outcome in &outcomes {
        let outcome = outcome.as_ref().unwrap();
        assert_eq!(outcome.state.transfer_id, TransferId::from_request_id("p1"));
        created += outcome.created as u32;
    }
    assert_eq!(created, 1);

    let first = wait_terminal(&h.engine, TransferId::from_request_id("p1")).await;
    let late = h.engine.start(request("p1", 100)).await.unwrap();
    assert_eq!(late.state.status(), first.status());
    assert_eq!(first.status(), TransferStatus::Completed);

    assert_eq!(h.ledger.calls(Op::Debit), 1);
    assert_eq!(h.ledger.calls(Op::Credit), 1);
    assert_eq!(h.bank.balance(FROM), Some(900));
}

#[tokio::test]
async fn lost_credit_response_applies_once() {
    let h = harness(1000);
    h.ledger.script(
        Op::Credit,
        [Fault::ApplyThenFail(transient("connection reset"))],
    );

    let started = h.engine.start(request("p2", 300)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Completed);
    assert_eq!(h.ledger.calls(Op::Credit), 2);
    assert_eq!(h.bank.entries_for(TO, LedgerEntryKind::Credit).len(), 1);
    assert_eq!(h.bank.balance(TO), Some(300));

    let credit_keys: Vec<_> = state
        .step_log
        .iter()
        .filter(|a| a.step == SagaStep::Credit)
        .map(|a| a.idempotency_key.clone())
        .collect();
    assert_eq!(credit_keys.len(), 2);
    assert!(credit_keys.iter().all(|k| k == "p2-credit"));
}

#[tokio::test]
async fn completed_transfer_conserves_funds() {
    let h = harness(1000);
    let started = h.engine.start(request("p3", 420)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;
    assert_eq!(state.status(), TransferStatus::Completed);

    let debits = h.bank.entries_for(FROM, LedgerEntryKind::Debit);
    let credits = h.bank.entries_for(TO, LedgerEntryKind::Credit);
    assert_eq!(debits.len(), 1);
    assert_eq!(credits.len(), 1);
    assert_eq!(debits[0].amount, 420);
    assert_eq!(credits[0].amount, 420);
    assert!(h.bank.entries_for(FROM, LedgerEntryKind::CompensateDebit).is_empty());
    assert_eq!(
        h.bank.balance(FROM).unwrap() + h.bank.balance(TO).unwrap(),
        1000
    );
}

#[tokio::test]
async fn compensated_transfer_conserves_funds() {
    let h = harness(1000);
    h.ledger.script(Op::Credit, [blocked_credit()]);
    let started = h.engine.start(request("p4", 600)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert!(state.compensation_applied);
    let debits = h.bank.entries_for(FROM, LedgerEntryKind::Debit);
    let reversals = h.bank.entries_for(FROM, LedgerEntryKind::CompensateDebit);
    assert_eq!(debits.len(), 1);
    assert_eq!(reversals.len(), 1);
    assert_eq!(debits[0].amount, reversals[0].amount);
    assert_eq!(debits[0].currency, reversals[0].currency);
    assert!(h.bank.entries_for(TO, LedgerEntryKind::Credit).is_empty());
    assert_eq!(h.bank.balance(FROM), Some(1000));
}

#[tokio::test]
async fn failed_reversal_is_never_silent() {
    let h = harness(1000);
    h.ledger.script(Op::Credit, [blocked_credit()]);
    h.ledger.always(
        Op::Compensate,
        Fault::Fail(LedgerError::AccountClosed(FROM.to_string())),
    );

    let started = h.engine.start(request("p5", 200)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.error_code.as_deref(), Some(COMPENSATION_FAILED));
    assert!(!state.compensation_applied);
    let message = state.error_message.clone().unwrap();
    assert!(message.contains("credit failed"));
    assert!(message.contains(state.audit_id.as_deref().unwrap()));

    let audits = h.audits.by_transfer(&state.transfer_id).await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].status, CompensationStatus::Failed);
    // ACCOUNT_CLOSED is definitive, so the reversal is not retried
    assert_eq!(audits[0].attempts, 1);
    assert_eq!(h.ledger.calls(Op::Compensate), 1);
    assert!(audits[0].failure_reason.is_some());
    assert!(h.audits.pending(10).await.unwrap().iter().any(|a| a.id == audits[0].id));
}

#[tokio::test]
async fn inactive_credit_account_is_not_retried() {
    let h = harness(1000);
    h.bank.set_status(TO, AccountStatus::Inactive).unwrap();

    let started = h.engine.start(request("p5-inactive", 300)).await.unwrap();
    let state = wait_terminal(&h.engine, started.state.transfer_id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.error_code.as_deref(), Some(CREDIT_FAILED));
    assert!(state.compensation_applied);
    assert_eq!(h.ledger.calls(Op::Credit), 1);
    assert_eq!(h.bank.balance(FROM), Some(1000));
}

#[tokio::test]
async fn audit_is_monotone() {
    let h = harness(1000);
    h.ledger.script(Op::Credit, [blocked_credit()]);
    h.ledger.script(
        Op::Compensate,
        [
            Fault::Fail(transient("db busy")),
            Fault::Fail(transient("db busy")),
        ],
    );

    let started = h.engine.start(request("p6", 50)).await.unwrap();
    let id = started.state.transfer_id;
    let state = wait_terminal(&h.engine, id).await;
    assert!(state.compensation_applied);

    let audit = h.audits.by_transfer(&id).await.unwrap().remove(0);
    assert_eq!(audit.status, CompensationStatus::Completed);
    assert_eq!(audit.attempts, 3);

    let late = h
        .audits
        .update(&id, CompensationUpdate::failed("late writer".into()))
        .await;
    assert!(late.is_err());
    let after = h.audits.by_transfer(&id).await.unwrap().remove(0);
    assert_eq!(after.status, CompensationStatus::Completed);
    assert_eq!(after.attempts, audit.attempts);
}

#[tokio::test]
async fn invalid_requests_fail_without_participant_calls() {
    let h = harness(1000);
    let mut cases = Vec::new();

    let mut same = request("p7-same", 10);
    same.to_account = FROM.into();
    cases.push((same, "SAME_ACCOUNT"));

    cases.push((request("p7-zero", 0), "INVALID_AMOUNT"));
    cases.push((request("p7-neg", -5), "INVALID_AMOUNT"));

    let mut xyz = request("p7-xyz", 10);
    xyz.currency = "XYZ".into();
    cases.push((xyz, "INVALID_CURRENCY"));

    cases.push((request("", 10), "VALIDATION_ERROR"));

    for (req, code) in cases {
        let started = h.engine.start(req).await.unwrap();
        let state = wait_terminal(&h.engine, started.state.transfer_id).await;
        assert_eq!(state.phase, SagaPhase::Failed, "{}", code);
        assert_eq!(state.error_code.as_deref(), Some(code));
        assert!(state.step_log.is_empty());
    }
    assert_eq!(h.ledger.total_calls(), 0);
}
