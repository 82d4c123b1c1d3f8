//! Crash / restart behaviour over the WAL-backed saga store

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use transfer_saga::activity::Heartbeat;
use transfer_saga::compensation::{
    CompensationAuditStore, CompensationStatus, MemoryAuditStore, WalAuditStore,
};
use transfer_saga::currency::Currency;
use transfer_saga::ledger::{
    InMemoryLedger, LedgerEntryKind, LedgerError, LedgerParticipant, Posting,
};
use transfer_saga::transfer::{
    EngineConfig, RecoveryWorker, SagaEvent, SagaPhase, SagaStore, TransferId, TransferStatus,
    WalSagaStore, WorkerConfig,
};

fn wal_store(dir: &std::path::Path) -> Arc<WalSagaStore> {
    Arc::new(WalSagaStore::open(dir.join("sagas.wal"), true).unwrap())
}

fn audit_wal(dir: &std::path::Path) -> Arc<WalAuditStore> {
    Arc::new(WalAuditStore::open(dir.join("compensations.wal"), true).unwrap())
}

fn engine_config() -> EngineConfig {
    EngineConfig::with_activity_options(fast_options())
}

#[tokio::test]
async fn test_completed_saga_survives_restart() {
    let dir = test_dir("recovery_completed");
    let id = {
        let h = harness_on(
            wal_store(&dir),
            Arc::new(MemoryAuditStore::new()),
            1000,
            engine_config(),
        );
        let started = h.engine.start(request("wal-done", 250)).await.unwrap();
        let state = wait_terminal(&h.engine, started.state.transfer_id).await;
        assert_eq!(state.status(), TransferStatus::Completed);
        state.transfer_id
    };

    // Fresh process: new store, new engine, fresh ledger
    let h = harness_on(
        wal_store(&dir),
        Arc::new(MemoryAuditStore::new()),
        1000,
        engine_config(),
    );
    let state = h.engine.status(&id).await.unwrap();
    assert_eq!(state.phase, SagaPhase::Completed);
    assert!(state.debit_tx_id.is_some());
    assert!(state.credit_tx_id.is_some());

    // Resubmission attaches to the recorded outcome
    let again = h.engine.start(request("wal-done", 250)).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.state.status(), TransferStatus::Completed);
    assert_eq!(h.engine.resume_all().await.unwrap(), 0);
    assert_eq!(h.ledger.total_calls(), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_resume_after_crash_in_debiting() {
    let dir = test_dir("recovery_debiting");
    let req = request("wal-crash", 300);
    let id = TransferId::from_request_id(&req.request_id);

    // The crashed process reached Debiting and never called the ledger
    {
        let store = wal_store(&dir);
        store.create_if_absent(id, &req).await.unwrap();
        store
            .append(id, SagaEvent::PhaseChanged { phase: SagaPhase::Debiting })
            .await
            .unwrap();
    }

    let h = harness_on(
        wal_store(&dir),
        Arc::new(MemoryAuditStore::new()),
        1000,
        engine_config(),
    );
    let worker = RecoveryWorker::new(h.engine.clone(), WorkerConfig::default());
    assert_eq!(worker.recover_on_startup().await.unwrap(), 1);

    let state = wait_terminal(&h.engine, id).await;
    assert_eq!(state.status(), TransferStatus::Completed);
    assert_eq!(h.bank.balance(FROM), Some(700));
    assert_eq!(h.bank.balance(TO), Some(300));

    // The resumed run is a new run of the same workflow
    let events = h.store.events(&id).await.unwrap();
    let runs = events
        .iter()
        .filter(|e| matches!(e.event, SagaEvent::RunStarted { .. }))
        .count();
    assert_eq!(runs, 1);
    assert_eq!(state.workflow_id, id.workflow_id());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_unrecorded_debit_is_not_repeated() {
    let dir = test_dir("recovery_debit");
    let req = request("wal-debit", 400);
    let id = TransferId::from_request_id(&req.request_id);
    {
        let store = wal_store(&dir);
        store.create_if_absent(id, &req).await.unwrap();
        store
            .append(id, SagaEvent::PhaseChanged { phase: SagaPhase::Debiting })
            .await
            .unwrap();
    }

    let h = harness_on(
        wal_store(&dir),
        Arc::new(MemoryAuditStore::new()),
        1000,
        engine_config(),
    );
    // Debit landed at the ledger but the crash lost the receipt
    h.bank
        .debit(
            &Posting {
                account: FROM,
                amount: 400,
                currency: Currency::Usd,
                idempotency_key: "wal-debit-debit",
                reference: "",
            },
            &Heartbeat::detached(),
        )
        .await
        .unwrap();

    h.engine.resume_all().await.unwrap();
    let state = wait_terminal(&h.engine, id).await;

    assert_eq!(state.status(), TransferStatus::Completed);
    assert_eq!(h.bank.entries_for(FROM, LedgerEntryKind::Debit).len(), 1);
    assert_eq!(h.bank.balance(FROM), Some(600));
    assert_eq!(h.bank.balance(TO), Some(400));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_resume_mid_compensation() {
    let dir = test_dir("recovery_compensating");
    let bank = Arc::new(InMemoryLedger::new());
    bank.open_account(FROM, Currency::Usd, 1000);
    bank.open_account(TO, Currency::Usd, 0);

    // First process: debit applied, credit blocked, reversal hangs past shutdown
    let id = {
        let mut config = engine_config();
        config.compensate_options = fast_options()
            .with_start_to_close(Duration::from_secs(30))
            .with_schedule_to_close(Duration::from_secs(60));
        let h = harness_on_bank(wal_store(&dir), audit_wal(&dir), bank.clone(), config);
        h.ledger.script(
            Op::Credit,
            [Fault::Fail(LedgerError::AccountBlocked(TO.to_string()))],
        );
        h.ledger
            .always(Op::Compensate, Fault::Delay(Duration::from_secs(3600)));

        let started = h.engine.start(request("wal-comp", 150)).await.unwrap();
        let id = started.state.transfer_id;
        wait_until(&h.engine, id, |s| {
            s.phase == SagaPhase::Compensating && s.audit_id.is_some()
        })
        .await;
        id
    };
    assert_eq!(bank.balance(FROM), Some(850));

    // Second process reopens both logs against the same ledger
    let h = harness_on_bank(wal_store(&dir), audit_wal(&dir), bank.clone(), engine_config());
    let before = h.store.load(&id).await.unwrap().unwrap();
    assert_eq!(before.phase, SagaPhase::Compensating);
    let debit_tx = before.debit_tx_id.clone().unwrap();

    assert!(h.engine.resume_all().await.unwrap() >= 1);
    let state = wait_terminal(&h.engine, id).await;

    assert_eq!(state.status(), TransferStatus::Failed);
    assert!(state.compensation_applied);
    assert_eq!(state.debit_tx_id.as_deref(), Some(debit_tx.as_str()));
    assert_eq!(bank.balance(FROM), Some(1000));
    assert_eq!(bank.entries_for(FROM, LedgerEntryKind::CompensateDebit).len(), 1);

    // The audit opened by the first run is reused, not duplicated
    let records = h.audits.by_transfer(&id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CompensationStatus::Completed);
    assert_eq!(state.audit_id.as_deref(), Some(records[0].id.as_str()));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_compensation_audit_survives_restart() {
    let dir = test_dir("recovery_audit");
    let (id, audit_id) = {
        let h = harness_on(wal_store(&dir), audit_wal(&dir), 1000, engine_config());
        h.ledger.script(
            Op::Credit,
            [Fault::Fail(LedgerError::AccountBlocked(TO.to_string()))],
        );
        let started = h.engine.start(request("wal-audit", 250)).await.unwrap();
        let state = wait_terminal(&h.engine, started.state.transfer_id).await;
        assert!(state.compensation_applied);
        (state.transfer_id, state.audit_id.clone().unwrap())
    };

    let h = harness_on(wal_store(&dir), audit_wal(&dir), 1000, engine_config());
    let state = h.engine.status(&id).await.unwrap();
    assert_eq!(state.status(), TransferStatus::Failed);
    assert_eq!(state.audit_id.as_deref(), Some(audit_id.as_str()));

    let records = h.audits.by_transfer(&id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, audit_id);
    assert_eq!(records[0].status, CompensationStatus::Completed);
    assert_eq!(records[0].compensation_tx_id, state.compensation_tx_id);
    assert!(records[0].completed_at.is_some());

    let stats = h.audits.stats(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.completed, 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_torn_tail_is_ignored() {
    let dir = test_dir("recovery_torn");
    let id = {
        let h = harness_on(
            wal_store(&dir),
            Arc::new(MemoryAuditStore::new()),
            1000,
            engine_config(),
        );
        let started = h.engine.start(request("wal-torn", 10)).await.unwrap();
        wait_terminal(&h.engine, started.state.transfer_id).await;
        started.state.transfer_id
    };

    // Half-written frame from a crash mid-append
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.join("sagas.wal"))
        .unwrap();
    file.write_all(&[0x40, 0, 0, 0, 1, 1, 0, 0, 9, 9]).unwrap();
    drop(file);

    let store = wal_store(&dir);
    let state = store.load(&id).await.unwrap().unwrap();
    assert_eq!(state.phase, SagaPhase::Completed);

    // The store keeps appending after the truncated tail
    let other = request("wal-torn-2", 10);
    let (created, fresh) = store
        .create_if_absent(TransferId::from_request_id("wal-torn-2"), &other)
        .await
        .unwrap();
    assert!(fresh);
    assert_eq!(created.phase, SagaPhase::New);
    drop(store);

    let reopened = wal_store(&dir);
    assert!(
        reopened
            .load(&TransferId::from_request_id("wal-torn-2"))
            .await
            .unwrap()
            .is_some()
    );

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_stale_scan_picks_up_idle_sagas() {
    let dir = test_dir("recovery_stale");
    let req = request("wal-stale", 20);
    let id = TransferId::from_request_id(&req.request_id);
    {
        let store = wal_store(&dir);
        store.create_if_absent(id, &req).await.unwrap();
    }

    let h = harness_on(
        wal_store(&dir),
        Arc::new(MemoryAuditStore::new()),
        1000,
        engine_config(),
    );
    let worker = RecoveryWorker::new(
        h.engine.clone(),
        WorkerConfig {
            scan_interval: Duration::from_millis(10),
            stale_threshold: Duration::ZERO,
            batch_size: 10,
        },
    );
    assert_eq!(worker.scan_and_recover().await.unwrap(), 1);
    let state = wait_terminal(&h.engine, id).await;
    assert_eq!(state.status(), TransferStatus::Completed);
    assert_eq!(worker.scan_and_recover().await.unwrap(), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_panicked_run_is_resumed() {
    let h = harness(1000);
    h.ledger.script(Op::Credit, [Fault::Panic]);

    let started = h.engine.start(request("panic-credit", 100)).await.unwrap();
    let id = started.state.transfer_id;

    // The run dies mid-credit; its slot must be released
    let mut released = false;
    for _ in 0..500 {
        if h.ledger.calls(Op::Credit) == 1 && !h.engine.is_running(&id) {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released, "panicked run still registered");

    let stuck = h.engine.status(&id).await.unwrap();
    assert_eq!(stuck.phase, SagaPhase::Crediting);
    assert_eq!(h.bank.balance(FROM), Some(900));

    assert_eq!(h.engine.resume_all().await.unwrap(), 1);
    let state = wait_terminal(&h.engine, id).await;
    assert_eq!(state.status(), TransferStatus::Completed);
    assert_eq!(h.bank.entries_for(FROM, LedgerEntryKind::Debit).len(), 1);
    assert_eq!(h.bank.balance(TO), Some(100));
}
