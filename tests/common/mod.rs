//! Shared fixtures for the saga integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use transfer_saga::activity::{ActivityOptions, ActivityRuntime, Heartbeat, RetryPolicy};
use transfer_saga::compensation::{CompensationAuditStore, MemoryAuditStore};
use transfer_saga::currency::Currency;
use transfer_saga::ledger::{
    BalanceCheck, InMemoryLedger, LedgerError, LedgerParticipant, LedgerReceipt, Posting, Reversal,
};
use transfer_saga::metrics::SagaMetrics;
use transfer_saga::transfer::{
    EngineConfig, MemorySagaStore, SagaEngine, SagaState, SagaStore, TransferId, TransferRequest,
};

pub const FROM: &str = "100000000001";
pub const TO: &str = "100000000002";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Check,
    Debit,
    Credit,
    Compensate,
}

/// One scripted participant behaviour
#[derive(Debug, Clone)]
pub enum Fault {
    /// Return the error without touching the ledger
    Fail(LedgerError),
    /// Apply the call, then lose the response
    ApplyThenFail(LedgerError),
    /// Sleep before applying
    Delay(Duration),
    /// Panic inside the participant call
    Panic,
}

/// Ledger wrapper that injects faults per operation.
///
/// Queued faults are consumed one per call; the sticky fault (if any)
/// applies once the queue is empty.
pub struct ScriptedLedger {
    inner: Arc<InMemoryLedger>,
    queued: Mutex<HashMap<Op, VecDeque<Fault>>>,
    sticky: Mutex<HashMap<Op, Fault>>,
    calls: Mutex<HashMap<Op, u32>>,
}

impl ScriptedLedger {
    pub fn new(inner: Arc<InMemoryLedger>) -> Self {
        Self {
            inner,
            queued: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, op: Op, faults: impl IntoIterator<Item = Fault>) {
        self.queued
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .extend(faults);
    }

    pub fn always(&self, op: Op, fault: Fault) {
        self.sticky.lock().unwrap().insert(op, fault);
    }

    pub fn clear(&self, op: Op) {
        self.queued.lock().unwrap().remove(&op);
        self.sticky.lock().unwrap().remove(&op);
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn next_fault(&self, op: Op) -> Option<Fault> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
        if let Some(f) = self.queued.lock().unwrap().get_mut(&op).and_then(|q| q.pop_front()) {
            return Some(f);
        }
        self.sticky.lock().unwrap().get(&op).cloned()
    }

    async fn run<T, Fut>(&self, op: Op, call: impl FnOnce() -> Fut) -> Result<T, LedgerError>
    where
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        match self.next_fault(op) {
            None => call().await,
            Some(Fault::Fail(e)) => Err(e),
            Some(Fault::ApplyThenFail(e)) => {
                call().await?;
                Err(e)
            }
            Some(Fault::Delay(d)) => {
                tokio::time::sleep(d).await;
                call().await
            }
            Some(Fault::Panic) => panic!("scripted {:?} panic", op),
        }
    }
}

#[async_trait]
impl LedgerParticipant for ScriptedLedger {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn check_balance(
        &self,
        account: &str,
        amount: i64,
        currency: Currency,
        heartbeat: &Heartbeat,
    ) -> Result<BalanceCheck, LedgerError> {
        self.run(Op::Check, || {
            self.inner.check_balance(account, amount, currency, heartbeat)
        })
        .await
    }

    async fn debit(
        &self,
        posting: &Posting<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.run(Op::Debit, || self.inner.debit(posting, heartbeat))
            .await
    }

    async fn credit(
        &self,
        posting: &Posting<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.run(Op::Credit, || self.inner.credit(posting, heartbeat))
            .await
    }

    async fn compensate_debit(
        &self,
        reversal: &Reversal<'_>,
        heartbeat: &Heartbeat,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.run(Op::Compensate, || {
            self.inner.compensate_debit(reversal, heartbeat)
        })
        .await
    }
}

pub fn transient(msg: &str) -> LedgerError {
    LedgerError::Transient(msg.to_string())
}

/// Millisecond-scale options so scenarios finish quickly
pub fn fast_options() -> ActivityOptions {
    ActivityOptions::default()
        .with_start_to_close(Duration::from_millis(500))
        .with_schedule_to_close(Duration::from_secs(3))
        .with_heartbeat(None)
        .with_retry(RetryPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            ..RetryPolicy::default()
        })
}

pub struct Harness {
    pub engine: Arc<SagaEngine>,
    pub store: Arc<dyn SagaStore>,
    pub audits: Arc<dyn CompensationAuditStore>,
    pub bank: Arc<InMemoryLedger>,
    pub ledger: Arc<ScriptedLedger>,
}

/// Two USD accounts: FROM with `from_balance`, TO empty
pub fn harness(from_balance: i64) -> Harness {
    harness_with(from_balance, EngineConfig::with_activity_options(fast_options()))
}

pub fn harness_with(from_balance: i64, config: EngineConfig) -> Harness {
    harness_on(
        Arc::new(MemorySagaStore::new()),
        Arc::new(MemoryAuditStore::new().with_grace_period(Duration::ZERO)),
        from_balance,
        config,
    )
}

pub fn harness_on(
    store: Arc<dyn SagaStore>,
    audits: Arc<dyn CompensationAuditStore>,
    from_balance: i64,
    config: EngineConfig,
) -> Harness {
    let bank = Arc::new(InMemoryLedger::new());
    bank.open_account(FROM, Currency::Usd, from_balance);
    bank.open_account(TO, Currency::Usd, 0);
    harness_on_bank(store, audits, bank, config)
}

/// Engine over an existing ledger, as after a process restart
pub fn harness_on_bank(
    store: Arc<dyn SagaStore>,
    audits: Arc<dyn CompensationAuditStore>,
    bank: Arc<InMemoryLedger>,
    config: EngineConfig,
) -> Harness {
    let ledger = Arc::new(ScriptedLedger::new(bank.clone()));

    let metrics = Arc::new(SagaMetrics::new());
    let runtime = Arc::new(ActivityRuntime::new(32, metrics.clone()));
    let engine = Arc::new(SagaEngine::new(
        store.clone(),
        audits.clone(),
        ledger.clone(),
        runtime,
        metrics,
        config,
    ));
    Harness {
        engine,
        store,
        audits,
        bank,
        ledger,
    }
}

pub fn request(request_id: &str, amount: i64) -> TransferRequest {
    TransferRequest {
        from_account: FROM.into(),
        to_account: TO.into(),
        amount,
        currency: "USD".into(),
        description: "invoice".into(),
        reference_id: "INV-1".into(),
        request_id: request_id.into(),
    }
}

/// Poll until the saga is terminal and its run has exited
pub async fn wait_terminal(engine: &SagaEngine, id: TransferId) -> SagaState {
    for _ in 0..1000 {
        let state = engine.status(&id).await.unwrap();
        if state.is_terminal() && !engine.is_running(&id) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("saga {} did not reach a terminal phase", id);
}

/// Poll until `pred` holds for the persisted state
pub async fn wait_until(
    engine: &SagaEngine,
    id: TransferId,
    pred: impl Fn(&SagaState) -> bool,
) -> SagaState {
    for _ in 0..1000 {
        let state = engine.status(&id).await.unwrap();
        if pred(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("saga {} never reached the expected state", id);
}

/// Test data directory under target/, unique per process
pub fn test_dir(name: &str) -> std::path::PathBuf {
    let dir = std::path::PathBuf::from(format!(
        "target/test_{}_{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
