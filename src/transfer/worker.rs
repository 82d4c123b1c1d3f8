//! Recovery Worker
//!
//! Resumes sagas left non-terminal by a crash or an aborted run.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::engine::SagaEngine;
use super::error::TransferError;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale sagas
    pub scan_interval: Duration,
    /// How long a saga must sit untouched to be considered stale
    pub stale_threshold: Duration,
    /// Maximum sagas to resume per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Recovery Worker
///
/// On startup every non-terminal saga is resumed. Afterwards the worker
/// periodically picks up sagas that are non-terminal, not driven by a run in
/// this process, and idle for longer than `stale_threshold`.
pub struct RecoveryWorker {
    engine: Arc<SagaEngine>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(engine: Arc<SagaEngine>, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    pub fn with_defaults(engine: Arc<SagaEngine>) -> Self {
        Self::new(engine, WorkerConfig::default())
    }

    /// Resume everything the log says is unfinished
    pub async fn recover_on_startup(&self) -> Result<usize, TransferError> {
        let resumed = self.engine.resume_all().await?;
        info!(count = resumed, "Startup recovery complete");
        Ok(resumed)
    }

    /// Run the recovery worker loop
    ///
    /// This method runs forever.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        if let Err(e) = self.recover_on_startup().await {
            error!(error = %e, "Startup recovery failed");
        }

        loop {
            tokio::time::sleep(self.config.scan_interval).await;

            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }
        }
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<usize, TransferError> {
        let resumed = self
            .engine
            .resume_stale(self.config.stale_threshold, self.config.batch_size)
            .await?;

        if resumed == 0 {
            debug!("No stale sagas found");
        } else {
            info!(count = resumed, "Resumed stale sagas this scan");
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityRuntime;
    use crate::compensation::MemoryAuditStore;
    use crate::currency::Currency;
    use crate::ledger::InMemoryLedger;
    use crate::metrics::SagaMetrics;
    use crate::transfer::engine::EngineConfig;
    use crate::transfer::state::{SagaEvent, SagaPhase};
    use crate::transfer::store::{MemorySagaStore, SagaStore};
    use crate::transfer::{TransferId, TransferRequest};

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }

    fn engine_with(store: Arc<MemorySagaStore>) -> Arc<SagaEngine> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.open_account("100000000001", Currency::Eur, 100);
        ledger.open_account("100000000002", Currency::Eur, 0);
        let metrics = Arc::new(SagaMetrics::new());
        Arc::new(SagaEngine::new(
            store,
            Arc::new(MemoryAuditStore::new()),
            ledger,
            Arc::new(ActivityRuntime::new(4, metrics.clone())),
            metrics,
            EngineConfig::default(),
        ))
    }

    async fn seed(store: &MemorySagaStore, request_id: &str) -> TransferId {
        let req = TransferRequest {
            from_account: "100000000001".into(),
            to_account: "100000000002".into(),
            amount: 10,
            currency: "EUR".into(),
            description: String::new(),
            reference_id: String::new(),
            request_id: request_id.into(),
        };
        let id = TransferId::from_request_id(request_id);
        store.create_if_absent(id, &req).await.unwrap();
        store
            .append(id, SagaEvent::PhaseChanged { phase: SagaPhase::Checking })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_fresh_sagas_are_not_stale() {
        let store = Arc::new(MemorySagaStore::new());
        seed(&store, "w-1").await;
        let worker = RecoveryWorker::with_defaults(engine_with(store));

        assert_eq!(worker.scan_and_recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_threshold_resumes_batch() {
        let store = Arc::new(MemorySagaStore::new());
        let a = seed(&store, "w-a").await;
        let b = seed(&store, "w-b").await;
        let engine = engine_with(store);
        let worker = RecoveryWorker::new(
            engine.clone(),
            WorkerConfig {
                scan_interval: Duration::from_millis(10),
                stale_threshold: Duration::ZERO,
                batch_size: 1,
            },
        );

        assert_eq!(worker.scan_and_recover().await.unwrap(), 1);

        for _ in 0..500 {
            let sa = engine.status(&a).await.unwrap();
            let sb = engine.status(&b).await.unwrap();
            if sa.is_terminal() || sb.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("resumed saga did not finish");
    }

    #[tokio::test]
    async fn test_startup_recovery_resumes_all() {
        let store = Arc::new(MemorySagaStore::new());
        let a = seed(&store, "s-a").await;
        let b = seed(&store, "s-b").await;
        let engine = engine_with(store);
        let worker = RecoveryWorker::with_defaults(engine.clone());

        assert_eq!(worker.recover_on_startup().await.unwrap(), 2);
        for id in [a, b] {
            let mut done = false;
            for _ in 0..500 {
                if engine.status(&id).await.unwrap().is_terminal() {
                    done = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(done, "saga {} did not finish", id);
        }
    }
}
