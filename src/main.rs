//! Transfer Saga service
//!
//! ```text
//! gateway (HTTP) ──► TransferOrchestrator ──rpc──► SagaEngine ──► InMemoryLedger
//!                                                   ▲    │
//!                                      RecoveryWorker    ├──► WalSagaStore
//!                                                        └──► audit store (Pg / WAL)
//! ```
//!
//! Usage: `transfer_saga [--env dev] [--port 8080]`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use transfer_saga::activity::ActivityRuntime;
use transfer_saga::compensation::{CompensationAuditStore, PgAuditStore, WalAuditStore};
use transfer_saga::config::AppConfig;
use transfer_saga::gateway::{self, state::AppState};
use transfer_saga::ledger::InMemoryLedger;
use transfer_saga::metrics::SagaMetrics;
use transfer_saga::transfer::{
    RecoveryWorker, SagaEngine, TransferOrchestrator, WalSagaStore, engine_channel, serve,
};

const SAGA_WAL_FILE: &str = "sagas.wal";
const AUDIT_WAL_FILE: &str = "compensations.wal";

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

async fn build_audit_store(
    config: &AppConfig,
) -> anyhow::Result<Arc<dyn CompensationAuditStore>> {
    let grace = Duration::from_secs(config.audit.pending_grace_secs);
    match &config.audit.postgres_url {
        Some(url) => {
            let store = PgAuditStore::connect(url)
                .await
                .context("Failed to connect audit database")?
                .with_grace_period(grace);
            store
                .ensure_schema()
                .await
                .context("Failed to create compensation_audit schema")?;
            tracing::info!("Compensation audit store: PostgreSQL");
            Ok(Arc::new(store))
        }
        None => {
            let path = Path::new(&config.persistence.data_dir).join(AUDIT_WAL_FILE);
            let store = WalAuditStore::open(&path, config.persistence.sync_writes)
                .with_context(|| format!("Failed to open audit log {}", path.display()))?
                .with_grace_period(grace);
            tracing::info!(path = %path.display(), "Compensation audit store: WAL");
            Ok(Arc::new(store))
        }
    }
}

fn build_ledger(config: &AppConfig) -> Arc<InMemoryLedger> {
    let ledger = Arc::new(InMemoryLedger::new());
    for account in &config.accounts {
        ledger.open_account(&account.id, account.currency, account.balance);
    }
    tracing::info!(accounts = config.accounts.len(), "In-memory ledger seeded");
    ledger
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let mut app_config = AppConfig::load(&env)?;
    if let Some(port) = get_port_override() {
        app_config.gateway.port = port;
    }
    let _log_guard = transfer_saga::logging::init_logging(&app_config);

    tracing::info!(
        "Starting Transfer Saga {} ({}) in {} mode",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env
    );

    // Saga log
    let data_dir = Path::new(&app_config.persistence.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
    let store = Arc::new(WalSagaStore::open(
        data_dir.join(SAGA_WAL_FILE),
        app_config.persistence.sync_writes,
    )?);

    let audits = build_audit_store(&app_config).await?;
    let ledger = build_ledger(&app_config);
    let metrics = Arc::new(SagaMetrics::new());
    let runtime = Arc::new(ActivityRuntime::new(
        app_config.activity.max_concurrent,
        metrics.clone(),
    ));

    let engine = Arc::new(SagaEngine::new(
        store,
        audits.clone(),
        ledger,
        runtime,
        metrics.clone(),
        app_config.engine_config(),
    ));

    // Engine RPC
    let (client, receiver) = engine_channel(app_config.gateway.queue_size);
    tokio::spawn(serve(engine.clone(), receiver));

    // Recovery: resume everything left unfinished, then scan for stalls
    let worker = RecoveryWorker::new(engine, app_config.worker_config());
    tokio::spawn(async move {
        worker.run().await;
    });

    let orchestrator = Arc::new(TransferOrchestrator::new(
        client,
        app_config.orchestrator_config(),
    ));
    let state = Arc::new(AppState::new(orchestrator, metrics, audits));

    gateway::run_server(&app_config.gateway, state).await
}
