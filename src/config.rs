use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityOptions, RetryPolicy};
use crate::currency::Currency;
use crate::ledger::LedgerError;
use crate::transfer::engine::EngineConfig;
use crate::transfer::orchestrator::OrchestratorConfig;
use crate::transfer::types::KeyScheme;
use crate::transfer::worker::WorkerConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    pub engine: EngineSection,
    pub activity: ActivitySection,
    pub orchestrator: OrchestratorSection,
    pub persistence: PersistenceConfig,
    pub audit: AuditConfig,
    pub recovery: RecoverySection,
    /// Seed accounts for the in-memory ledger
    pub accounts: Vec<SeedAccount>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "transfer_saga.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            gateway: GatewayConfig::default(),
            engine: EngineSection::default(),
            activity: ActivitySection::default(),
            orchestrator: OrchestratorSection::default(),
            persistence: PersistenceConfig::default(),
            audit: AuditConfig::default(),
            recovery: RecoverySection::default(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Engine RPC channel depth
    pub queue_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            queue_size: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSection {
    pub execution_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub key_scheme: KeyScheme,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 600,
            run_timeout_secs: 300,
            key_scheme: KeyScheme::Plain,
        }
    }
}

/// Banking-tuned activity defaults
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ActivitySection {
    pub start_to_close_ms: u64,
    pub schedule_to_start_ms: u64,
    pub schedule_to_close_ms: u64,
    /// 0 disables the heartbeat watchdog
    pub heartbeat_ms: u64,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
    pub non_retryable_error_types: Vec<String>,
    pub max_concurrent: usize,
}

impl Default for ActivitySection {
    fn default() -> Self {
        Self {
            start_to_close_ms: 120_000,
            schedule_to_start_ms: 60_000,
            schedule_to_close_ms: 180_000,
            heartbeat_ms: 30_000,
            initial_interval_ms: 500,
            backoff_coefficient: 1.5,
            max_interval_ms: 15_000,
            max_attempts: 3,
            non_retryable_error_types: LedgerError::default_non_retryable(),
            max_concurrent: 256,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OrchestratorSection {
    pub sync_wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            sync_wait_timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: String,
    /// fsync every saga WAL append
    pub sync_writes: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/saga".to_string(),
            sync_writes: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    /// PostgreSQL URL; the in-memory store is used when absent
    pub postgres_url: Option<String>,
    pub pending_grace_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            pending_grace_secs: 300,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecoverySection {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SeedAccount {
    pub id: String,
    pub currency: Currency,
    pub balance: i64,
}

impl AppConfig {
    /// Load `config/{env}.yaml`; a missing file yields the defaults
    pub fn load(env: &str) -> anyhow::Result<Self> {
        Self::load_from(format!("config/{}.yaml", env))
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn activity_options(&self) -> ActivityOptions {
        let a = &self.activity;
        ActivityOptions::default()
            .with_start_to_close(Duration::from_millis(a.start_to_close_ms))
            .with_schedule_to_start(Duration::from_millis(a.schedule_to_start_ms))
            .with_schedule_to_close(Duration::from_millis(a.schedule_to_close_ms))
            .with_heartbeat((a.heartbeat_ms > 0).then(|| Duration::from_millis(a.heartbeat_ms)))
            .with_retry(RetryPolicy {
                initial_interval: Duration::from_millis(a.initial_interval_ms),
                backoff_coefficient: a.backoff_coefficient,
                max_interval: Duration::from_millis(a.max_interval_ms),
                max_attempts: a.max_attempts,
                non_retryable_error_types: a.non_retryable_error_types.clone(),
            })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::with_activity_options(self.activity_options());
        config.execution_timeout = Duration::from_secs(self.engine.execution_timeout_secs);
        config.run_timeout = Duration::from_secs(self.engine.run_timeout_secs);
        config.key_scheme = self.engine.key_scheme;
        config
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            sync_wait_timeout: Duration::from_secs(self.orchestrator.sync_wait_timeout_secs),
            poll_interval: Duration::from_millis(self.orchestrator.poll_interval_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.recovery.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.recovery.stale_threshold_secs),
            batch_size: self.recovery.batch_size,
        }
    }
}
