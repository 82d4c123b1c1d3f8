//! WAL-backed audit store
//!
//! Durable fallback when no Postgres URL is configured. Every `open` and
//! `update` appends the full record snapshot as one frame; replay keeps the
//! last snapshot per record id. Reads are served from an in-memory
//! [`MemoryAuditStore`] rebuilt on open.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{
    AuditError, CompensationAudit, CompensationAuditStore, CompensationStats, CompensationUpdate,
    MemoryAuditStore, NewCompensation,
};
use crate::transfer::TransferId;
use crate::wal::{self, WalEntryType, WalWriter};

pub struct WalAuditStore {
    path: PathBuf,
    index: MemoryAuditStore,
    writer: Mutex<WalWriter<File>>,
    sync: bool,
}

impl WalAuditStore {
    /// Open the log at `path`, replaying every intact snapshot
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let (entries, writer) = wal::open_log(&path)?;

        let index = MemoryAuditStore::new();
        let mut snapshots = 0usize;
        for entry in entries {
            if WalEntryType::try_from(entry.header.entry_type)? != WalEntryType::CompensationAudit {
                return Err(AuditError::Storage(format!(
                    "unexpected WAL entry type {} in audit log",
                    entry.header.entry_type
                )));
            }
            let record: CompensationAudit = serde_json::from_slice(&entry.payload)?;
            index.restore(record);
            snapshots += 1;
        }

        info!(path = %path.display(), snapshots, "Compensation audit WAL replayed");
        Ok(Self {
            path,
            index,
            writer: Mutex::new(writer),
            sync,
        })
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.index = self.index.with_grace_period(grace);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot, then publish it. Caller holds the writer lock.
    fn write(
        &self,
        writer: &mut WalWriter<File>,
        record: &CompensationAudit,
    ) -> Result<(), AuditError> {
        let payload = serde_json::to_vec(record)?;
        writer.write_entry(WalEntryType::CompensationAudit, &payload)?;
        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_data()?;
        }
        self.index.restore(record.clone());
        Ok(())
    }

    fn lock_writer(&self) -> MutexGuard<'_, WalWriter<File>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CompensationAuditStore for WalAuditStore {
    async fn open(&self, new: NewCompensation) -> Result<CompensationAudit, AuditError> {
        let record = CompensationAudit::open(new, Utc::now());
        let mut writer = self.lock_writer();
        self.write(&mut writer, &record)?;
        debug!(audit_id = %record.id, transfer_id = %record.transfer_id, "Compensation audit opened");
        Ok(record)
    }

    async fn update(
        &self,
        transfer_id: &TransferId,
        update: CompensationUpdate,
    ) -> Result<CompensationAudit, AuditError> {
        let mut writer = self.lock_writer();
        let mut record = self
            .index
            .latest(transfer_id)
            .ok_or_else(|| AuditError::NotFound(transfer_id.to_string()))?;
        record.apply_update(&update, Utc::now())?;
        self.write(&mut writer, &record)?;
        Ok(record)
    }

    async fn by_transfer(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Vec<CompensationAudit>, AuditError> {
        self.index.by_transfer(transfer_id).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<CompensationAudit>, AuditError> {
        self.index.pending(limit).await
    }

    async fn stats(&self, window: Duration) -> Result<CompensationStats, AuditError> {
        self.index.stats(window).await
    }

    async fn ping(&self) -> Result<(), AuditError> {
        let writer = self.lock_writer();
        writer.get_ref().metadata()?;
        Ok(())
    }
}
