//! In-process audit store
//!
//! Used directly by tests, and as the index behind [`super::WalAuditStore`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::{
    AuditError, CompensationAudit, CompensationAuditStore, CompensationStats, CompensationUpdate,
    DEFAULT_PENDING_GRACE, NewCompensation, window_start,
};
use crate::transfer::TransferId;

pub struct MemoryAuditStore {
    /// Records per transfer, oldest first
    records: DashMap<TransferId, Vec<CompensationAudit>>,
    pending_grace: Duration,
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            pending_grace: DEFAULT_PENDING_GRACE,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.pending_grace = grace;
        self
    }

    /// Newest record of a transfer
    pub(crate) fn latest(&self, transfer_id: &TransferId) -> Option<CompensationAudit> {
        self.records
            .get(transfer_id)
            .and_then(|v| v.last().cloned())
    }

    /// Insert a record, or replace the stored record with the same id
    pub(crate) fn restore(&self, record: CompensationAudit) {
        let mut entry = self.records.entry(record.transfer_id).or_default();
        match entry.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => entry.push(record),
        }
    }

    fn all(&self) -> Vec<CompensationAudit> {
        self.records
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }
}

#[async_trait]
impl CompensationAuditStore for MemoryAuditStore {
    async fn open(&self, new: NewCompensation) -> Result<CompensationAudit, AuditError> {
        let record = CompensationAudit::open(new, Utc::now());
        debug!(audit_id = %record.id, transfer_id = %record.transfer_id, "Compensation audit opened");
        self.records
            .entry(record.transfer_id)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        transfer_id: &TransferId,
        update: CompensationUpdate,
    ) -> Result<CompensationAudit, AuditError> {
        let mut entry = self
            .records
            .get_mut(transfer_id)
            .ok_or_else(|| AuditError::NotFound(transfer_id.to_string()))?;
        let record = entry
            .last_mut()
            .ok_or_else(|| AuditError::NotFound(transfer_id.to_string()))?;
        record.apply_update(&update, Utc::now())?;
        Ok(record.clone())
    }

    async fn by_transfer(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Vec<CompensationAudit>, AuditError> {
        Ok(self
            .records
            .get(transfer_id)
            .map(|v| v.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<CompensationAudit>, AuditError> {
        let now = Utc::now();
        let mut out: Vec<_> = self
            .all()
            .into_iter()
            .filter(|r| r.is_pending_attention(now, self.pending_grace))
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn stats(&self, window: Duration) -> Result<CompensationStats, AuditError> {
        let since = window_start(Utc::now(), window);
        let records = self.all();
        Ok(CompensationStats::from_records(
            records.iter().filter(|r| r.created_at >= since),
            window,
        ))
    }
}
