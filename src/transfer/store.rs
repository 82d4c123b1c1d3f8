//! Saga event store
//!
//! Every saga transition is appended here before the engine acts on it. The
//! store keeps the ordered event stream per transfer plus the folded
//! `SagaState`, so reads never replay.
//!
//! - `MemorySagaStore`: process-local, for tests
//! - `WalSagaStore`: same index backed by the framed WAL, rebuilt on open

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use super::error::TransferError;
use super::state::{SagaEnvelope, SagaEvent, SagaState};
use super::types::{TransferId, TransferRequest};
use crate::wal::{self, WalEntryType, WalWriter};

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Create the saga unless it exists. Returns the current state and whether
    /// this call created it.
    async fn create_if_absent(
        &self,
        transfer_id: TransferId,
        request: &TransferRequest,
    ) -> Result<(SagaState, bool), TransferError>;

    /// Append one event to an existing saga and return the folded state
    async fn append(
        &self,
        transfer_id: TransferId,
        event: SagaEvent,
    ) -> Result<SagaState, TransferError>;

    async fn load(&self, transfer_id: &TransferId) -> Result<Option<SagaState>, TransferError>;

    /// Full event stream in append order
    async fn events(&self, transfer_id: &TransferId) -> Result<Vec<SagaEnvelope>, TransferError>;

    async fn non_terminal(&self) -> Result<Vec<SagaState>, TransferError>;

    /// Reachability
    async fn ping(&self) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Folded states and raw streams
#[derive(Default)]
struct SagaIndex {
    states: DashMap<TransferId, SagaState>,
    streams: DashMap<TransferId, Vec<SagaEnvelope>>,
}

impl SagaIndex {
    /// Fold a replayed or freshly written envelope
    fn ingest(&self, env: SagaEnvelope) -> Option<SagaState> {
        let id = env.transfer_id;
        let state = match self.states.entry(id) {
            Entry::Occupied(mut o) => {
                o.get_mut().apply(&env);
                o.get().clone()
            }
            Entry::Vacant(v) => {
                let state = SagaState::replay(std::iter::once(&env))?;
                v.insert(state.clone());
                state
            }
        };
        self.streams.entry(id).or_default().push(env);
        Some(state)
    }

    fn contains(&self, id: &TransferId) -> bool {
        self.states.contains_key(id)
    }

    fn load(&self, id: &TransferId) -> Option<SagaState> {
        self.states.get(id).map(|s| s.clone())
    }

    fn events(&self, id: &TransferId) -> Vec<SagaEnvelope> {
        self.streams.get(id).map(|s| s.clone()).unwrap_or_default()
    }

    fn non_terminal(&self) -> Vec<SagaState> {
        let mut out: Vec<_> = self
            .states
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.updated_at);
        out
    }
}

fn created(transfer_id: TransferId, request: &TransferRequest) -> SagaEnvelope {
    SagaEnvelope::now(
        transfer_id,
        SagaEvent::Created {
            request: request.clone(),
        },
    )
}

/// In-memory saga store
#[derive(Default)]
pub struct MemorySagaStore {
    index: SagaIndex,
    /// Serialises check-then-create
    create_lock: Mutex<()>,
}

impl MemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for MemorySagaStore {
    async fn create_if_absent(
        &self,
        transfer_id: TransferId,
        request: &TransferRequest,
    ) -> Result<(SagaState, bool), TransferError> {
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = self.index.load(&transfer_id) {
            return Ok((existing, false));
        }
        let state = self
            .index
            .ingest(created(transfer_id, request))
            .ok_or_else(|| TransferError::SystemError("created event not folded".into()))?;
        Ok((state, true))
    }

    async fn append(
        &self,
        transfer_id: TransferId,
        event: SagaEvent,
    ) -> Result<SagaState, TransferError> {
        if !self.index.contains(&transfer_id) {
            return Err(TransferError::TransferNotFound(transfer_id.to_string()));
        }
        self.index
            .ingest(SagaEnvelope::now(transfer_id, event))
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))
    }

    async fn load(&self, transfer_id: &TransferId) -> Result<Option<SagaState>, TransferError> {
        Ok(self.index.load(transfer_id))
    }

    async fn events(&self, transfer_id: &TransferId) -> Result<Vec<SagaEnvelope>, TransferError> {
        Ok(self.index.events(transfer_id))
    }

    async fn non_terminal(&self) -> Result<Vec<SagaState>, TransferError> {
        Ok(self.index.non_terminal())
    }
}

/// WAL-backed saga store
///
/// An append returns only after the frame reached the file (and the disk,
/// when `sync` is set).
pub struct WalSagaStore {
    path: PathBuf,
    index: SagaIndex,
    writer: Mutex<WalWriter<File>>,
    sync: bool,
}

impl WalSagaStore {
    /// Open the log at `path`, replaying every intact frame
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let (entries, writer) = wal::open_log(&path)?;

        let index = SagaIndex::default();
        let mut replayed = 0usize;
        for entry in entries {
            if WalEntryType::try_from(entry.header.entry_type)? != WalEntryType::SagaEvent {
                return Err(TransferError::StorageError(format!(
                    "unexpected WAL entry type {} in saga log",
                    entry.header.entry_type
                )));
            }
            let env: SagaEnvelope = bincode::deserialize(&entry.payload)?;
            index.ingest(env);
            replayed += 1;
        }

        info!(
            path = %path.display(),
            events = replayed,
            sagas = index.states.len(),
            in_flight = index.non_terminal().len(),
            "Saga WAL replayed"
        );

        Ok(Self {
            path,
            index,
            writer: Mutex::new(writer),
            sync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist then fold. Caller holds the writer lock.
    fn write(
        &self,
        writer: &mut WalWriter<File>,
        env: SagaEnvelope,
    ) -> Result<SagaState, TransferError> {
        let payload = bincode::serialize(&env)?;
        writer.write_entry(WalEntryType::SagaEvent, &payload)?;
        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_data()?;
        }
        let id = env.transfer_id;
        self.index
            .ingest(env)
            .ok_or_else(|| TransferError::TransferNotFound(id.to_string()))
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, WalWriter<File>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SagaStore for WalSagaStore {
    async fn create_if_absent(
        &self,
        transfer_id: TransferId,
        request: &TransferRequest,
    ) -> Result<(SagaState, bool), TransferError> {
        let mut writer = self.lock_writer();
        if let Some(existing) = self.index.load(&transfer_id) {
            return Ok((existing, false));
        }
        let state = self.write(&mut writer, created(transfer_id, request))?;
        Ok((state, true))
    }

    async fn append(
        &self,
        transfer_id: TransferId,
        event: SagaEvent,
    ) -> Result<SagaState, TransferError> {
        let mut writer = self.lock_writer();
        if !self.index.contains(&transfer_id) {
            return Err(TransferError::TransferNotFound(transfer_id.to_string()));
        }
        self.write(&mut writer, SagaEnvelope::now(transfer_id, event))
    }

    async fn load(&self, transfer_id: &TransferId) -> Result<Option<SagaState>, TransferError> {
        Ok(self.index.load(transfer_id))
    }

    async fn events(&self, transfer_id: &TransferId) -> Result<Vec<SagaEnvelope>, TransferError> {
        Ok(self.index.events(transfer_id))
    }

    async fn non_terminal(&self) -> Result<Vec<SagaState>, TransferError> {
        Ok(self.index.non_terminal())
    }

    async fn ping(&self) -> Result<(), TransferError> {
        let writer = self.lock_writer();
        writer.get_ref().metadata()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::state::SagaPhase;

    fn request(request_id: &str) -> TransferRequest {
        TransferRequest {
            from_account: "ACC000000001".into(),
            to_account: "ACC000000002".into(),
            amount: 1_000,
            currency: "EUR".into(),
            description: "rent".into(),
            reference_id: "INV-1".into(),
            request_id: request_id.into(),
        }
    }

    fn temp_wal(name: &str) -> PathBuf {
        let dir = format!("target/test_saga_store_{}_{}", name, std::process::id());
        let _ = std::fs::remove_dir_all(&dir);
        PathBuf::from(dir).join("saga.wal")
    }

    #[tokio::test]
    async fn test_create_if_absent_attaches() {
        let store = MemorySagaStore::new();
        let id = TransferId::from_request_id("req-1");
        let (s1, created1) = store.create_if_absent(id, &request("req-1")).await.unwrap();
        let (s2, created2) = store.create_if_absent(id, &request("req-1")).await.unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(s1.transfer_id, s2.transfer_id);
        assert_eq!(s1.phase, SagaPhase::New);
        assert_eq!(store.events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_unknown_saga() {
        let store = MemorySagaStore::new();
        let err = store
            .append(
                TransferId::from_request_id("ghost"),
                SagaEvent::PhaseChanged {
                    phase: SagaPhase::Checking,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TransferNotFound(_)));
    }

    #[tokio::test]
    async fn test_non_terminal_listing() {
        let store = MemorySagaStore::new();
        let a = TransferId::from_request_id("a");
        let b = TransferId::from_request_id("b");
        store.create_if_absent(a, &request("a")).await.unwrap();
        store.create_if_absent(b, &request("b")).await.unwrap();
        store
            .append(
                b,
                SagaEvent::Finished {
                    phase: SagaPhase::Completed,
                    error_code: None,
                    error_message: None,
                },
            )
            .await
            .unwrap();

        let open = store.non_terminal().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].transfer_id, a);
    }

    #[tokio::test]
    async fn test_wal_store_replays_after_reopen() {
        let path = temp_wal("reopen");
        let id = TransferId::from_request_id("req-wal");
        {
            let store = WalSagaStore::open(&path, true).unwrap();
            store.create_if_absent(id, &request("req-wal")).await.unwrap();
            store
                .append(id, SagaEvent::RunStarted { run_id: "run-a".into() })
                .await
                .unwrap();
            store
                .append(
                    id,
                    SagaEvent::PhaseChanged {
                        phase: SagaPhase::Debiting,
                    },
                )
                .await
                .unwrap();
            store
                .append(id, SagaEvent::Debited { tx_id: "ltx_1".into() })
                .await
                .unwrap();
        }

        let store = WalSagaStore::open(&path, true).unwrap();
        let state = store.load(&id).await.unwrap().unwrap();
        assert_eq!(state.phase, SagaPhase::Debiting);
        assert_eq!(state.run_id, "run-a");
        assert_eq!(state.debit_tx_id.as_deref(), Some("ltx_1"));
        assert_eq!(state.request.reference_id, "INV-1");
        assert_eq!(store.events(&id).await.unwrap().len(), 4);
        assert_eq!(store.non_terminal().await.unwrap().len(), 1);

        // Appends continue after the replayed tail
        store
            .append(
                id,
                SagaEvent::Finished {
                    phase: SagaPhase::Completed,
                    error_code: None,
                    error_message: None,
                },
            )
            .await
            .unwrap();
        drop(store);
        let store = WalSagaStore::open(&path, false).unwrap();
        assert!(store.load(&id).await.unwrap().unwrap().is_terminal());
        assert!(store.ping().await.is_ok());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
