//! Persistence boundary for session metadata and replay buffers.
//!
//! The engine only ever calls out through [`SessionStore`]. A restart does
//! not resume processes; stored buffers exist so a host can show the last
//! output of a terminal that is gone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::buffer::ReplayBuffer;
use crate::deck::DeckDirectory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("store encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: String,
    pub deck_id: String,
    pub title: String,
    #[serde(with = "base64_bytes")]
    pub buffer: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

pub trait SessionStore: Send + Sync {
    fn save(&self, session: &PersistedSession) -> Result<(), StoreError>;
    fn update_buffer(&self, id: &str, buffer: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    fn load_all(&self) -> Result<Vec<PersistedSession>, StoreError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl SessionStore for NullStore {
    fn save(&self, _session: &PersistedSession) -> Result<(), StoreError> {
        Ok(())
    }

    fn update_buffer(&self, _id: &str, _buffer: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete(&self, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedSession>, StoreError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, PersistedSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<PersistedSession> {
        self.rows.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        self.rows.lock().insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn update_buffer(&self, id: &str, buffer: &[u8]) -> Result<(), StoreError> {
        if let Some(row) = self.rows.lock().get_mut(id) {
            row.buffer = buffer.to_vec();
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.rows.lock().remove(id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedSession>, StoreError> {
        let mut rows: Vec<_> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}

/// One JSON document per session under a state directory.
#[derive(Debug)]
pub struct JsonDirStore {
    dir: PathBuf,
    // Serializes read-modify-write of individual files.
    lock: Mutex<()>,
}

impl JsonDirStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(dir.clone(), e))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Ids are generated UUIDs; anything else is flattened so it cannot
        // escape the directory.
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn write_row(&self, row: &PersistedSession) -> Result<(), StoreError> {
        let path = self.path_for(&row.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(row)?;
        std::fs::write(&tmp, body).map_err(|e| StoreError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io(path.clone(), e))
    }

    fn read_row(path: &Path) -> Result<PersistedSession, StoreError> {
        let body = std::fs::read(path).map_err(|e| StoreError::Io(path.to_path_buf(), e))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl SessionStore for JsonDirStore {
    fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        self.write_row(session)
    }

    fn update_buffer(&self, id: &str, buffer: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(());
        }
        let mut row = Self::read_row(&path)?;
        row.buffer = buffer.to_vec();
        self.write_row(&row)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(path, e)),
        }
    }

    fn load_all(&self) -> Result<Vec<PersistedSession>, StoreError> {
        let _guard = self.lock.lock();
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| StoreError::Io(self.dir.clone(), e))?;
        let mut rows = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_row(&path) {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session record"),
            }
        }
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}

enum StoreOp {
    Save(PersistedSession),
    UpdateBuffer { id: String, buffer: Bytes },
    Delete(String),
}

impl StoreOp {
    fn apply(self, store: &dyn SessionStore) {
        let (id, action, result) = match self {
            StoreOp::Save(row) => {
                let result = store.save(&row);
                (row.id, "persist session", result)
            }
            StoreOp::UpdateBuffer { id, buffer } => {
                let result = store.update_buffer(&id, &buffer);
                (id, "snapshot buffer", result)
            }
            StoreOp::Delete(id) => {
                let result = store.delete(&id);
                (id, "delete persisted session", result)
            }
        };
        if let Err(e) = result {
            tracing::warn!(session = %id, error = %e, "failed to {action}");
        }
    }
}

enum WriterMsg {
    Op(StoreOp),
    Flush(oneshot::Sender<()>),
}

/// Hands store calls to a background task that runs them on the blocking
/// pool one at a time, in submission order. Callers never wait on I/O.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl StoreWriter {
    /// Start the writer task. Must be called from within a tokio runtime.
    /// The task ends once every `StoreWriter` clone is dropped.
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMsg>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Op(op) => {
                        let store = store.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || op.apply(&*store)).await {
                            tracing::error!(error = %e, "session store task failed");
                        }
                    }
                    WriterMsg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    fn submit(&self, op: StoreOp) {
        if self.tx.send(WriterMsg::Op(op)).is_err() {
            tracing::warn!("session store writer has stopped");
        }
    }

    pub fn save(&self, row: PersistedSession) {
        self.submit(StoreOp::Save(row));
    }

    pub fn update_buffer(&self, id: String, buffer: Bytes) {
        self.submit(StoreOp::UpdateBuffer { id, buffer });
    }

    pub fn delete(&self, id: String) {
        self.submit(StoreOp::Delete(id));
    }

    /// Wait until everything submitted so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Clear out the records a previous run left behind.
///
/// Every record is deleted from the store. Records whose deck still exists
/// are returned, buffers trimmed to `buffer_limit`, so their last output can
/// still be shown; the rest are dropped.
pub fn reconcile(
    store: &dyn SessionStore,
    decks: &dyn DeckDirectory,
    buffer_limit: usize,
) -> Result<Vec<PersistedSession>, StoreError> {
    let mut kept = Vec::new();
    for mut row in store.load_all()? {
        store.delete(&row.id)?;
        if decks.resolve(&row.deck_id).is_none() {
            tracing::info!(session = %row.id, deck = %row.deck_id, "dropping record for unknown deck");
            continue;
        }
        row.buffer = ReplayBuffer::with_contents(buffer_limit, &row.buffer)
            .to_bytes()
            .to_vec();
        kept.push(row);
    }
    Ok(kept)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
