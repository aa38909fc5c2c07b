use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::ReplayBuffer;
use crate::config::EngineConfig;
use crate::deck::DeckDirectory;
use crate::gateway::close_code;
use crate::pty::{clamp_dimension, ExitStatus, Process, PtyError, SpawnOptions, Spawned, Spawner};
use crate::store::{PersistedSession, SessionStore, StoreWriter};

pub type SessionId = Uuid;

/// How long to keep draining output after the process reports exit, for
/// trailing bytes still in flight from the reader thread.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Identity of one attached viewer connection.
///
/// Kept separate from the transport so attach/detach and rate-limit
/// bookkeeping never need a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

impl ViewerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ViewerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Frames queued for a viewer's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerFrame {
    /// Terminal output (including the one-time replay on attach).
    Output(Bytes),
    /// Human-readable notice for this viewer only.
    Notice(String),
    /// The session ended; close the connection with this reason.
    Close(CloseReason),
}

/// Why a session-side close was sent to a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ProcessExited,
    Stopped,
    Reaped,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::ProcessExited | CloseReason::Stopped | CloseReason::Reaped => {
                close_code::NORMAL
            }
            CloseReason::Shutdown => close_code::AWAY,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::ProcessExited => "Terminal exited",
            CloseReason::Stopped => "Terminal stopped",
            CloseReason::Reaped => "Terminal idle timeout",
            CloseReason::Shutdown => "Server shutting down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Most recent write or resize failure.
    pub last_error: Option<String>,
}

/// A terminal recorded by an earlier run of the server. Only its last
/// output survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousSession {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub output: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("session is closed")]
    Closed,
    #[error("too many viewers (max {0})")]
    TooManyViewers(usize),
}

struct SessionState {
    buffer: ReplayBuffer,
    viewers: HashMap<ViewerId, mpsc::Sender<ViewerFrame>>,
    last_active: Instant,
    last_error: Option<String>,
    closed: bool,
}

impl SessionState {
    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.viewers.is_empty() && now.saturating_duration_since(self.last_active) > timeout
    }
}

/// Queue a frame for a viewer without touching the last free slot, which
/// is held back for the close frame. Viewer queues are created one larger
/// than the configured depth.
fn offer(tx: &mpsc::Sender<ViewerFrame>, frame: ViewerFrame) -> Result<(), TrySendError<ViewerFrame>> {
    if tx.capacity() <= 1 {
        return Err(TrySendError::Full(frame));
    }
    tx.try_send(frame)
}

/// One live shell process with its replay buffer and attached viewers.
///
/// Buffer, viewer set and activity time share one lock. Output is appended
/// and fanned out under it, and attach snapshots the buffer under it, so a
/// new viewer sees the replay exactly once and strictly before any later
/// output.
pub struct Session {
    pub id: SessionId,
    pub deck_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    seq: u64,
    process: Box<dyn Process>,
    state: Mutex<SessionState>,
    cancelled: CancellationToken,
    viewer_queue: usize,
    max_viewers: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("deck_id", &self.deck_id)
            .field("title", &self.title)
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        deck_id: String,
        title: String,
        seq: u64,
        process: Box<dyn Process>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            deck_id,
            title,
            created_at: Utc::now(),
            seq,
            process,
            state: Mutex::new(SessionState {
                buffer: ReplayBuffer::new(config.buffer_limit),
                viewers: HashMap::new(),
                last_active: Instant::now(),
                last_error: None,
                closed: false,
            }),
            cancelled: CancellationToken::new(),
            viewer_queue: config.viewer_queue.max(1),
            max_viewers: config.max_viewers_per_session,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            title: self.title.clone(),
            created_at: self.created_at,
            last_error: self.last_error(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Append a process output chunk to the buffer and send it to every
    /// current viewer.
    ///
    /// A viewer whose queue is full is dropped from the set; its transport
    /// sees the queue end without a close frame.
    pub fn publish(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.buffer.append(&chunk);
        state.last_active = Instant::now();

        let mut evicted = Vec::new();
        for (viewer, tx) in state.viewers.iter() {
            match offer(tx, ViewerFrame::Output(chunk.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => evicted.push(*viewer),
                // Transport already gone; its detach is on the way.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        for viewer in evicted {
            tracing::warn!(session = %self.id, %viewer, "viewer queue full, disconnecting");
            state.viewers.remove(&viewer);
        }
    }

    /// Register a viewer and queue the current buffer for it alone.
    pub fn attach(&self, viewer: ViewerId) -> Result<mpsc::Receiver<ViewerFrame>, AttachError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AttachError::Closed);
        }
        if state.viewers.len() >= self.max_viewers {
            return Err(AttachError::TooManyViewers(self.max_viewers));
        }
        let (tx, rx) = mpsc::channel(self.viewer_queue + 1);
        if !state.buffer.is_empty() {
            // Fresh queue with capacity >= 1; cannot be full.
            let _ = tx.try_send(ViewerFrame::Output(state.buffer.to_bytes()));
        }
        state.viewers.insert(viewer, tx);
        state.last_active = Instant::now();
        Ok(rx)
    }

    /// Remove a viewer. Returns whether it was attached.
    pub fn detach(&self, viewer: ViewerId) -> bool {
        let mut state = self.state.lock();
        state.last_active = Instant::now();
        state.viewers.remove(&viewer).is_some()
    }

    /// Queue a notice for one viewer. Dropped if its queue is full.
    pub fn notify(&self, viewer: ViewerId, text: impl Into<String>) {
        let state = self.state.lock();
        if let Some(tx) = state.viewers.get(&viewer) {
            let _ = offer(tx, ViewerFrame::Notice(text.into()));
        }
    }

    pub fn touch(&self) {
        self.state.lock().last_active = Instant::now();
    }

    /// Forward raw input to the process. Failures are logged and recorded
    /// as the session's last error.
    pub fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.process.write(data).inspect_err(|e| {
            tracing::warn!(session = %self.id, error = %e, "failed to write to terminal");
            self.record_error(e);
        })
    }

    /// Resize the terminal. Each dimension is clamped into `[1, 500]`.
    pub fn resize(&self, cols: f64, rows: f64) -> Result<(u16, u16), PtyError> {
        let cols = clamp_dimension(cols);
        let rows = clamp_dimension(rows);
        self.process
            .resize(cols, rows)
            .map(|()| (cols, rows))
            .inspect_err(|e| {
                tracing::warn!(session = %self.id, error = %e, "failed to resize terminal");
                self.record_error(e);
            })
    }

    fn record_error(&self, e: &PtyError) {
        self.state.lock().last_error = Some(e.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.state.lock().viewers.len()
    }

    pub fn last_active(&self) -> Instant {
        self.state.lock().last_active
    }

    /// No viewers attached and idle for longer than `timeout` as of `now`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.state.lock().is_idle(now, timeout)
    }

    pub fn buffer(&self) -> Bytes {
        self.state.lock().buffer.to_bytes()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close every viewer with `reason`, stop the output pump and kill the
    /// process. Only the first call has any effect.
    fn close(&self, reason: CloseReason) {
        self.close_if(reason, |_| true);
    }

    /// Close for reaping, but only if the session is idle with no viewers.
    /// The check and the close happen under the lock `attach` takes, so a
    /// viewer either attaches first and keeps the session alive or finds it
    /// closed.
    fn close_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.close_if(CloseReason::Reaped, |state| state.is_idle(now, timeout))
    }

    fn close_if(&self, reason: CloseReason, pred: impl FnOnce(&SessionState) -> bool) -> bool {
        let viewers = {
            let mut state = self.state.lock();
            if state.closed || !pred(&*state) {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.viewers)
        };
        for (_, tx) in viewers {
            // Lands in the reserved slot.
            let _ = tx.try_send(ViewerFrame::Close(reason));
        }
        self.cancelled.cancel();
        self.process.kill();
        true
    }

    fn persisted(&self) -> PersistedSession {
        PersistedSession {
            id: self.id.to_string(),
            deck_id: self.deck_id.clone(),
            title: self.title.clone(),
            buffer: self.buffer().to_vec(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("deck not found: {0}")]
    DeckNotFound(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("failed to spawn terminal: {0}")]
    Spawn(#[from] PtyError),
}

struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    decks: Arc<dyn DeckDirectory>,
    spawner: Arc<dyn Spawner>,
    store: StoreWriter,
    config: EngineConfig,
    shell: String,
    next_seq: AtomicU64,
    /// Last spawn failure per deck, surfaced as a status field.
    last_errors: Mutex<HashMap<String, String>>,
    /// Terminals left over from the previous run, by deck.
    previous: Mutex<HashMap<String, Vec<PreviousSession>>>,
    draining: AtomicBool,
}

/// The authoritative table of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Must be called from within a tokio runtime; store writes run on a
    /// background task.
    pub fn new(
        config: EngineConfig,
        decks: Arc<dyn DeckDirectory>,
        spawner: Arc<dyn Spawner>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let shell = config.shell.clone().unwrap_or_else(crate::shell::resolve);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                decks,
                spawner,
                store: StoreWriter::spawn(store),
                config,
                shell,
                next_seq: AtomicU64::new(0),
                last_errors: Mutex::new(HashMap::new()),
                previous: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn shell(&self) -> &str {
        &self.inner.shell
    }

    /// Create a session for `deck_id`, spawning its shell in the deck root.
    ///
    /// Nothing is spawned or inserted when the deck is unknown. A spawn
    /// failure is recorded as the deck's last error.
    pub fn create(&self, deck_id: &str, title: Option<String>) -> Result<SessionInfo, RegistryError> {
        let deck = self
            .inner
            .decks
            .resolve(deck_id)
            .ok_or_else(|| RegistryError::DeckNotFound(deck_id.to_string()))?;

        if self.inner.draining.load(Ordering::Acquire)
            || self.len() >= self.inner.config.max_sessions
        {
            return Err(RegistryError::MaxSessionsReached);
        }

        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let opts = SpawnOptions {
            shell: self.inner.shell.clone(),
            cwd: Some(deck.root.clone()),
            cols: self.inner.config.default_cols,
            rows: self.inner.config.default_rows,
            env: HashMap::new(),
        };
        let Spawned { process, output, exit } = match self.inner.spawner.spawn(&opts) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(deck = %deck_id, shell = %opts.shell, error = %e, "failed to spawn terminal");
                self.inner
                    .last_errors
                    .lock()
                    .insert(deck_id.to_string(), e.to_string());
                return Err(e.into());
            }
        };
        self.inner.last_errors.lock().remove(deck_id);

        // Default titles count the deck's sessions under the same lock as
        // the insert, so concurrent creates never share a number.
        let session = {
            let mut sessions = self.inner.sessions.write();
            if sessions.len() >= self.inner.config.max_sessions {
                drop(sessions);
                process.kill();
                return Err(RegistryError::MaxSessionsReached);
            }
            let title = title.unwrap_or_else(|| {
                let n = sessions.values().filter(|s| s.deck_id == deck.id).count();
                format!("Terminal {}", n + 1)
            });
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            let session = Arc::new(Session::new(
                deck.id.clone(),
                title,
                seq,
                process,
                &self.inner.config,
            ));
            sessions.insert(session.id, session.clone());
            session
        };

        self.inner.store.save(session.persisted());

        tokio::spawn(run_output_pump(
            Arc::downgrade(&self.inner),
            session.clone(),
            output,
            exit,
        ));

        tracing::info!(
            session = %session.id,
            deck = %session.deck_id,
            title = %session.title,
            pid = ?session.pid(),
            "terminal created"
        );

        Ok(session.info())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Look up a session by its textual id. Malformed ids are simply absent.
    pub fn get_str(&self, id: &str) -> Option<Arc<Session>> {
        Uuid::parse_str(id).ok().and_then(|id| self.get(&id))
    }

    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.get(id).map(|s| s.info())
    }

    /// Sessions of one deck, oldest first.
    pub fn list(&self, deck_id: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|s| s.deck_id == deck_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.created_at, s.seq));
        sessions.iter().map(|s| s.info()).collect()
    }

    /// Snapshot of every live session id.
    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose a session: close its viewers, stop its output pump, kill the
    /// process, and forget it. Returns false if the id was already gone.
    pub fn remove(&self, id: &SessionId, reason: CloseReason) -> bool {
        let Some(session) = self.inner.sessions.write().remove(id) else {
            return false;
        };
        session.close(reason);
        self.forget(&session, reason);
        true
    }

    /// Reap a session if it has no viewers and has been idle for longer
    /// than `timeout` as of `now`. Returns whether it was removed.
    pub fn reap_if_idle(&self, id: &SessionId, now: Instant, timeout: Duration) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !session.close_if_idle(now, timeout) {
            return false;
        }
        // A concurrent remove that already took the entry does the cleanup.
        if self.inner.sessions.write().remove(id).is_none() {
            return false;
        }
        self.forget(&session, CloseReason::Reaped);
        true
    }

    fn forget(&self, session: &Session, reason: CloseReason) {
        // Records of sessions cut short by shutdown are kept with their last
        // buffer; every other ending forgets the record.
        if reason != CloseReason::Shutdown {
            self.inner.store.delete(session.id.to_string());
        }
        tracing::info!(session = %session.id, deck = %session.deck_id, ?reason, "terminal removed");
    }

    /// Explicit stop request.
    pub fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let session = self
            .get_str(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if self.remove(&session.id, CloseReason::Stopped) {
            Ok(())
        } else {
            Err(RegistryError::NotFound(id.to_string()))
        }
    }

    /// Stop every session of a deck and forget its previous-run records.
    /// Returns how many live sessions were stopped.
    pub fn remove_deck(&self, deck_id: &str) -> usize {
        self.inner.previous.lock().remove(deck_id);
        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|s| s.deck_id == deck_id)
            .map(|s| s.id)
            .collect();
        ids.iter()
            .filter(|id| self.remove(id, CloseReason::Stopped))
            .count()
    }

    /// Last spawn error recorded for a deck, cleared by the next success.
    pub fn last_error(&self, deck_id: &str) -> Option<String> {
        self.inner.last_errors.lock().get(deck_id).cloned()
    }

    /// Queue every live buffer for writing through to the store.
    pub fn snapshot_buffers(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        for session in sessions {
            self.inner
                .store
                .update_buffer(session.id.to_string(), session.buffer());
        }
    }

    /// Wait for all queued store writes to finish.
    pub async fn flush_store(&self) {
        self.inner.store.flush().await;
    }

    /// Keep records from an earlier run around for display.
    pub fn restore_previous(&self, records: Vec<PersistedSession>) {
        let mut previous = self.inner.previous.lock();
        for row in records {
            previous.entry(row.deck_id).or_default().push(PreviousSession {
                id: row.id,
                title: row.title,
                created_at: row.created_at,
                output: String::from_utf8_lossy(&row.buffer).into_owned(),
            });
        }
        for rows in previous.values_mut() {
            rows.sort_by_key(|r| r.created_at);
        }
    }

    /// Terminals of a deck from the previous run, oldest first.
    pub fn previous(&self, deck_id: &str) -> Vec<PreviousSession> {
        self.inner
            .previous
            .lock()
            .get(deck_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot buffers, then remove every session, keeping their store
    /// records. New creates are refused from here on.
    pub fn drain(&self) -> usize {
        self.inner.draining.store(true, Ordering::Release);
        self.snapshot_buffers();
        let ids = self.ids();
        ids.iter()
            .filter(|id| self.remove(id, CloseReason::Shutdown))
            .count()
    }
}

/// Drive one session's output into its buffer and viewers until the process
/// exits or the session is removed.
async fn run_output_pump(
    registry: Weak<RegistryInner>,
    session: Arc<Session>,
    mut output: mpsc::Receiver<Bytes>,
    mut exit: oneshot::Receiver<ExitStatus>,
) {
    let cancelled = session.cancelled.clone();
    let status = loop {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => return,
            chunk = output.recv() => match chunk {
                Some(data) => session.publish(data),
                None => {
                    tokio::select! {
                        _ = cancelled.cancelled() => return,
                        status = &mut exit => break status.ok(),
                    }
                }
            },
            status = &mut exit => {
                let drain = async {
                    while let Some(data) = output.recv().await {
                        session.publish(data);
                    }
                };
                let _ = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain).await;
                break status.ok();
            }
        }
    };

    tracing::info!(session = %session.id, code = ?status.map(|s| s.code), "terminal process exited");
    if let Some(inner) = registry.upgrade() {
        SessionRegistry { inner }.remove(&session.id, CloseReason::ProcessExited);
    }
}
