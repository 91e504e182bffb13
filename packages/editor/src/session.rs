//! # Document Session
//!
//! Per-open-document controller. A session owns the editing surface, a
//! [`ChangeAggregator`] and the submissions it has handed to the
//! [`SaveCoordinator`].
//!
//! ```text
//!   SessionHandle (Clone)      mpsc       session task
//!   ┌────────────────────┐  ────────▶  ┌──────────────────────────────┐
//!   │ .record_changes()  │             │ ChangeAggregator (debounce)  │
//!   │ .save_now()        │             │ InitialLoad guard            │
//!   │ .retry()           │  ◀────────  │ outstanding SaveTickets      │
//!   │ .close()           │ watch/bcast │                              │
//!   └────────────────────┘             └──────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! `Initializing → Ready → (Saving ⇄ Ready) → Closed`
//!
//! The initial snapshot is loaded into the surface at most once. A safety
//! timeout moves a slow session to `Ready` without cancelling the read; a
//! read that lands later is only applied if the user has not edited yet.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use sketchpad_common::DocumentData;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::aggregator::{ChangeAggregator, DebounceConfig};
use crate::changes::{ChangeBatch, ChangeClass};
use crate::coordinator::{SaveCoordinator, SaveIntent, SaveResult};
use crate::{EditingSurface, SaveError, SessionError, SurfaceError};

/// Timing knobs for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub debounce: DebounceConfig,

    /// Ceiling on the `Initializing` state
    pub load_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            load_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Saving,
    Closed,
}

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial snapshot applied to the surface
    Loaded,
    LoadFailed { error: String },
    /// The safety timeout forced `Ready` before the read completed
    LoadTimedOut,
    Saved { updated_at: Option<DateTime<Utc>> },
    SaveFailed { error: SaveError, retryable: bool },
}

/// Result of an attempt to apply the initial snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded,
    /// Already applied once, nothing done
    AlreadyLoaded,
    /// The user edited before the snapshot arrived, snapshot discarded
    SkippedAfterEdit,
    Failed(SurfaceError),
}

/// Write-once-before-first-edit guard for the initial snapshot
#[derive(Debug, Default)]
pub struct InitialLoad {
    loaded: bool,
    edited: bool,
}

impl InitialLoad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the user changed the surface
    pub fn mark_edited(&mut self) {
        self.edited = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn apply(
        &mut self,
        surface: &mut dyn EditingSurface,
        snapshot: &DocumentData,
    ) -> LoadOutcome {
        if self.loaded {
            return LoadOutcome::AlreadyLoaded;
        }
        if self.edited {
            return LoadOutcome::SkippedAfterEdit;
        }

        match surface.load_snapshot(snapshot) {
            Ok(()) => {
                self.loaded = true;
                LoadOutcome::Loaded
            }
            Err(e) => LoadOutcome::Failed(e),
        }
    }
}

enum SessionCommand {
    Changes(ChangeBatch),
    SaveNow,
    Retry,
    Rename(String),
    SurfaceMounted,
    Close { reply: oneshot::Sender<()> },
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    document_id: Arc<str>,
    tx: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).map_err(|_| SessionError::Closed)
    }

    /// Forward a change notification from the canvas
    pub fn record_changes(&self, batch: ChangeBatch) -> Result<(), SessionError> {
        self.send(SessionCommand::Changes(batch))
    }

    /// Persist the current snapshot immediately, skipping the debounce
    pub fn save_now(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::SaveNow)
    }

    /// Save the current snapshot after a failed save. No-op without a failure.
    pub fn retry(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Retry)
    }

    /// Change the title; it is sent with this and every later save
    pub fn rename(&self, title: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::Rename(title.into()))
    }

    /// The canvas (re)mounted and asks for the initial snapshot
    pub fn surface_mounted(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::SurfaceMounted)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Cancel pending debounce work and stop the session
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(SessionCommand::Close { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

type InFlight = BoxFuture<'static, (u64, SaveResult)>;

pub struct DocumentSession<S: EditingSurface> {
    document_id: String,
    surface: S,
    coordinator: SaveCoordinator,
    config: SessionConfig,
    aggregator: ChangeAggregator,
    initial_load: InitialLoad,
    initial_snapshot: Option<DocumentData>,
    title: Option<String>,
    /// Renamed while still initializing; saved once ready
    rename_pending: bool,
    in_flight: FuturesUnordered<InFlight>,
    latest_seq: u64,
    retry_pending: bool,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl<S: EditingSurface> DocumentSession<S> {
    /// Spawn a session for `document_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        document_id: impl Into<String>,
        surface: S,
        coordinator: SaveCoordinator,
        config: SessionConfig,
    ) -> SessionHandle {
        let document_id = document_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Initializing);
        let (events, _) = broadcast::channel(64);

        let session = Self {
            document_id: document_id.clone(),
            surface,
            coordinator,
            config,
            aggregator: ChangeAggregator::new(config.debounce),
            initial_load: InitialLoad::new(),
            initial_snapshot: None,
            title: None,
            rename_pending: false,
            in_flight: FuturesUnordered::new(),
            latest_seq: 0,
            retry_pending: false,
            state: state_tx,
            events: events.clone(),
        };

        tracing::info!(document_id = %document_id, "Opening document session");
        tokio::spawn(session.run(rx));

        SessionHandle {
            document_id: document_id.into(),
            tx,
            state: state_rx,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let coordinator = self.coordinator.clone();
        let document_id = self.document_id.clone();
        let mut initial_read: BoxFuture<'static, DocumentData> =
            Box::pin(async move { coordinator.load(&document_id).await });
        let mut read_pending = true;
        let load_deadline = Instant::now() + self.config.load_timeout;

        loop {
            let initializing = self.current_state() == SessionState::Initializing;
            let debounce = self.aggregator.deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        self.close();
                        break;
                    }
                },
                snapshot = &mut initial_read, if read_pending => {
                    read_pending = false;
                    self.on_initial_read(snapshot);
                }
                _ = sleep_until(load_deadline), if initializing => {
                    tracing::warn!(
                        document_id = %self.document_id,
                        "Initial load timed out, continuing without snapshot"
                    );
                    self.become_ready();
                    self.emit(SessionEvent::LoadTimedOut);
                }
                _ = sleep_until(debounce.unwrap_or(load_deadline)), if debounce.is_some() => {
                    self.fire();
                }
                Some((seq, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_save_result(seq, result);
                }
            }
        }

        tracing::info!(document_id = %self.document_id, "Document session closed");
    }

    fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Changes(batch) => self.on_changes(batch),
            SessionCommand::SaveNow => {
                if self.accepts_saves() {
                    self.save_current();
                }
            }
            SessionCommand::Retry => {
                if !self.retry_pending {
                    tracing::debug!(document_id = %self.document_id, "Nothing to retry");
                } else if self.accepts_saves() {
                    tracing::info!(document_id = %self.document_id, "Retrying failed save");
                    self.retry_pending = false;
                    self.save_current();
                }
            }
            SessionCommand::Rename(title) => {
                self.title = Some(title);
                if self.accepts_saves() {
                    self.save_current();
                } else if self.current_state() == SessionState::Initializing {
                    self.rename_pending = true;
                }
            }
            SessionCommand::SurfaceMounted => {
                if let Some(snapshot) = self.initial_snapshot.clone() {
                    self.load_initial(&snapshot);
                }
            }
            SessionCommand::Close { reply } => {
                self.close();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_changes(&mut self, batch: ChangeBatch) {
        if !self.accepts_saves() {
            tracing::debug!(
                document_id = %self.document_id,
                state = ?self.current_state(),
                "Ignoring changes before the session is ready"
            );
            return;
        }

        if batch.classify() != ChangeClass::Irrelevant {
            self.initial_load.mark_edited();
        }
        self.aggregator.observe(&batch, Instant::now());
    }

    fn on_initial_read(&mut self, snapshot: DocumentData) {
        self.initial_snapshot = Some(snapshot.clone());
        self.load_initial(&snapshot);

        if self.current_state() == SessionState::Initializing {
            self.become_ready();
        }
    }

    fn become_ready(&mut self) {
        self.set_state(SessionState::Ready);
        if std::mem::take(&mut self.rename_pending) {
            tracing::debug!(document_id = %self.document_id, "Saving title set while loading");
            self.save_current();
        }
    }

    fn load_initial(&mut self, snapshot: &DocumentData) {
        match self.initial_load.apply(&mut self.surface, snapshot) {
            LoadOutcome::Loaded => {
                tracing::info!(
                    document_id = %self.document_id,
                    shapes = snapshot.shapes.len(),
                    "Initial snapshot loaded"
                );
                self.emit(SessionEvent::Loaded);
            }
            LoadOutcome::AlreadyLoaded => {}
            LoadOutcome::SkippedAfterEdit => {
                tracing::debug!(
                    document_id = %self.document_id,
                    "Discarding initial snapshot, surface already has edits"
                );
            }
            LoadOutcome::Failed(e) => {
                tracing::error!(document_id = %self.document_id, error = %e, "Initial load failed");
                self.emit(SessionEvent::LoadFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    fn fire(&mut self) {
        let Some(trigger) = self.aggregator.begin_fire(Instant::now()) else {
            return;
        };

        tracing::debug!(
            document_id = %self.document_id,
            class = ?trigger.class,
            coalesced = trigger.coalesced,
            "Debounce fired"
        );
        let snapshot = self.surface.snapshot();
        self.submit(snapshot);
        self.aggregator.end_fire();
    }

    /// Submit the surface as it is now, dropping any pending debounce
    fn save_current(&mut self) {
        self.aggregator.flush();
        let snapshot = self.surface.snapshot();
        self.submit(snapshot);
    }

    fn submit(&mut self, data: DocumentData) {
        let intent = SaveIntent {
            document_id: self.document_id.clone(),
            data,
            title: self.title.clone(),
        };
        self.latest_seq += 1;
        let seq = self.latest_seq;

        let ticket = self.coordinator.submit(intent);
        self.in_flight.push(Box::pin(async move { (seq, ticket.await) }));
        self.set_state(SessionState::Saving);
    }

    fn on_save_result(&mut self, seq: u64, result: SaveResult) {
        match result {
            Ok(receipt) => {
                if seq == self.latest_seq {
                    self.retry_pending = false;
                }
                tracing::info!(document_id = %self.document_id, "Document saved");
                self.emit(SessionEvent::Saved {
                    updated_at: receipt.updated_at,
                });
            }
            Err(SaveError::Superseded) => {
                tracing::debug!(document_id = %self.document_id, seq, "Save superseded");
            }
            Err(error) => {
                let retryable = error.is_retryable();
                if retryable {
                    self.retry_pending = true;
                }
                self.emit(SessionEvent::SaveFailed { error, retryable });
            }
        }

        if self.in_flight.is_empty() && self.current_state() == SessionState::Saving {
            self.set_state(SessionState::Ready);
        }
    }

    fn close(&mut self) {
        self.aggregator.cancel();
        self.set_state(SessionState::Closed);
    }

    fn accepts_saves(&self) -> bool {
        matches!(
            self.current_state(),
            SessionState::Ready | SessionState::Saving
        )
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(document_id = %self.document_id, from = ?*current, to = ?state, "Session state");
            *current = state;
            true
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBackend, MemorySurface};
    use serde_json::json;

    const DOC: &str = "doc-1";

    fn stored_snapshot() -> DocumentData {
        DocumentData::default().with_shape("shape:stored", json!({ "type": "geo" }))
    }

    fn open(backend: &Arc<MemoryBackend>, surface: &MemorySurface) -> SessionHandle {
        DocumentSession::open(
            DOC,
            surface.clone(),
            SaveCoordinator::new(backend.clone()),
            SessionConfig::default(),
        )
    }

    async fn wait_for(handle: &SessionHandle, state: SessionState) {
        let mut rx = handle.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    #[test]
    fn test_initial_load_is_idempotent() {
        let mut surface = MemorySurface::new();
        let mut guard = InitialLoad::new();
        let snapshot = stored_snapshot();

        assert_eq!(guard.apply(&mut surface, &snapshot), LoadOutcome::Loaded);
        let after_first = surface.current();

        assert_eq!(guard.apply(&mut surface, &snapshot), LoadOutcome::AlreadyLoaded);
        assert_eq!(surface.current(), after_first);
        assert_eq!(surface.load_count(), 1);
    }

    #[test]
    fn test_initial_load_skipped_after_edit() {
        let mut surface = MemorySurface::new();
        let mut guard = InitialLoad::new();

        surface.put_shape("shape:mine", json!({}));
        guard.mark_edited();

        assert_eq!(
            guard.apply(&mut surface, &stored_snapshot()),
            LoadOutcome::SkippedAfterEdit
        );
        assert!(surface.current().shapes.contains_key("shape:mine"));
        assert!(!guard.is_loaded());
    }

    #[test]
    fn test_failed_load_can_be_attempted_again() {
        let mut surface = MemorySurface::new();
        let mut guard = InitialLoad::new();

        surface.set_fail_loads(true);
        assert!(matches!(
            guard.apply(&mut surface, &stored_snapshot()),
            LoadOutcome::Failed(_)
        ));

        surface.set_fail_loads(false);
        assert_eq!(guard.apply(&mut surface, &stored_snapshot()), LoadOutcome::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_loads_stored_snapshot_once() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, stored_snapshot()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        let mut events = handle.subscribe();

        wait_for(&handle, SessionState::Ready).await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Loaded);
        assert!(surface.current().shapes.contains_key("shape:stored"));

        // Re-mounting the canvas must not load again
        handle.surface_mounted().unwrap();
        handle.surface_mounted().unwrap();
        settle().await;

        assert_eq!(surface.load_count(), 1);
        assert_eq!(backend.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_document_loads_empty_default() {
        let backend = Arc::new(MemoryBackend::new());
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);

        wait_for(&handle, SessionState::Ready).await;
        assert_eq!(surface.current(), DocumentData::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_one_save() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        for i in 0..8 {
            let batch = surface.put_shape("shape:drag", json!({ "x": i * 10 }));
            handle.record_changes(batch).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        settle().await;

        let writes = backend.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data.shapes["shape:drag"], json!({ "x": 70 }));
        assert_eq!(handle.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_waits_for_quiet_period() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        handle
            .record_changes(surface.put_shape("shape:a", json!({})))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(backend.writes().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_saves_immediately() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        handle
            .record_changes(surface.put_shape("shape:a", json!({})))
            .unwrap();
        handle
            .record_changes(surface.put_shape("shape:b", json!({})))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.writes().is_empty());

        handle
            .record_changes(surface.remove_shape("shape:a"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let writes = backend.writes();
        assert_eq!(writes.len(), 1);
        assert!(!writes[0].data.shapes.contains_key("shape:a"));
        assert!(writes[0].data.shapes.contains_key("shape:b"));

        // The earlier update timer was replaced, not left behind
        settle().await;
        assert_eq!(backend.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_irrelevant_changes_never_save() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        handle
            .record_changes(ChangeBatch::user(vec![crate::RecordChange::new(
                crate::ChangeOp::Updated,
                "camera",
                "camera:page:page",
            )]))
            .unwrap();
        handle
            .record_changes(ChangeBatch::remote(vec![crate::RecordChange::shape(
                crate::ChangeOp::Created,
                "shape:remote",
            )]))
            .unwrap();
        settle().await;

        assert!(backend.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_saving_state_and_saved_event() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_document(DOC, DocumentData::default())
                .with_write_delay(Duration::from_millis(300)),
        );
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;
        let mut events = handle.subscribe();

        handle
            .record_changes(surface.remove_shape("shape:none"))
            .unwrap();
        wait_for(&handle, SessionState::Saving).await;
        wait_for(&handle, SessionState::Ready).await;

        match events.recv().await.unwrap() {
            SessionEvent::Saved { updated_at } => assert!(updated_at.is_some()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_records_retry_with_latest_snapshot() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;
        let mut events = handle.subscribe();

        backend.fail_next_writes(1);
        handle
            .record_changes(surface.put_shape("shape:a", json!({ "color": "blue" })))
            .unwrap();
        settle().await;

        match events.recv().await.unwrap() {
            SessionEvent::SaveFailed { retryable, .. } => assert!(retryable),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.state(), SessionState::Ready);
        assert!(backend.stored(DOC).unwrap().shapes.is_empty());

        handle.retry().unwrap();
        settle().await;

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Saved { .. }));
        assert_eq!(
            backend.stored(DOC).unwrap().shapes["shape:a"],
            json!({ "color": "blue" })
        );

        // The affordance is consumed
        handle.retry().unwrap();
        settle().await;
        assert_eq!(backend.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_saves_edits_made_after_failure() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        backend.fail_next_writes(1);
        handle
            .record_changes(surface.put_shape("shape:a", json!({})))
            .unwrap();
        settle().await;
        assert_eq!(backend.writes().len(), 1);

        handle
            .record_changes(surface.put_shape("shape:b", json!({})))
            .unwrap();
        handle.retry().unwrap();
        settle().await;

        // The retry carries both shapes and replaces the pending debounce
        let writes = backend.writes();
        assert_eq!(writes.len(), 2);
        let stored = backend.stored(DOC).unwrap();
        assert!(stored.shapes.contains_key("shape:a"));
        assert!(stored.shapes.contains_key("shape:b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_document_is_not_retryable() {
        let backend = Arc::new(MemoryBackend::new());
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;
        let mut events = handle.subscribe();

        handle.save_now().unwrap();
        settle().await;

        match events.recv().await.unwrap() {
            SessionEvent::SaveFailed { error, retryable } => {
                assert_eq!(error, SaveError::NotFound(DOC.to_string()));
                assert!(!retryable);
            }
            other => panic!("unexpected event {other:?}"),
        }

        handle.retry().unwrap();
        settle().await;
        assert_eq!(backend.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_now_skips_debounce() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        handle
            .record_changes(surface.put_shape("shape:a", json!({})))
            .unwrap();
        handle.save_now().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(backend.writes().len(), 1);

        // The flushed debounce does not produce a second write
        settle().await;
        assert_eq!(backend.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_is_sent_with_saves() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        handle.rename("Project Wireframes").unwrap();
        settle().await;
        handle
            .record_changes(surface.put_shape("shape:a", json!({})))
            .unwrap();
        settle().await;

        let writes = backend.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes
            .iter()
            .all(|w| w.title.as_deref() == Some("Project Wireframes")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_while_loading_is_saved_once_ready() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_document(DOC, stored_snapshot())
                .with_read_delay(Duration::from_secs(1)),
        );
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);

        handle.rename("Project Wireframes").unwrap();
        wait_for(&handle, SessionState::Ready).await;
        settle().await;

        let writes = backend.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].title.as_deref(), Some("Project Wireframes"));
        assert!(writes[0].data.shapes.contains_key("shape:stored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_load_times_out_then_applies_if_untouched() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_document(DOC, stored_snapshot())
                .with_read_delay(Duration::from_secs(8)),
        );
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        let mut events = handle.subscribe();

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(handle.state(), SessionState::Ready);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoadTimedOut);
        assert_eq!(surface.load_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Loaded);
        assert!(surface.current().shapes.contains_key("shape:stored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_load_does_not_overwrite_edits() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_document(DOC, stored_snapshot())
                .with_read_delay(Duration::from_secs(8)),
        );
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);

        wait_for(&handle, SessionState::Ready).await;
        handle
            .record_changes(surface.put_shape("shape:fresh", json!({})))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(surface.load_count(), 0);
        let current = surface.current();
        assert!(current.shapes.contains_key("shape:fresh"));
        assert!(!current.shapes.contains_key("shape:stored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_still_becomes_ready() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, stored_snapshot()));
        let surface = MemorySurface::new();
        surface.set_fail_loads(true);
        let handle = open(&backend, &surface);
        let mut events = handle.subscribe();

        wait_for(&handle, SessionState::Ready).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::LoadFailed { .. }
        ));

        // A later mount retries the load
        surface.set_fail_loads(false);
        handle.surface_mounted().unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_save() {
        let backend = Arc::new(MemoryBackend::new().with_document(DOC, DocumentData::default()));
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        handle
            .record_changes(surface.put_shape("shape:a", json!({})))
            .unwrap();
        handle.close().await;
        settle().await;

        assert_eq!(handle.state(), SessionState::Closed);
        assert!(backend.writes().is_empty());
        assert_eq!(
            handle.record_changes(surface.put_shape("shape:b", json!({}))),
            Err(SessionError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_during_slow_write_are_coalesced() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_document(DOC, DocumentData::default())
                .with_write_delay(Duration::from_secs(2)),
        );
        let surface = MemorySurface::new();
        let handle = open(&backend, &surface);
        wait_for(&handle, SessionState::Ready).await;

        // Three deletions fire three submissions while the first write runs
        for id in ["shape:a", "shape:b", "shape:c"] {
            surface.put_shape(id, json!({}));
        }
        for id in ["shape:a", "shape:b", "shape:c"] {
            handle.record_changes(surface.remove_shape(id)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        let writes = backend.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].data.shapes.is_empty());
        assert_eq!(backend.max_concurrent_writes(), 1);
        assert_eq!(handle.state(), SessionState::Ready);
    }
}
