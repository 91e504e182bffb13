//! # Save Coordinator
//!
//! Serializes persistence per document id.
//!
//! - At most one write per document is in flight
//! - While a write is in flight, a new submission replaces the pending one
//!   (last submission wins, intermediate snapshots are dropped)
//! - When the in-flight write completes, the pending submission is written
//!   immediately
//! - Failures are reported, never retried automatically
//!
//! Writes run on a spawned task, so dropping a [`SaveTicket`] does not stall
//! the queue for that document.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use sketchpad_common::{DocumentData, SaveDocumentRequest};
use tokio::sync::oneshot;

use crate::{DocumentBackend, SaveError};

/// Last known client state that should become durable
#[derive(Debug, Clone, PartialEq)]
pub struct SaveIntent {
    pub document_id: String,
    pub data: DocumentData,
    pub title: Option<String>,
}

impl SaveIntent {
    pub fn new(document_id: impl Into<String>, data: DocumentData) -> Self {
        Self {
            document_id: document_id.into(),
            data,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Proof that a snapshot was persisted
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    pub document_id: String,
    /// Server timestamp of the write, when the backend reports one
    pub updated_at: Option<DateTime<Utc>>,
}

pub type SaveResult = Result<SaveReceipt, SaveError>;

type Waiter = oneshot::Sender<SaveResult>;

/// Per-document queue slot. Present while a write is in flight.
#[derive(Default)]
struct Slot {
    pending: Option<(SaveIntent, Waiter)>,
}

/// Resolves when the submission is persisted, superseded or failed
#[derive(Debug)]
pub struct SaveTicket {
    rx: oneshot::Receiver<SaveResult>,
}

impl Future for SaveTicket {
    type Output = SaveResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SaveError::Dropped)))
    }
}

#[derive(Clone)]
pub struct SaveCoordinator {
    backend: Arc<dyn DocumentBackend>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl SaveCoordinator {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read path: the durable snapshot, default when absent
    pub async fn load(&self, document_id: &str) -> DocumentData {
        self.backend.get_document(document_id).await
    }

    /// Queue a snapshot for persistence.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, intent: SaveIntent) -> SaveTicket {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

        match slots.get_mut(&intent.document_id) {
            Some(slot) => {
                tracing::debug!(
                    document_id = %intent.document_id,
                    "Save in flight, replacing pending submission"
                );
                if let Some((_, superseded)) = slot.pending.replace((intent, tx)) {
                    let _ = superseded.send(Err(SaveError::Superseded));
                }
            }
            None => {
                slots.insert(intent.document_id.clone(), Slot::default());
                let backend = self.backend.clone();
                let queue = self.slots.clone();
                tokio::spawn(drain(backend, queue, intent, tx));
            }
        }

        SaveTicket { rx }
    }

    /// Whether a write for this document is currently running
    pub fn is_in_flight(&self, document_id: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(document_id)
    }
}

/// Releases the slot if the drain task stops early (panic or cancellation).
/// Dropping the slot drops its pending waiter, which resolves as `Dropped`.
struct SlotGuard {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    document_id: String,
    armed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(document_id = %self.document_id, "Save task ended abnormally");
            self.slots
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.document_id);
        }
    }
}

/// Write `first`, then keep writing whatever became pending meanwhile.
async fn drain(
    backend: Arc<dyn DocumentBackend>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    first: SaveIntent,
    first_waiter: Waiter,
) {
    let document_id = first.document_id.clone();
    let mut guard = SlotGuard {
        slots: slots.clone(),
        document_id: document_id.clone(),
        armed: true,
    };
    let mut next = Some((first, first_waiter));

    while let Some((intent, waiter)) = next.take() {
        let result = write(backend.as_ref(), intent).await;
        let _ = waiter.send(result);

        let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
        next = slots.get_mut(&document_id).and_then(|slot| slot.pending.take());
        if next.is_none() {
            slots.remove(&document_id);
            // A later submit may insert a fresh slot with its own task
            guard.armed = false;
        }
    }
}

async fn write(backend: &dyn DocumentBackend, intent: SaveIntent) -> SaveResult {
    let SaveIntent {
        document_id,
        data,
        title,
    } = intent;

    match backend
        .save_document(&document_id, SaveDocumentRequest { data, title })
        .await
    {
        Ok(response) if response.success => {
            tracing::debug!(document_id = %document_id, "Snapshot persisted");
            Ok(SaveReceipt {
                document_id,
                updated_at: response.updated_at,
            })
        }
        Ok(_) => {
            tracing::warn!(document_id = %document_id, "Save rejected, document not found");
            Err(SaveError::NotFound(document_id))
        }
        Err(e) => {
            tracing::warn!(document_id = %document_id, error = %e, "Save failed");
            Err(e.into())
        }
    }
}
