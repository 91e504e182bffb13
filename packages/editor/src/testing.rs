//! In-memory stand-ins for the backend and the canvas.
//!
//! Enabled for this crate's tests and, through the `test-support` feature, for
//! downstream crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sketchpad_common::{DocumentData, SaveDocumentRequest, SaveDocumentResponse};

use crate::changes::{ChangeBatch, ChangeOp, RecordChange};
use crate::{BackendError, DocumentBackend, EditingSurface, SurfaceError};

/// One save attempt seen by [`MemoryBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub document_id: String,
    pub data: DocumentData,
    pub title: Option<String>,
}

/// Backend keeping snapshots in a map, with optional latency and failures
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<String, DocumentData>>,
    writes: Mutex<Vec<RecordedWrite>>,
    read_delay: Duration,
    write_delay: Duration,
    failures: AtomicUsize,
    reads: AtomicUsize,
    active_writes: AtomicUsize,
    max_active_writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, id: impl Into<String>, data: DocumentData) -> Self {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), data);
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every save attempt, failed ones included
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn stored(&self, id: &str) -> Option<DocumentData> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Highest number of writes observed running at the same time
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_active_writes.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn get_document(&self, id: &str) -> DocumentData {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.stored(id).unwrap_or_default()
    }

    async fn save_document(
        &self,
        id: &str,
        request: SaveDocumentRequest,
    ) -> Result<SaveDocumentResponse, BackendError> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedWrite {
                document_id: id.to_string(),
                data: request.data.clone(),
                title: request.title.clone(),
            });

        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_writes.fetch_max(active, Ordering::SeqCst);
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.active_writes.fetch_sub(1, Ordering::SeqCst);

        if self.take_failure() {
            return Err(BackendError::Transient("injected failure".to_string()));
        }

        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        match documents.get_mut(id) {
            Some(stored) => {
                *stored = request.data;
                Ok(SaveDocumentResponse::saved(Utc::now()))
            }
            None => Ok(SaveDocumentResponse::not_found()),
        }
    }
}

#[derive(Debug, Default)]
struct SurfaceInner {
    current: DocumentData,
    loads: usize,
    fail_loads: bool,
}

/// Canvas stand-in. Clones share state so tests can keep a handle.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<SurfaceInner>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, SurfaceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or update a shape, returning the user change batch
    pub fn put_shape(&self, id: &str, shape: Value) -> ChangeBatch {
        let op = match self.inner().current.shapes.insert(id.to_string(), shape) {
            Some(_) => ChangeOp::Updated,
            None => ChangeOp::Created,
        };
        ChangeBatch::user(vec![RecordChange::shape(op, id)])
    }

    /// Remove a shape, returning the user change batch
    pub fn remove_shape(&self, id: &str) -> ChangeBatch {
        self.inner().current.shapes.remove(id);
        ChangeBatch::user(vec![RecordChange::shape(ChangeOp::Removed, id)])
    }

    pub fn current(&self) -> DocumentData {
        self.inner().current.clone()
    }

    /// Number of successful snapshot loads
    pub fn load_count(&self) -> usize {
        self.inner().loads
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.inner().fail_loads = fail;
    }
}

impl EditingSurface for MemorySurface {
    fn snapshot(&self) -> DocumentData {
        self.current()
    }

    fn load_snapshot(&mut self, data: &DocumentData) -> Result<(), SurfaceError> {
        let mut inner = self.inner();
        if inner.fail_loads {
            return Err(SurfaceError::Load("surface rejected snapshot".to_string()));
        }
        inner.current = data.clone();
        inner.loads += 1;
        Ok(())
    }
}
