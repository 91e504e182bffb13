//! Document procedures on top of the repository.
//!
//! Reads fail open to defaults; writes propagate their errors. The same
//! service backs the HTTP API and, through [`DocumentBackend`], in-process
//! editor sessions.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sketchpad_common::{
    CreateDocumentResponse, Document, DocumentData, OpenedDocument, SaveDocumentRequest,
    SaveDocumentResponse, SuccessResponse, DEFAULT_TITLE,
};
use sketchpad_editor::{BackendError, DocumentBackend};

use crate::repository::{DocumentRepository, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Injected save failure")]
    FaultInjected,
}

impl ServiceError {
    /// Whether the caller sent something that can never succeed
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::InvalidSnapshot { .. }))
    }
}

/// Deterministic save failures for exercising retry paths
#[derive(Debug, Default)]
pub struct FaultInjector {
    every_nth: Option<u64>,
    saves: AtomicU64,
    forced: AtomicUsize,
}

impl FaultInjector {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Fail every `n`th save. `0` disables the rule.
    pub fn every_nth(n: u64) -> Self {
        Self {
            every_nth: (n > 0).then_some(n),
            ..Self::default()
        }
    }

    /// Fail the next `count` saves regardless of the periodic rule
    pub fn fail_next(&self, count: usize) {
        self.forced.fetch_add(count, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;

        let forced = self
            .forced
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        forced || self.every_nth.is_some_and(|n| attempt % n == 0)
    }
}

pub struct DocumentService {
    repository: Arc<DocumentRepository>,
    faults: FaultInjector,
}

impl DocumentService {
    pub fn new(repository: Arc<DocumentRepository>) -> Self {
        Self {
            repository,
            faults: FaultInjector::disabled(),
        }
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn repository(&self) -> &DocumentRepository {
        &self.repository
    }

    pub async fn list_documents(&self) -> Vec<Document> {
        self.repository.list().await
    }

    /// Snapshot of a document; the empty default when it does not exist
    pub async fn get_document(&self, id: &str) -> DocumentData {
        match self.repository.get(id).await {
            Some(document) => document.data.unwrap_or_default(),
            None => {
                tracing::debug!(document_id = %id, "Unknown document, returning default snapshot");
                DocumentData::default()
            }
        }
    }

    /// Metadata and snapshot in one read
    pub async fn open_document(&self, id: &str) -> Option<OpenedDocument> {
        let document = self.repository.get(id).await?;
        Some(OpenedDocument {
            info: document.info(),
            data: document.data.unwrap_or_default(),
        })
    }

    pub async fn create_document(
        &self,
        title: Option<String>,
    ) -> Result<CreateDocumentResponse, ServiceError> {
        let title = title.unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let document = self.repository.create(&title).await?;
        Ok(CreateDocumentResponse {
            id: document.id,
            title: document.title,
        })
    }

    pub async fn save_document(
        &self,
        id: &str,
        request: SaveDocumentRequest,
    ) -> Result<SaveDocumentResponse, ServiceError> {
        if self.faults.should_fail() {
            tracing::warn!(document_id = %id, "Injected save failure");
            return Err(ServiceError::FaultInjected);
        }

        let saved = self
            .repository
            .save(id, request.data, request.title.as_deref())
            .await?;
        Ok(match saved {
            Some(updated_at) => SaveDocumentResponse::saved(updated_at),
            None => SaveDocumentResponse::not_found(),
        })
    }

    pub async fn delete_document(&self, id: &str) -> Result<SuccessResponse, ServiceError> {
        let success = self.repository.delete(id).await?;
        Ok(SuccessResponse { success })
    }

    pub async fn delete_all_documents(&self) -> Result<SuccessResponse, ServiceError> {
        let success = self.repository.delete_all().await?;
        Ok(SuccessResponse { success })
    }
}

#[async_trait]
impl DocumentBackend for DocumentService {
    async fn get_document(&self, id: &str) -> DocumentData {
        DocumentService::get_document(self, id).await
    }

    async fn save_document(
        &self,
        id: &str,
        request: SaveDocumentRequest,
    ) -> Result<SaveDocumentResponse, BackendError> {
        DocumentService::save_document(self, id, request)
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> DocumentService {
        let repository =
            DocumentRepository::new(dir.path().join("store.json")).with_seed_titles(vec![]);
        DocumentService::new(Arc::new(repository))
    }

    fn request(data: DocumentData) -> SaveDocumentRequest {
        SaveDocumentRequest { data, title: None }
    }

    #[test]
    fn test_every_nth_fault() {
        let faults = FaultInjector::every_nth(3);
        let pattern: Vec<bool> = (0..6).map(|_| faults.should_fail()).collect();
        assert_eq!(pattern, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_fail_next_is_consumed() {
        let faults = FaultInjector::disabled();
        faults.fail_next(2);
        assert!(faults.should_fail());
        assert!(faults.should_fail());
        assert!(!faults.should_fail());
    }

    #[test]
    fn test_zero_disables_periodic_faults() {
        let faults = FaultInjector::every_nth(0);
        assert!((0..10).all(|_| !faults.should_fail()));
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let created = service.create_document(None).await.unwrap();
        assert_eq!(created.title, DEFAULT_TITLE);

        let data = DocumentData::default().with_shape("shape:1", json!({ "type": "geo" }));
        let response = service
            .save_document(&created.id, request(data.clone()))
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.updated_at.is_some());

        assert_eq!(service.get_document(&created.id).await, data);

        let deleted = service.delete_document(&created.id).await.unwrap();
        assert!(deleted.success);
        assert_eq!(
            service.get_document(&created.id).await,
            DocumentData::default()
        );
    }

    #[tokio::test]
    async fn test_save_unknown_reports_failure() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let response = service
            .save_document("unknown-id", request(DocumentData::default()))
            .await
            .unwrap();
        assert_eq!(response, SaveDocumentResponse::not_found());
        assert!(service.list_documents().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_saves_report_their_own_timestamp() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(service(&dir));
        let created = service.create_document(None).await.unwrap();

        let save = |shape: &'static str| {
            let service = service.clone();
            let id = created.id.clone();
            tokio::spawn(async move {
                let data = DocumentData::default().with_shape(shape, json!({}));
                service.save_document(&id, request(data)).await.unwrap()
            })
        };
        let (a, b) = tokio::join!(save("shape:a"), save("shape:b"));
        let (a, b) = (a.unwrap().updated_at.unwrap(), b.unwrap().updated_at.unwrap());

        let stored = service.repository().get(&created.id).await.unwrap();
        assert_eq!(stored.updated_at, a.max(b));
    }

    #[tokio::test]
    async fn test_open_document() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let created = service
            .create_document(Some("Wireframes".to_string()))
            .await
            .unwrap();

        let opened = service.open_document(&created.id).await.unwrap();
        assert_eq!(opened.info.title, "Wireframes");
        assert_eq!(opened.data, DocumentData::default());
        assert!(service.open_document("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_injected_fault_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let created = service.create_document(None).await.unwrap();

        service.faults().fail_next(1);
        let data = DocumentData::default().with_shape("shape:1", json!({}));
        let err = service
            .save_document(&created.id, request(data.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::FaultInjected));
        assert!(!err.is_client_error());
        assert_eq!(
            service.get_document(&created.id).await,
            DocumentData::default()
        );

        service
            .save_document(&created.id, request(data.clone()))
            .await
            .unwrap();
        assert_eq!(service.get_document(&created.id).await, data);
    }

    #[tokio::test]
    async fn test_backend_maps_failures_to_transient() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let created = service.create_document(None).await.unwrap();
        service.faults().fail_next(1);

        let backend: &dyn DocumentBackend = &service;
        let err = backend
            .save_document(&created.id, request(DocumentData::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transient(_)));
    }
}
