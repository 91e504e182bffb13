//! # Document Repository
//!
//! File-backed store of document records.
//!
//! The whole collection lives in memory and is mirrored to a single JSON file
//! (id → record). The file is read once, on first use. Every mutation is
//! flushed in full before the in-memory copy is replaced, so memory and disk
//! never disagree.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use sketchpad_common::{Document, DocumentData, DEFAULT_TITLE};
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

type Documents = BTreeMap<String, Document>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Snapshot version {version} is not supported")]
    InvalidSnapshot { version: u32 },
}

/// Titles written to a fresh store
pub fn default_seed_titles() -> Vec<String> {
    vec![
        DEFAULT_TITLE.to_string(),
        "Project Wireframes".to_string(),
        "UI Design Concepts".to_string(),
    ]
}

pub struct DocumentRepository {
    path: PathBuf,
    seed_titles: Vec<String>,
    documents: OnceCell<Mutex<Documents>>,
}

impl DocumentRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seed_titles: default_seed_titles(),
            documents: OnceCell::new(),
        }
    }

    /// Replace the sample titles used when the backing file does not exist
    pub fn with_seed_titles(mut self, titles: Vec<String>) -> Self {
        self.seed_titles = titles;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All documents, newest first
    pub async fn list(&self) -> Vec<Document> {
        let documents = self.documents().await.lock().await;
        let mut list: Vec<Document> = documents.values().cloned().collect();
        list.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Look up a document, filling in a missing snapshot.
    ///
    /// The filled-in snapshot is persisted. If that flush fails the healed
    /// record is still returned and the next read tries again.
    pub async fn get(&self, id: &str) -> Option<Document> {
        let mut documents = self.documents().await.lock().await;
        let document = documents.get(id)?;
        if document.data.is_some() {
            return Some(document.clone());
        }

        let mut healed = document.clone();
        healed.data = Some(DocumentData::default());

        let mut next = documents.clone();
        next.insert(id.to_string(), healed.clone());
        match self.flush(&next).await {
            Ok(()) => {
                tracing::info!(document_id = %id, "Materialized default snapshot");
                *documents = next;
            }
            Err(e) => {
                tracing::warn!(document_id = %id, error = %e, "Failed to persist default snapshot");
            }
        }

        Some(healed)
    }

    /// Create a document with an empty snapshot. A blank title gets the default.
    pub async fn create(&self, title: &str) -> Result<Document, StoreError> {
        let title = if title.trim().is_empty() {
            DEFAULT_TITLE
        } else {
            title
        };
        let document = Document::new(Uuid::new_v4().to_string(), title.to_string(), Utc::now());

        let mut documents = self.documents().await.lock().await;
        let mut next = documents.clone();
        next.insert(document.id.clone(), document.clone());
        self.flush(&next).await?;
        *documents = next;

        tracing::info!(document_id = %document.id, title = %document.title, "Created document");
        Ok(document)
    }

    /// Overwrite the snapshot of an existing document.
    ///
    /// Returns the `updated_at` written, or `None` for an unknown id, in which
    /// case nothing is written. A non-blank `title` replaces the current one.
    pub async fn save(
        &self,
        id: &str,
        data: DocumentData,
        title: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if !data.is_valid() {
            return Err(StoreError::InvalidSnapshot {
                version: data.version,
            });
        }

        let mut documents = self.documents().await.lock().await;
        if !documents.contains_key(id) {
            tracing::warn!(document_id = %id, "Save for unknown document");
            return Ok(None);
        }

        let updated_at = Utc::now();
        let mut next = documents.clone();
        if let Some(document) = next.get_mut(id) {
            document.data = Some(data);
            if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
                document.title = title.to_string();
            }
            document.updated_at = updated_at;
        }
        self.flush(&next).await?;
        *documents = next;

        tracing::debug!(document_id = %id, "Saved document");
        Ok(Some(updated_at))
    }

    /// Remove a document. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut documents = self.documents().await.lock().await;
        if !documents.contains_key(id) {
            return Ok(false);
        }

        let mut next = documents.clone();
        next.remove(id);
        self.flush(&next).await?;
        *documents = next;

        tracing::info!(document_id = %id, "Deleted document");
        Ok(true)
    }

    pub async fn delete_all(&self) -> Result<bool, StoreError> {
        let mut documents = self.documents().await.lock().await;
        let next = Documents::new();
        self.flush(&next).await?;
        let removed = std::mem::replace(&mut *documents, next).len();

        tracing::info!(removed, "Deleted all documents");
        Ok(true)
    }

    async fn documents(&self) -> &Mutex<Documents> {
        self.documents
            .get_or_init(|| async { Mutex::new(self.bootstrap().await) })
            .await
    }

    /// Read the backing file, seeding it when absent. Never fails.
    async fn bootstrap(&self) -> Documents {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.seed().await,
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to read document store, starting empty");
                return Documents::new();
            }
        };

        match serde_json::from_str::<Documents>(&content) {
            Ok(documents) => {
                tracing::info!(path = ?self.path, count = documents.len(), "Loaded document store");
                documents
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Document store is corrupt, starting empty");
                Documents::new()
            }
        }
    }

    async fn seed(&self) -> Documents {
        let now = Utc::now();
        let documents: Documents = self
            .seed_titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                // Earlier titles sort first in the newest-first listing
                let created = now - Duration::seconds(i as i64);
                let document = Document {
                    id: Uuid::new_v4().to_string(),
                    title: title.clone(),
                    created_at: created,
                    updated_at: created,
                    data: None,
                };
                (document.id.clone(), document)
            })
            .collect();

        match self.flush(&documents).await {
            Ok(()) => {
                tracing::info!(path = ?self.path, count = documents.len(), "Seeded document store");
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to write seeded document store");
            }
        }
        documents
    }

    /// Write the full collection to a sibling temp file, then rename it over
    /// the backing file.
    async fn flush(&self, documents: &Documents) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(documents)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "documents".into());
    name.push(".tmp");
    path.with_file_name(name)
}
