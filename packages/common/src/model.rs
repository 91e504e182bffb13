//! # Document Model
//!
//! A [`Document`] is the persisted unit of work: metadata plus the canvas
//! snapshot. The snapshot is opaque to the store. Only `version` is looked at,
//! and unknown top-level keys are carried through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Title given to documents created without one
pub const DEFAULT_TITLE: &str = "Untitled Document";

/// Snapshot format version written for fresh documents
pub const INITIAL_SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    INITIAL_SNAPSHOT_VERSION
}

/// Full serialized state of the editing surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentData {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub shapes: Map<String, Value>,

    #[serde(default)]
    pub bindings: Map<String, Value>,

    #[serde(default)]
    pub assets: Map<String, Value>,

    /// Any other top-level keys the canvas emits
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DocumentData {
    fn default() -> Self {
        Self {
            version: INITIAL_SNAPSHOT_VERSION,
            shapes: Map::new(),
            bindings: Map::new(),
            assets: Map::new(),
            extra: Map::new(),
        }
    }
}

impl DocumentData {
    /// Add a shape record (builder style)
    pub fn with_shape(mut self, id: impl Into<String>, shape: Value) -> Self {
        self.shapes.insert(id.into(), shape);
        self
    }

    /// Whether this snapshot may be persisted
    pub fn is_valid(&self) -> bool {
        self.version >= INITIAL_SNAPSHOT_VERSION
    }
}

/// Persisted document record
///
/// `data` is optional on disk: records written without a snapshot (the seeded
/// samples, or files from older versions) are filled in on first read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub data: Option<DocumentData>,
}

impl Document {
    /// Create a fresh record with the empty default snapshot
    pub fn new(id: String, title: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            created_at: now,
            updated_at: now,
            data: Some(DocumentData::default()),
        }
    }

    /// Metadata without the snapshot
    pub fn info(&self) -> DocumentInfo {
        DocumentInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Document metadata (what a gallery or title bar needs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything an editor page needs to open a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenedDocument {
    pub info: DocumentInfo,
    pub data: DocumentData,
}
