//! Error types for the editor

use thiserror::Error;

/// Failure reported by a [`DocumentBackend`](crate::DocumentBackend)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The write or read failed, trying again may succeed
    #[error("Backend unavailable: {0}")]
    Transient(String),
}

/// Why a save submission did not become durable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaveError {
    /// A newer submission for the same document replaced this one
    #[error("Superseded by a newer save")]
    Superseded,

    /// The backend has no document with this id
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Save failed: {0}")]
    Backend(String),

    /// The coordinator went away before reporting
    #[error("Save was dropped before completing")]
    Dropped,
}

impl SaveError {
    /// Whether resubmitting the same snapshot is meaningful
    pub fn is_retryable(&self) -> bool {
        matches!(self, SaveError::Backend(_) | SaveError::Dropped)
    }
}

impl From<BackendError> for SaveError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Transient(message) => SaveError::Backend(message),
        }
    }
}

/// The editing surface rejected a snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("Could not load snapshot: {0}")]
    Load(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,
}
