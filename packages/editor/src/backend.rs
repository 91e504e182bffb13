//! # Document Backend
//!
//! The transport-agnostic side of the document procedures that an editing
//! session needs: one read and one write. The server implements this
//! in-process; a network client would implement it over its transport.

use async_trait::async_trait;
use sketchpad_common::{DocumentData, SaveDocumentRequest, SaveDocumentResponse};

use crate::BackendError;

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Current durable snapshot of a document.
    ///
    /// Never fails: an unknown id, or any read failure, yields the empty
    /// default snapshot.
    async fn get_document(&self, id: &str) -> DocumentData;

    /// Persist a snapshot.
    ///
    /// `Ok` with `success: false` means the id is unknown; `Err` is a
    /// transient failure.
    async fn save_document(
        &self,
        id: &str,
        request: SaveDocumentRequest,
    ) -> Result<SaveDocumentResponse, BackendError>;
}
