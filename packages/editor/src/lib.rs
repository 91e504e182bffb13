//! # Sketchpad Editor
//!
//! Client-side sync engine for canvas documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ canvas: shape edits → ChangeBatch           │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ session: DocumentSession per open document  │
//! │  - One-time initial snapshot load           │
//! │  - ChangeAggregator debounce                │
//! │  - Retry affordance after failed saves      │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ coordinator: one write in flight per doc    │
//! │  last submission wins                       │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ backend: DocumentBackend (store / HTTP)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Snapshots, not deltas**: every save carries the full document
//! 2. **Durable state lags the canvas**: saves are debounced and coalesced
//! 3. **Deletions are urgent**: removals skip the debounce window
//! 4. **Failures surface**: nothing is retried without the user asking
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sketchpad_editor::{DocumentSession, SaveCoordinator, SessionConfig};
//!
//! let coordinator = SaveCoordinator::new(backend);
//! let session = DocumentSession::open("doc-1", canvas, coordinator, SessionConfig::default());
//!
//! // Forward canvas notifications
//! session.record_changes(batch)?;
//!
//! // Leaving the editor
//! session.close().await;
//! ```

mod aggregator;
mod backend;
mod changes;
mod coordinator;
mod errors;
mod session;
mod surface;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use aggregator::{ChangeAggregator, DebounceConfig, DebounceState, SaveTrigger};
pub use backend::DocumentBackend;
pub use changes::{ChangeBatch, ChangeClass, ChangeOp, ChangeSource, RecordChange};
pub use coordinator::{SaveCoordinator, SaveIntent, SaveReceipt, SaveResult, SaveTicket};
pub use errors::{BackendError, SaveError, SessionError, SurfaceError};
pub use session::{
    DocumentSession, InitialLoad, LoadOutcome, SessionConfig, SessionEvent, SessionHandle,
    SessionState,
};
pub use surface::EditingSurface;

// Re-export common types for convenience
pub use sketchpad_common::{DocumentData, SaveDocumentRequest, SaveDocumentResponse};
