//! The drawing canvas as seen by a session.

use sketchpad_common::DocumentData;

use crate::SurfaceError;

/// Snapshot and load primitives of the canvas engine.
///
/// Change events are not pulled from the surface; whoever owns it forwards
/// them to [`SessionHandle::record_changes`](crate::SessionHandle::record_changes).
pub trait EditingSurface: Send + 'static {
    /// Full current state (not a diff)
    fn snapshot(&self) -> DocumentData;

    /// Replace the canvas contents with a stored snapshot
    fn load_snapshot(&mut self, data: &DocumentData) -> Result<(), SurfaceError>;
}
