//! # Change Events
//!
//! Raw structural change notifications emitted by the canvas store. Only
//! user-originated changes to shape records matter for persistence; camera,
//! selection and other bookkeeping records change constantly and are ignored.

use serde::{Deserialize, Serialize};

/// Record type name of canvas shapes
pub const SHAPE_TYPE: &str = "shape";

/// Id prefix of shape records
pub const SHAPE_ID_PREFIX: &str = "shape:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Created,
    Updated,
    Removed,
}

/// Who caused a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    #[default]
    User,
    /// Loads and other programmatic writes
    Remote,
}

/// A single record change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    pub op: ChangeOp,
    pub type_name: String,
    pub record_id: String,
}

impl RecordChange {
    pub fn new(op: ChangeOp, type_name: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            op,
            type_name: type_name.into(),
            record_id: record_id.into(),
        }
    }

    /// Change to a shape record
    pub fn shape(op: ChangeOp, record_id: impl Into<String>) -> Self {
        Self::new(op, SHAPE_TYPE, record_id)
    }

    pub fn is_shape(&self) -> bool {
        self.type_name == SHAPE_TYPE || self.record_id.starts_with(SHAPE_ID_PREFIX)
    }
}

/// How a batch affects persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    /// Nothing worth saving
    Irrelevant,
    /// Shapes created or updated
    Edit,
    /// At least one shape removed
    Deletion,
}

/// Changes delivered together by one store notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(default)]
    pub source: ChangeSource,
    pub changes: Vec<RecordChange>,
}

impl ChangeBatch {
    pub fn user(changes: Vec<RecordChange>) -> Self {
        Self {
            source: ChangeSource::User,
            changes,
        }
    }

    pub fn remote(changes: Vec<RecordChange>) -> Self {
        Self {
            source: ChangeSource::Remote,
            changes,
        }
    }

    pub fn classify(&self) -> ChangeClass {
        if self.source == ChangeSource::Remote {
            return ChangeClass::Irrelevant;
        }

        let mut class = ChangeClass::Irrelevant;
        for change in self.changes.iter().filter(|c| c.is_shape()) {
            if change.op == ChangeOp::Removed {
                return ChangeClass::Deletion;
            }
            class = ChangeClass::Edit;
        }
        class
    }
}
