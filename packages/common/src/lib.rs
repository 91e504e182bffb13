//! # Sketchpad Common
//!
//! Types shared by the editor client and the document server: the persisted
//! [`Document`] record, the opaque canvas snapshot ([`DocumentData`]) and the
//! request/response shapes of the document procedures.

pub mod model;
pub mod protocol;

pub use model::*;
pub use protocol::*;
