//! # Sketchpad Workspace
//!
//! Server side of document sync: the file-backed repository, the document
//! procedures on top of it, and their HTTP binding.

pub mod config;
pub mod repository;
pub mod server;
pub mod service;

pub use config::{Config, FaultInjectionConfig, DEFAULT_CONFIG_NAME};
pub use repository::{DocumentRepository, StoreError};
pub use server::router;
pub use service::{DocumentService, FaultInjector, ServiceError};
