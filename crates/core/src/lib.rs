//! Core types shared by every topograph crate.
//!
//! This crate holds the pieces the rest of the system agrees on: the error
//! taxonomy surfaced to callers, object identifiers and provenance records,
//! the backend path layout, store configuration, and the metrics registry.
//! It has no knowledge of the coordination backend or of transactions.

pub mod config;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod types;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use metrics::{BackendEvent, StoreMetrics};
pub use paths::PathLayout;
pub use types::{ChangeKind, ObjId, Owner, ProvenanceRecord};
