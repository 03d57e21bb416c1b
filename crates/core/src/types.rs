//! Object identifiers and provenance records.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, string-serializable object identifier.
///
/// The store never interprets ids beyond equality and path embedding. Any
/// string that is a legal single path segment (non-empty, no `/`) works.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjId(String);

impl ObjId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjId(id.into())
    }

    /// Fresh random identifier.
    pub fn random() -> Self {
        ObjId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjId {
    fn from(s: &str) -> Self {
        ObjId(s.to_string())
    }
}

impl From<String> for ObjId {
    fn from(s: String) -> Self {
        ObjId(s)
    }
}

impl From<Uuid> for ObjId {
    fn from(u: Uuid) -> Self {
        ObjId(u.to_string())
    }
}

/// Identity of the writer recorded in provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Owner(Option<String>);

impl Owner {
    /// Anonymous writer, used by `multi` and internal maintenance writes.
    pub fn anonymous() -> Self {
        Owner(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Owner(Some(name.into()))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(name) => f.write_str(name),
            None => f.write_str("(anonymous)"),
        }
    }
}

/// What the most recent committed write did to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Record schema version embedded in every provenance record.
pub const PROVENANCE_VERSION: u32 = 1;

/// Compact sibling record kept next to every object payload: the most recent
/// writer, the kind of change, and the record schema version.
///
/// The record is deliberately free of timestamps and counters so that two
/// writes by the same owner with the same change kind encode to identical
/// bytes; the commit planner skips the provenance write in that case. The
/// node's own backend version still advances the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub owner: Owner,
    pub change: ChangeKind,
    pub internal_version: u32,
}

impl ProvenanceRecord {
    pub fn new(owner: Owner, change: ChangeKind) -> Self {
        ProvenanceRecord {
            owner,
            change,
            internal_version: PROVENANCE_VERSION,
        }
    }
}
