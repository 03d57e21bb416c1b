//! Payload and provenance serialization.
//!
//! The default codec is MessagePack over the store's document model.
//! Documents are `serde_json::Value` whose object maps are BTreeMap-backed,
//! so field order is canonical and identical records always encode to
//! identical bytes. The commit planner relies on this to skip provenance
//! writes whose bytes are unchanged; a replacement [`Serializer`] that is
//! not canonical must always write.

use serde_json::Value;

use topograph_core::{ProvenanceRecord, Result, StoreError};

/// Codec seam between the store and its backend blobs.
pub trait Serializer: Send + Sync + 'static {
    fn encode_document(&self, doc: &Value) -> Result<Vec<u8>>;
    fn decode_document(&self, bytes: &[u8]) -> Result<Value>;
    fn encode_provenance(&self, record: &ProvenanceRecord) -> Result<Vec<u8>>;
    fn decode_provenance(&self, bytes: &[u8]) -> Result<ProvenanceRecord>;
}

/// MessagePack codec; the store default.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn encode_document(&self, doc: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(doc)
            .map_err(|e| StoreError::internal_with_source("document encode failed", e))
    }

    fn decode_document(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| StoreError::internal_with_source("document decode failed", e))
    }

    fn encode_provenance(&self, record: &ProvenanceRecord) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(record)
            .map_err(|e| StoreError::internal_with_source("provenance encode failed", e))
    }

    fn decode_provenance(&self, bytes: &[u8]) -> Result<ProvenanceRecord> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| StoreError::internal_with_source("provenance decode failed", e))
    }
}
