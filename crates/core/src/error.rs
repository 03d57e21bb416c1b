//! Error taxonomy for the object store.
//!
//! `StoreError` is the unified error type for all topograph APIs. Variants
//! map one-to-one onto the failure classes the store surfaces to callers;
//! everything unexpected is wrapped in `InternalObjectMapper`.
//!
//! `ConcurrentModification` is the only error the retry wrapper acts on. It
//! can be buried arbitrarily deep in a cause chain (a commit failure wrapped
//! by a caller, wrapped again by a service layer), so retriability is decided
//! by walking `std::error::Error::source()` rather than by matching the
//! outermost variant.

use std::error::Error as StdError;

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type surfaced by every topograph API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Read of an object that does not exist.
    #[error("object not found: {class}/{id}")]
    NotFound {
        /// Simple class name
        class: String,
        /// Object identifier
        id: String,
    },

    /// Create of an object whose identifier is already taken.
    #[error("object already exists: {class}/{id}")]
    ObjectExists {
        /// Simple class name
        class: String,
        /// Object identifier
        id: String,
    },

    /// Delete blocked by a binding whose on-delete action is ERROR.
    #[error("object {class}/{id} is still referenced through field {field}")]
    ObjectReferenced {
        /// Class of the object being deleted
        class: String,
        /// Identifier of the object being deleted
        id: String,
        /// The non-empty bound field that blocked the delete
        field: String,
    },

    /// Attempted reference stealing or an inconsistent reference delta.
    ///
    /// A non-null single-reference field may only be rewritten by its owner;
    /// a third-party create or update that would re-point it fails with this.
    #[error("reference conflict: {class}/{id} field {field} is already bound")]
    ReferenceConflict {
        /// Class of the peer whose field is already populated
        class: String,
        /// Identifier of that peer
        id: String,
        /// The single-reference field that is already set
        field: String,
    },

    /// Snapshot invalidation or CAS failure at commit.
    #[error("concurrent modification: {message}")]
    ConcurrentModification {
        /// What was observed (object touched past the snapshot ceiling,
        /// version mismatch at commit, ...)
        message: String,
    },

    /// Raw node create hit an existing node.
    #[error("storage node already exists: {path}")]
    StorageNodeExists {
        /// Backend path of the conflicting node
        path: String,
    },

    /// Raw node update/delete hit a missing node.
    #[error("storage node not found: {path}")]
    StorageNodeNotFound {
        /// Backend path of the missing node
        path: String,
    },

    /// Operation attempted after shutdown (or before the store was built).
    #[error("store unavailable: {reason}")]
    ServiceUnavailable {
        /// Why the store cannot serve the call
        reason: String,
    },

    /// Lock acquisition timeout or unclassified transient backend fault.
    #[error("storage failure: {message}")]
    StorageFailure {
        /// Error message
        message: String,
        /// Optional underlying fault
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// Wrapper for every unexpected failure.
    #[error("internal object mapper error: {message}")]
    InternalObjectMapper {
        /// Error message
        message: String,
        /// Optional underlying fault
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

impl StoreError {
    pub fn not_found(class: impl Into<String>, id: impl ToString) -> Self {
        StoreError::NotFound {
            class: class.into(),
            id: id.to_string(),
        }
    }

    pub fn object_exists(class: impl Into<String>, id: impl ToString) -> Self {
        StoreError::ObjectExists {
            class: class.into(),
            id: id.to_string(),
        }
    }

    pub fn object_referenced(
        class: impl Into<String>,
        id: impl ToString,
        field: impl Into<String>,
    ) -> Self {
        StoreError::ObjectReferenced {
            class: class.into(),
            id: id.to_string(),
            field: field.into(),
        }
    }

    pub fn reference_conflict(
        class: impl Into<String>,
        id: impl ToString,
        field: impl Into<String>,
    ) -> Self {
        StoreError::ReferenceConflict {
            class: class.into(),
            id: id.to_string(),
            field: field.into(),
        }
    }

    pub fn concurrent_modification(message: impl Into<String>) -> Self {
        StoreError::ConcurrentModification {
            message: message.into(),
        }
    }

    pub fn storage_node_exists(path: impl Into<String>) -> Self {
        StoreError::StorageNodeExists { path: path.into() }
    }

    pub fn storage_node_not_found(path: impl Into<String>) -> Self {
        StoreError::StorageNodeNotFound { path: path.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::ServiceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn storage_failure(message: impl Into<String>) -> Self {
        StoreError::StorageFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_failure_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        StoreError::StorageFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::InternalObjectMapper {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        StoreError::InternalObjectMapper {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Stable label for the per-error-class metrics counter.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::ObjectExists { .. } => "object_exists",
            StoreError::ObjectReferenced { .. } => "object_referenced",
            StoreError::ReferenceConflict { .. } => "reference_conflict",
            StoreError::ConcurrentModification { .. } => "concurrent_modification",
            StoreError::StorageNodeExists { .. } => "storage_node_exists",
            StoreError::StorageNodeNotFound { .. } => "storage_node_not_found",
            StoreError::ServiceUnavailable { .. } => "service_unavailable",
            StoreError::StorageFailure { .. } => "storage_failure",
            StoreError::InternalObjectMapper { .. } => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True if this error, or any error in its source chain, is a
    /// `ConcurrentModification`.
    ///
    /// The retry wrapper uses this to decide whether to re-run a transaction
    /// body; nothing else is ever retried automatically.
    pub fn is_concurrent_modification(&self) -> bool {
        if matches!(self, StoreError::ConcurrentModification { .. }) {
            return true;
        }
        let mut cause: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = cause {
            if err
                .downcast_ref::<StoreError>()
                .is_some_and(|e| matches!(e, StoreError::ConcurrentModification { .. }))
            {
                return true;
            }
            cause = err.source();
        }
        false
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::internal_with_source("document serialization failed", e)
    }
}
