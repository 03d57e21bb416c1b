//! Adapter over a hierarchical versioned coordination service.
//!
//! The store talks to its backend exclusively through the [`Backend`] trait:
//! per-node versioned reads, compare-and-set writes, atomic multi-op
//! submission, directory listing, persistent/ephemeral node creation, and
//! persistent watch streams. [`memory::MemoryBackend`] is the complete
//! in-process implementation used by tests and embedded deployments; a
//! networked implementation plugs in behind the same trait.

use std::future::Future;

use thiserror::Error;

pub mod memory;
pub mod ops;
pub mod watch;

pub use memory::MemoryBackend;
pub use ops::{BackendOp, MultiError, OpOutcome};
pub use watch::{ChildEvent, ChildWatch, DataEvent, DataWatch};

/// Result alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failure classes reported by the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The node (or a required parent) does not exist.
    NoNode,
    /// A node already exists at the target path.
    NodeExists,
    /// The expected version did not match the node's version.
    BadVersion,
    /// Delete of a node that still has children.
    NotEmpty,
    /// Ephemeral nodes cannot have children.
    NoChildrenForEphemerals,
    /// Transient connection fault; the operation may be retried.
    ConnectionLoss,
    /// The session owning this handle has expired.
    SessionExpired,
    /// Anything else.
    Other,
}

/// A single backend failure, carrying the path it occurred on.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} at {path}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub path: String,
}

impl BackendError {
    pub fn new(kind: ErrorKind, path: impl Into<String>) -> Self {
        BackendError {
            kind,
            path: path.into(),
        }
    }
}

/// Per-node metadata maintained by the backend.
///
/// `version` counts data writes to the node. `czxid` and `mzxid` are the
/// global transaction counters at creation and at the most recent
/// modification; every mutation anywhere in the tree advances the global
/// counter, so `mzxid` totally orders writes across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub version: u64,
    pub czxid: u64,
    pub mzxid: u64,
    pub num_children: u32,
    pub ephemeral: bool,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(
            self,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential
        )
    }
}

/// The coordination-service surface the store builds on.
///
/// All operations are asynchronous and complete on the backend's callback
/// path. `expected: None` means "any version" (unconditional write/delete).
pub trait Backend: Send + Sync + 'static {
    /// Read a node's data and stat.
    fn get(&self, path: &str) -> impl Future<Output = BackendResult<(Vec<u8>, NodeStat)>> + Send;

    /// Create a node. For sequential modes the returned path carries the
    /// backend-assigned suffix.
    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> impl Future<Output = BackendResult<(String, NodeStat)>> + Send;

    /// Replace a node's data, optionally guarded by an expected version.
    fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<u64>,
    ) -> impl Future<Output = BackendResult<NodeStat>> + Send;

    /// Delete a node, optionally guarded by an expected version.
    fn delete(
        &self,
        path: &str,
        expected: Option<u64>,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// List a node's children (simple names, sorted).
    fn children(&self, path: &str) -> impl Future<Output = BackendResult<Vec<String>>> + Send;

    /// Stat a node if it exists.
    fn exists(&self, path: &str) -> impl Future<Output = BackendResult<Option<NodeStat>>> + Send;

    /// Submit an ordered op batch that commits or fails atomically.
    ///
    /// On failure the error reports the index of the first failing op.
    fn multi(
        &self,
        ops: Vec<BackendOp>,
    ) -> impl Future<Output = std::result::Result<Vec<OpOutcome>, MultiError>> + Send;

    /// Open a persistent data watch on `path`.
    ///
    /// The returned watch carries the node's current state (None if absent)
    /// and a stream of subsequent events. A stream that ends without a
    /// `Deleted` event was interrupted (session loss); callers re-establish
    /// it.
    fn watch_data(&self, path: &str) -> impl Future<Output = BackendResult<DataWatch>> + Send;

    /// Open a persistent child watch on `path`. Fails with `NoNode` if the
    /// directory does not exist.
    fn watch_children(&self, path: &str)
        -> impl Future<Output = BackendResult<ChildWatch>> + Send;
}
