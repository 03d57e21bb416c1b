//! Atomic multi-op submission types.

use thiserror::Error;

use crate::{BackendError, CreateMode, NodeStat};

/// One operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BackendOp {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        expected: Option<u64>,
    },
    Delete {
        path: String,
        expected: Option<u64>,
    },
}

impl BackendOp {
    pub fn path(&self) -> &str {
        match self {
            BackendOp::Create { path, .. }
            | BackendOp::SetData { path, .. }
            | BackendOp::Delete { path, .. } => path,
        }
    }
}

/// Per-op result of a committed batch, index-aligned with the submission.
#[derive(Debug, Clone)]
pub enum OpOutcome {
    Created { path: String, stat: NodeStat },
    Set { stat: NodeStat },
    Deleted,
}

/// Failure of an atomic batch: nothing was applied, and `index` names the
/// first op that could not be.
#[derive(Debug, Clone, Error)]
#[error("multi op {index} failed: {error}")]
pub struct MultiError {
    pub index: usize,
    pub error: BackendError,
}
