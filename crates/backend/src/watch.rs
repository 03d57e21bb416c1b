//! Persistent watch streams.
//!
//! Watches are long-lived: one registration delivers every subsequent event
//! until the node is deleted, the session is interrupted, or the receiver is
//! dropped. Interruption is modeled as the event channel closing without a
//! terminal `Deleted`; consumers distinguish the two and re-arm after
//! interruptions.

use tokio::sync::mpsc;

use crate::NodeStat;

/// Event on a watched node.
#[derive(Debug, Clone)]
pub enum DataEvent {
    /// Node created or its data replaced.
    Changed { data: Vec<u8>, stat: NodeStat },
    /// Node deleted. The registration itself survives: if the node is
    /// re-created the same watch reports the new `Changed` event.
    Deleted,
}

/// Event on a watched directory.
#[derive(Debug, Clone)]
pub enum ChildEvent {
    Added(String),
    Removed(String),
}

/// Data watch: state at registration plus the event stream.
pub struct DataWatch {
    /// Node state when the watch was registered; `None` if absent.
    pub initial: Option<(Vec<u8>, NodeStat)>,
    pub events: mpsc::UnboundedReceiver<DataEvent>,
}

/// Child watch: listing at registration plus the event stream.
pub struct ChildWatch {
    pub initial: Vec<String>,
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}
