//! In-memory hierarchical backend.
//!
//! Complete implementation of [`Backend`] against a process-local tree:
//! per-node versions and zxids, sequential and ephemeral create modes,
//! atomic multi with first-failing-index reporting, and persistent watch
//! dispatch. Used by the test suites and by embedded deployments that do not
//! need an external coordination service.
//!
//! Two chaos hooks exist for exercising failure paths:
//! [`MemoryBackend::interrupt_watches`] closes every watch channel without a
//! terminal event (session loss as seen by watchers), and
//! [`MemoryBackend::expire_ephemerals`] drops all ephemeral nodes (session
//! expiry as seen by everyone else).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::ops::{BackendOp, MultiError, OpOutcome};
use crate::watch::{ChildEvent, ChildWatch, DataEvent, DataWatch};
use crate::{Backend, BackendError, BackendResult, CreateMode, ErrorKind, NodeStat};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: u64,
    czxid: u64,
    mzxid: u64,
    ephemeral: bool,
    children: BTreeSet<String>,
    seq: u64,
}

impl Node {
    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            czxid: self.czxid,
            mzxid: self.mzxid,
            num_children: self.children.len() as u32,
            ephemeral: self.ephemeral,
        }
    }
}

/// Event recorded while applying ops, dispatched after the batch commits.
enum Pending {
    Data { path: String, event: DataEvent },
    Child { path: String, event: ChildEvent },
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    zxid: u64,
    data_watches: HashMap<String, Vec<mpsc::UnboundedSender<DataEvent>>>,
    child_watches: HashMap<String, Vec<mpsc::UnboundedSender<ChildEvent>>>,
}

/// Process-local hierarchical versioned store.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
                czxid: 0,
                mzxid: 0,
                ephemeral: false,
                children: BTreeSet::new(),
                seq: 0,
            },
        );
        MemoryBackend {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Close every open watch channel without a terminal event.
    ///
    /// Watchers observe their stream ending mid-flight, exactly what a
    /// coordination-service session loss looks like, and are expected to
    /// re-establish their watches.
    pub fn interrupt_watches(&self) {
        let mut state = self.state.lock();
        state.data_watches.clear();
        state.child_watches.clear();
        trace!("all watches interrupted");
    }

    /// Delete every ephemeral node, firing the usual deletion events.
    pub fn expire_ephemerals(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut doomed: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral)
            .map(|(p, _)| p.clone())
            .collect();
        doomed.sort();
        let mut pending = Vec::new();
        for path in doomed {
            let op = BackendOp::Delete {
                path,
                expected: None,
            };
            // Ephemerals cannot have children, so each delete stands alone.
            let _ = apply_op(&mut state.nodes, &mut state.zxid, &op, &mut pending);
        }
        dispatch(state, pending);
    }

    /// Current global transaction counter; test observability.
    pub fn current_zxid(&self) -> u64 {
        self.state.lock().zxid
    }
}

fn err(kind: ErrorKind, path: &str) -> BackendError {
    BackendError::new(kind, path)
}

fn validate_path(path: &str) -> BackendResult<()> {
    let ok = path.starts_with('/')
        && path.len() > 1
        && !path.ends_with('/')
        && !path.contains("//");
    if ok {
        Ok(())
    } else {
        Err(err(ErrorKind::Other, path))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Apply one op against `nodes`, recording events to fire on commit.
///
/// Validation happens before any mutation so a failed op leaves the maps
/// untouched; `multi` additionally runs against a scratch copy.
fn apply_op(
    nodes: &mut HashMap<String, Node>,
    zxid: &mut u64,
    op: &BackendOp,
    pending: &mut Vec<Pending>,
) -> Result<OpOutcome, BackendError> {
    match op {
        BackendOp::Create { path, data, mode } => {
            validate_path(path)?;
            let parent_path = parent_of(path).to_string();
            let parent = nodes
                .get(&parent_path)
                .ok_or_else(|| err(ErrorKind::NoNode, path))?;
            if parent.ephemeral {
                return Err(err(ErrorKind::NoChildrenForEphemerals, path));
            }
            let actual = if mode.is_sequential() {
                format!("{}{:010}", path, parent.seq)
            } else {
                path.clone()
            };
            if nodes.contains_key(&actual) {
                return Err(err(ErrorKind::NodeExists, &actual));
            }

            *zxid += 1;
            let node = Node {
                data: data.clone(),
                version: 0,
                czxid: *zxid,
                mzxid: *zxid,
                ephemeral: mode.is_ephemeral(),
                children: BTreeSet::new(),
                seq: 0,
            };
            let stat = node.stat();
            let name = name_of(&actual).to_string();
            let parent = nodes
                .get_mut(&parent_path)
                .ok_or_else(|| err(ErrorKind::NoNode, path))?;
            if mode.is_sequential() {
                parent.seq += 1;
            }
            parent.children.insert(name.clone());
            nodes.insert(actual.clone(), node);

            pending.push(Pending::Data {
                path: actual.clone(),
                event: DataEvent::Changed {
                    data: data.clone(),
                    stat,
                },
            });
            pending.push(Pending::Child {
                path: parent_path,
                event: ChildEvent::Added(name),
            });
            Ok(OpOutcome::Created { path: actual, stat })
        }

        BackendOp::SetData {
            path,
            data,
            expected,
        } => {
            let node = nodes
                .get(path)
                .ok_or_else(|| err(ErrorKind::NoNode, path))?;
            if let Some(exp) = expected {
                if *exp != node.version {
                    return Err(err(ErrorKind::BadVersion, path));
                }
            }
            *zxid += 1;
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| err(ErrorKind::NoNode, path))?;
            node.data = data.clone();
            node.version += 1;
            node.mzxid = *zxid;
            let stat = node.stat();
            pending.push(Pending::Data {
                path: path.clone(),
                event: DataEvent::Changed {
                    data: data.clone(),
                    stat,
                },
            });
            Ok(OpOutcome::Set { stat })
        }

        BackendOp::Delete { path, expected } => {
            let node = nodes
                .get(path)
                .ok_or_else(|| err(ErrorKind::NoNode, path))?;
            if !node.children.is_empty() {
                return Err(err(ErrorKind::NotEmpty, path));
            }
            if let Some(exp) = expected {
                if *exp != node.version {
                    return Err(err(ErrorKind::BadVersion, path));
                }
            }
            *zxid += 1;
            nodes.remove(path);
            let parent_path = parent_of(path).to_string();
            let name = name_of(path).to_string();
            if let Some(parent) = nodes.get_mut(&parent_path) {
                parent.children.remove(&name);
            }
            pending.push(Pending::Data {
                path: path.clone(),
                event: DataEvent::Deleted,
            });
            pending.push(Pending::Child {
                path: parent_path,
                event: ChildEvent::Removed(name),
            });
            Ok(OpOutcome::Deleted)
        }
    }
}

/// Fire recorded events, pruning watchers whose receivers are gone.
///
/// Registrations survive node deletion: an existence watcher keeps getting
/// events if the node is later re-created.
fn dispatch(state: &mut State, pending: Vec<Pending>) {
    for entry in pending {
        match entry {
            Pending::Data { path, event } => {
                if let Some(senders) = state.data_watches.get_mut(&path) {
                    senders.retain(|tx| tx.send(event.clone()).is_ok());
                    if senders.is_empty() {
                        state.data_watches.remove(&path);
                    }
                }
            }
            Pending::Child { path, event } => {
                if let Some(senders) = state.child_watches.get_mut(&path) {
                    senders.retain(|tx| tx.send(event.clone()).is_ok());
                    if senders.is_empty() {
                        state.child_watches.remove(&path);
                    }
                }
            }
        }
    }
}

impl Backend for MemoryBackend {
    async fn get(&self, path: &str) -> BackendResult<(Vec<u8>, NodeStat)> {
        let state = self.state.lock();
        state
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.stat()))
            .ok_or_else(|| err(ErrorKind::NoNode, path))
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BackendResult<(String, NodeStat)> {
        let op = BackendOp::Create {
            path: path.to_string(),
            data,
            mode,
        };
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut pending = Vec::new();
        let outcome = apply_op(&mut state.nodes, &mut state.zxid, &op, &mut pending)?;
        dispatch(state, pending);
        match outcome {
            OpOutcome::Created { path, stat } => Ok((path, stat)),
            _ => Err(err(ErrorKind::Other, path)),
        }
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<u64>,
    ) -> BackendResult<NodeStat> {
        let op = BackendOp::SetData {
            path: path.to_string(),
            data,
            expected,
        };
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut pending = Vec::new();
        let outcome = apply_op(&mut state.nodes, &mut state.zxid, &op, &mut pending)?;
        dispatch(state, pending);
        match outcome {
            OpOutcome::Set { stat } => Ok(stat),
            _ => Err(err(ErrorKind::Other, path)),
        }
    }

    async fn delete(&self, path: &str, expected: Option<u64>) -> BackendResult<()> {
        let op = BackendOp::Delete {
            path: path.to_string(),
            expected,
        };
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut pending = Vec::new();
        apply_op(&mut state.nodes, &mut state.zxid, &op, &mut pending)?;
        dispatch(state, pending);
        Ok(())
    }

    async fn children(&self, path: &str) -> BackendResult<Vec<String>> {
        let state = self.state.lock();
        state
            .nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect())
            .ok_or_else(|| err(ErrorKind::NoNode, path))
    }

    async fn exists(&self, path: &str) -> BackendResult<Option<NodeStat>> {
        let state = self.state.lock();
        Ok(state.nodes.get(path).map(Node::stat))
    }

    async fn multi(&self, ops: Vec<BackendOp>) -> Result<Vec<OpOutcome>, MultiError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        // Run against a scratch copy so a mid-batch failure leaves the tree
        // untouched.
        let mut nodes = state.nodes.clone();
        let mut zxid = state.zxid;
        let mut pending = Vec::new();
        let mut outcomes = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            match apply_op(&mut nodes, &mut zxid, op, &mut pending) {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => return Err(MultiError { index, error }),
            }
        }
        state.nodes = nodes;
        state.zxid = zxid;
        dispatch(state, pending);
        Ok(outcomes)
    }

    async fn watch_data(&self, path: &str) -> BackendResult<DataWatch> {
        let mut state = self.state.lock();
        let initial = state.nodes.get(path).map(|n| (n.data.clone(), n.stat()));
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(DataWatch {
            initial,
            events: rx,
        })
    }

    async fn watch_children(&self, path: &str) -> BackendResult<ChildWatch> {
        let mut state = self.state.lock();
        let initial = state
            .nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect::<Vec<_>>())
            .ok_or_else(|| err(ErrorKind::NoNode, path))?;
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(ChildWatch {
            initial,
            events: rx,
        })
    }
}
