//! Topology lock.
//!
//! A coarse mutex implemented as a coordination-service semaphore: waiters
//! park ephemeral sequential children under the lock node and the lowest
//! sequence holds the lock; everyone else watches its predecessor.
//!
//! The lock node itself is an operator switch. A background watcher tracks
//! its existence; when the node is absent the store runs in lock-free mode
//! and `acquire` returns immediately. Deleting the node while the store is
//! running disables coarse locking without a restart. Mode transitions are
//! serialized by a single mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use topograph_backend::{Backend, CreateMode, DataEvent, ErrorKind};
use topograph_core::{Result, StoreError};

use crate::store::StoreCtx;

/// Handle returned by a successful acquisition. `path == None` means the
/// store was in lock-free mode and nothing needs releasing.
pub(crate) struct LockGuard {
    path: Option<String>,
}

pub(crate) struct TopologyLock<B: Backend> {
    ctx: Arc<StoreCtx<B>>,
    enabled: AtomicBool,
    transitions: Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> TopologyLock<B> {
    /// Read the initial mode and start the existence watcher.
    pub async fn start(ctx: Arc<StoreCtx<B>>) -> Arc<Self> {
        let path = ctx.layout.topology_lock_path();
        let present = matches!(ctx.backend.exists(&path).await, Ok(Some(_)));
        let lock = Arc::new(TopologyLock {
            ctx,
            enabled: AtomicBool::new(present),
            transitions: Mutex::new(()),
            watcher: Mutex::new(None),
        });
        let task = tokio::spawn(Self::watch_mode(lock.clone(), path));
        *lock.watcher.lock() = Some(task);
        lock
    }

    async fn watch_mode(lock: Arc<Self>, path: String) {
        loop {
            match lock.ctx.backend.watch_data(&path).await {
                Ok(mut watch) => {
                    lock.set_mode(watch.initial.is_some());
                    while let Some(event) = watch.events.recv().await {
                        match event {
                            DataEvent::Changed { .. } => lock.set_mode(true),
                            DataEvent::Deleted => lock.set_mode(false),
                        }
                    }
                    // Watch interrupted; re-arm with the last mode intact.
                }
                Err(e) => {
                    warn!(error = %e, "topology lock watcher could not arm");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn set_mode(&self, enabled: bool) {
        let _guard = self.transitions.lock();
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            debug!(enabled, "topology lock mode changed");
        }
    }

    pub fn is_lock_free(&self) -> bool {
        !self.enabled.load(Ordering::SeqCst)
    }

    /// Acquire the mutex, or pass straight through in lock-free mode.
    ///
    /// Acquisition is bounded by the configured lock timeout; on timeout the
    /// candidate node is withdrawn and `StorageFailure` is raised.
    pub async fn acquire(&self) -> Result<LockGuard> {
        if self.is_lock_free() {
            return Ok(LockGuard { path: None });
        }
        let lock_path = self.ctx.layout.topology_lock_path();
        let payload = serde_json::to_vec(&json!({
            "requested_at": Utc::now().to_rfc3339(),
        }))?;
        let candidate = format!("{lock_path}/lock-");
        let me = match self
            .ctx
            .backend
            .create(&candidate, payload, CreateMode::EphemeralSequential)
            .await
        {
            Ok((path, _)) => path,
            // Lock node deleted under us: lock-free mode just engaged.
            Err(e) if e.kind == ErrorKind::NoNode => return Ok(LockGuard { path: None }),
            Err(e) => {
                return Err(self.ctx.err(StoreError::storage_failure_with_source(
                    "topology lock enqueue failed",
                    e,
                )))
            }
        };

        let timeout = self.ctx.config.lock_timeout;
        match tokio::time::timeout(timeout, self.wait_until_lowest(&lock_path, &me)).await {
            Ok(Ok(())) => Ok(LockGuard { path: Some(me) }),
            Ok(Err(e)) => {
                self.withdraw(&me).await;
                Err(e)
            }
            Err(_) => {
                self.withdraw(&me).await;
                Err(self.ctx.err(StoreError::storage_failure(format!(
                    "topology lock not acquired within {timeout:?}"
                ))))
            }
        }
    }

    async fn wait_until_lowest(&self, lock_path: &str, me: &str) -> Result<()> {
        let my_name = me.rsplit('/').next().unwrap_or(me).to_string();
        loop {
            let mut children = match self.ctx.backend.children(lock_path).await {
                Ok(c) => c,
                // Lock node vanished: the store switched to lock-free mode.
                Err(e) if e.kind == ErrorKind::NoNode => return Ok(()),
                Err(e) => {
                    return Err(self.ctx.err(StoreError::storage_failure_with_source(
                        "topology lock listing failed",
                        e,
                    )))
                }
            };
            children.sort_unstable();
            let position = children.iter().position(|c| *c == my_name).ok_or_else(|| {
                self.ctx
                    .err(StoreError::storage_failure("topology lock candidate lost"))
            })?;
            if position == 0 {
                return Ok(());
            }

            let predecessor = format!("{lock_path}/{}", children[position - 1]);
            let mut watch = match self.ctx.backend.watch_data(&predecessor).await {
                Ok(w) => w,
                Err(_) => continue,
            };
            if watch.initial.is_none() {
                continue;
            }
            loop {
                match watch.events.recv().await {
                    Some(DataEvent::Deleted) | None => break,
                    Some(DataEvent::Changed { .. }) => {}
                }
            }
        }
    }

    /// Release a held guard. Failure is logged, not raised; the node is
    /// ephemeral and clears with the session.
    pub async fn release(&self, guard: LockGuard) {
        if let Some(path) = guard.path {
            if let Err(e) = self.ctx.backend.delete(&path, None).await {
                warn!(path = %path, error = %e, "topology lock release failed");
            }
        }
    }

    async fn withdraw(&self, path: &str) {
        if let Err(e) = self.ctx.backend.delete(path, None).await {
            if e.kind != ErrorKind::NoNode {
                warn!(path = %path, error = %e, "topology lock withdrawal failed");
            }
        }
    }

    /// Stop the mode watcher.
    pub fn shutdown(&self) {
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }
}
