//! Store facade and builder.
//!
//! [`StoreBuilder`] is the registration surface: classes and bindings are
//! declared before `build()` and frozen afterwards, which is what makes the
//! registration-monotonic rule unrepresentable rather than merely checked.
//! `build()` creates the backend directory skeleton idempotently and starts
//! the topology-lock watcher.
//!
//! [`ObjectStore`] is the public API: point reads, class listings, atomic
//! `multi`, explicit transactions, the retrying `try_transaction` wrapper,
//! and live subscriptions.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info};

use topograph_backend::{Backend, BackendError, CreateMode, ErrorKind};
use topograph_core::{
    ObjId, Owner, PathLayout, ProvenanceRecord, Result, StoreConfig, StoreError, StoreMetrics,
};

use crate::class::{from_document, to_document, ObjectClass};
use crate::lock::TopologyLock;
use crate::metered::MeteredBackend;
use crate::observable::{ClassSubscription, ObjectSubscription, ObservableCache};
use crate::registry::{BindingEnd, Registry, RegistryBuilder};
use crate::serializer::{MessagePackSerializer, Serializer};
use crate::transaction::Transaction;

/// Shared state behind every store handle.
pub(crate) struct StoreCtx<B: Backend> {
    pub(crate) backend: MeteredBackend<B>,
    pub(crate) registry: Registry,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) layout: PathLayout,
    pub(crate) config: StoreConfig,
    pub(crate) metrics: Arc<StoreMetrics>,
    closed: AtomicBool,
}

impl<B: Backend> StoreCtx<B> {
    /// Record the error in the per-kind counter and hand it back.
    pub(crate) fn err(&self, e: StoreError) -> StoreError {
        self.metrics.record_error(&e);
        e
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.err(StoreError::unavailable("store has been shut down")));
        }
        Ok(())
    }
}

/// Registration surface; consumed by `build()`.
pub struct StoreBuilder<B: Backend> {
    backend: B,
    config: StoreConfig,
    registry: RegistryBuilder,
    serializer: Arc<dyn Serializer>,
}

impl<B: Backend> StoreBuilder<B> {
    pub fn new(backend: B) -> Self {
        StoreBuilder {
            backend,
            config: StoreConfig::default(),
            registry: RegistryBuilder::new(),
            serializer: Arc::new(MessagePackSerializer),
        }
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the payload codec. Non-canonical codecs disable the
    /// skip-unchanged-provenance optimization guarantee; see [`Serializer`].
    pub fn serializer(mut self, serializer: impl Serializer) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn register_class<T: ObjectClass>(mut self) -> Result<Self> {
        self.registry.register_class::<T>()?;
        Ok(self)
    }

    /// Declare a symmetric binding between `A`'s and `C`'s fields.
    pub fn bind<A: ObjectClass, C: ObjectClass>(
        mut self,
        end_a: BindingEnd,
        end_c: BindingEnd,
    ) -> Result<Self> {
        self.registry.bind::<A, C>(end_a, end_c)?;
        Ok(self)
    }

    /// Freeze registration, create the directory skeleton, and start the
    /// lock watcher.
    pub async fn build(self) -> Result<ObjectStore<B>> {
        self.config.validate()?;
        let metrics = Arc::new(
            StoreMetrics::new()
                .map_err(|e| StoreError::internal_with_source("metrics setup failed", e))?,
        );
        let layout = PathLayout::new(&self.config.root_key);
        let registry = self.registry.build();

        let ctx = Arc::new(StoreCtx {
            backend: MeteredBackend::new(self.backend, metrics.clone()),
            registry,
            serializer: self.serializer,
            layout,
            config: self.config,
            metrics,
            closed: AtomicBool::new(false),
        });

        ensure_layout(&ctx).await?;
        let lock = TopologyLock::start(ctx.clone()).await;
        let observables = ObservableCache::new(ctx.clone());

        info!(
            root = ctx.layout.base(),
            classes = ?ctx.registry.class_names(),
            "object store built"
        );
        Ok(ObjectStore {
            ctx,
            lock,
            observables,
        })
    }
}

/// Create every directory the store relies on, tolerating pre-existing
/// nodes so repeated builds against the same backend are safe.
async fn ensure_layout<B: Backend>(ctx: &Arc<StoreCtx<B>>) -> Result<()> {
    let mut dirs = Vec::new();
    for base_dir in ctx.layout.base_dirs() {
        for ancestor in PathLayout::ancestry(&base_dir) {
            if !dirs.contains(&ancestor) {
                dirs.push(ancestor);
            }
        }
    }
    for class in ctx.registry.class_names() {
        dirs.push(ctx.layout.class_models_dir(class));
        dirs.push(ctx.layout.class_objects_dir(class));
    }
    // Locking is on by default; operators delete this node for lock-free
    // mode.
    dirs.push(ctx.layout.topology_lock_path());

    for dir in dirs {
        match ctx
            .backend
            .create(&dir, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::NodeExists => {}
            Err(e) => {
                return Err(ctx.err(StoreError::storage_failure_with_source(
                    format!("could not create {dir}"),
                    e,
                )))
            }
        }
    }
    Ok(())
}

/// One entry of an ordered `multi` batch.
pub struct PersistOp(OpKind);

enum OpKind {
    Create { class: &'static str, doc: Value },
    Update { class: &'static str, doc: Value },
    Delete { class: &'static str, id: ObjId },
    CreateNode { path: String, data: Vec<u8> },
    UpdateNode { path: String, data: Vec<u8> },
    DeleteNode { path: String },
}

impl PersistOp {
    pub fn create<T: ObjectClass>(obj: &T) -> Result<Self> {
        Ok(PersistOp(OpKind::Create {
            class: T::NAME,
            doc: to_document(obj)?,
        }))
    }

    pub fn update<T: ObjectClass>(obj: &T) -> Result<Self> {
        Ok(PersistOp(OpKind::Update {
            class: T::NAME,
            doc: to_document(obj)?,
        }))
    }

    pub fn delete<T: ObjectClass>(id: ObjId) -> Self {
        PersistOp(OpKind::Delete { class: T::NAME, id })
    }

    pub fn create_node(path: impl Into<String>, data: Vec<u8>) -> Self {
        PersistOp(OpKind::CreateNode {
            path: path.into(),
            data,
        })
    }

    pub fn update_node(path: impl Into<String>, data: Vec<u8>) -> Self {
        PersistOp(OpKind::UpdateNode {
            path: path.into(),
            data,
        })
    }

    pub fn delete_node(path: impl Into<String>) -> Self {
        PersistOp(OpKind::DeleteNode { path: path.into() })
    }
}

/// Cloneable handle to the object store.
pub struct ObjectStore<B: Backend> {
    ctx: Arc<StoreCtx<B>>,
    lock: Arc<TopologyLock<B>>,
    observables: Arc<ObservableCache<B>>,
}

impl<B: Backend> Clone for ObjectStore<B> {
    fn clone(&self) -> Self {
        ObjectStore {
            ctx: self.ctx.clone(),
            lock: self.lock.clone(),
            observables: self.observables.clone(),
        }
    }
}

impl<B: Backend> ObjectStore<B> {
    pub fn builder(backend: B) -> StoreBuilder<B> {
        StoreBuilder::new(backend)
    }

    /// Fetch one object.
    pub async fn get<T: ObjectClass>(&self, id: &ObjId) -> Result<T> {
        self.get_with_version(id).await.map(|(obj, _)| obj)
    }

    /// Fetch one object along with its backend payload version, for callers
    /// doing their own compare-and-set bookkeeping.
    pub async fn get_with_version<T: ObjectClass>(&self, id: &ObjId) -> Result<(T, u64)> {
        self.ctx.ensure_open()?;
        self.ctx.registry.class(T::NAME)?;
        let path = self.ctx.layout.object_path(T::NAME, id);
        match self.ctx.backend.get(&path).await {
            Ok((bytes, stat)) => {
                let doc = self.ctx.serializer.decode_document(&bytes)?;
                Ok((from_document(doc)?, stat.version))
            }
            Err(e) => Err(self.ctx.err(read_error(T::NAME, id, e))),
        }
    }

    /// Parallel fan-out of `get` over an explicit id list.
    pub async fn get_many<T: ObjectClass>(&self, ids: &[ObjId]) -> Result<Vec<T>> {
        try_join_all(ids.iter().map(|id| self.get::<T>(id))).await
    }

    /// Fetch every object of a class. The class directory exists from
    /// `build()` on; a missing directory is an internal fault.
    pub async fn get_all<T: ObjectClass>(&self) -> Result<Vec<T>> {
        self.ctx.ensure_open()?;
        self.ctx.registry.class(T::NAME)?;
        let dir = self.ctx.layout.class_models_dir(T::NAME);
        let ids = match self.ctx.backend.children(&dir).await {
            Ok(names) => names.into_iter().map(ObjId::new).collect::<Vec<_>>(),
            Err(e) => {
                return Err(self.ctx.err(StoreError::internal_with_source(
                    format!("class directory for {} unavailable", T::NAME),
                    e,
                )))
            }
        };
        self.get_many(&ids).await
    }

    /// Whether an object exists; missing objects are a `false`, never an
    /// error.
    pub async fn exists<T: ObjectClass>(&self, id: &ObjId) -> Result<bool> {
        self.ctx.ensure_open()?;
        self.ctx.registry.class(T::NAME)?;
        let path = self.ctx.layout.object_path(T::NAME, id);
        match self.ctx.backend.exists(&path).await {
            Ok(stat) => Ok(stat.is_some()),
            Err(e) => Err(self.ctx.err(StoreError::storage_failure_with_source(
                "existence check failed",
                e,
            ))),
        }
    }

    /// Read an object's provenance sibling.
    pub async fn provenance<T: ObjectClass>(&self, id: &ObjId) -> Result<ProvenanceRecord> {
        self.ctx.ensure_open()?;
        self.ctx.registry.class(T::NAME)?;
        let path = self.ctx.layout.provenance_path(T::NAME, id);
        match self.ctx.backend.get(&path).await {
            Ok((bytes, _)) => self.ctx.serializer.decode_provenance(&bytes),
            Err(e) => Err(self.ctx.err(read_error(T::NAME, id, e))),
        }
    }

    /// Open a transaction recorded in provenance under `owner`.
    pub async fn transaction(&self, owner: Owner) -> Result<Transaction<B>> {
        self.ctx.ensure_open()?;
        Transaction::open(self.ctx.clone(), owner).await
    }

    /// Apply an ordered op list in one anonymous transaction.
    pub async fn multi(&self, ops: Vec<PersistOp>) -> Result<()> {
        self.ctx.ensure_open()?;
        let mut tx = Transaction::open(self.ctx.clone(), Owner::anonymous()).await?;
        for op in ops {
            let applied = match op.0 {
                OpKind::Create { class, doc } => tx.create_document(class, doc).await,
                OpKind::Update { class, doc } => tx.update_document(class, doc).await,
                OpKind::Delete { class, id } => tx.delete_key(class, &id, false).await.map(|_| ()),
                OpKind::CreateNode { path, data } => {
                    tx.create_node(path, data);
                    Ok(())
                }
                OpKind::UpdateNode { path, data } => {
                    tx.update_node(path, data);
                    Ok(())
                }
                OpKind::DeleteNode { path } => {
                    tx.delete_node(path);
                    Ok(())
                }
            };
            if let Err(e) = applied {
                tx.close().await;
                return Err(e);
            }
        }
        tx.commit().await
    }

    /// Run `body` in a transaction under the topology lock, retrying the
    /// whole body on `ConcurrentModification` (found anywhere in the error
    /// chain) up to `transaction_attempts − 1` times.
    pub async fn try_transaction<R, F>(&self, owner: Owner, mut body: F) -> Result<R>
    where
        F: for<'t> FnMut(
            &'t mut Transaction<B>,
        ) -> Pin<Box<dyn Future<Output = Result<R>> + Send + 't>>,
    {
        self.ctx.ensure_open()?;
        let attempts = self.ctx.config.transaction_attempts;
        let mut attempt = 1;
        loop {
            let guard = self.lock.acquire().await?;
            let outcome = match Transaction::open(self.ctx.clone(), owner.clone()).await {
                Ok(mut tx) => match body(&mut tx).await {
                    Ok(value) => tx.commit().await.map(|_| value),
                    Err(e) => {
                        tx.close().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            self.lock.release(guard).await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_concurrent_modification() && attempt < attempts => {
                    self.ctx.metrics.record_tx_retry();
                    debug!(attempt, "transaction lost a race; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Live change stream for one object.
    pub fn observable<T: ObjectClass>(&self, id: &ObjId) -> Result<ObjectSubscription<T>> {
        self.ctx.ensure_open()?;
        self.ctx.registry.class(T::NAME)?;
        Ok(self.observables.subscribe::<T>(id))
    }

    /// Live stream of per-object streams for a whole class.
    pub fn class_observable<T: ObjectClass>(&self) -> Result<ClassSubscription<T>> {
        self.ctx.ensure_open()?;
        self.ctx.registry.class(T::NAME)?;
        Ok(self.observables.subscribe_class::<T>())
    }

    /// Whether the store currently operates without the coarse topology
    /// lock (its node is absent).
    pub fn is_lock_free(&self) -> bool {
        self.lock.is_lock_free()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.ctx.metrics
    }

    /// Number of live cached object streams; test observability.
    pub fn live_object_streams(&self) -> usize {
        self.observables.object_entry_count()
    }

    /// Shut the store down: subsequent operations fail with
    /// `ServiceUnavailable` and all live streams are dropped.
    pub async fn close(&self) {
        self.ctx.closed.store(true, Ordering::SeqCst);
        self.observables.shutdown();
        self.lock.shutdown();
        info!("object store closed");
    }
}

fn read_error(class: &str, id: &ObjId, e: BackendError) -> StoreError {
    match e.kind {
        ErrorKind::NoNode => StoreError::not_found(class, id),
        ErrorKind::ConnectionLoss | ErrorKind::SessionExpired => {
            StoreError::storage_failure_with_source("backend read failed", e)
        }
        _ => StoreError::internal_with_source("backend read failed", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeleteAction;
    use serde::{Deserialize, Serialize};
    use topograph_backend::MemoryBackend;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Bridge {
        id: String,
        name: String,
        port_ids: Vec<String>,
    }
    impl ObjectClass for Bridge {
        const NAME: &'static str = "Bridge";
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Port {
        id: String,
        bridge_id: Option<String>,
    }
    impl ObjectClass for Port {
        const NAME: &'static str = "Port";
    }

    async fn store() -> ObjectStore<MemoryBackend> {
        ObjectStore::builder(MemoryBackend::new())
            .register_class::<Bridge>()
            .unwrap()
            .register_class::<Port>()
            .unwrap()
            .bind::<Bridge, Port>(
                BindingEnd::list("port_ids", DeleteAction::Clear),
                BindingEnd::single("bridge_id", DeleteAction::Clear),
            )
            .unwrap()
            .build()
            .await
            .unwrap()
    }

    fn bridge(id: &str) -> Bridge {
        Bridge {
            id: id.to_string(),
            name: format!("bridge-{id}"),
            port_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_read_exists() {
        let store = store().await;
        let b1 = bridge("b1");

        let mut tx = store.transaction(Owner::named("test")).await.unwrap();
        tx.create(&b1).await.unwrap();
        tx.commit().await.unwrap();

        let read: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
        assert_eq!(read, b1);
        assert!(store.exists::<Bridge>(&ObjId::new("b1")).await.unwrap());
        assert!(!store.exists::<Bridge>(&ObjId::new("nope")).await.unwrap());

        let err = store.get::<Bridge>(&ObjId::new("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn get_all_lists_the_class() {
        let store = store().await;
        store
            .multi(vec![
                PersistOp::create(&bridge("b1")).unwrap(),
                PersistOp::create(&bridge("b2")).unwrap(),
            ])
            .await
            .unwrap();

        let mut all: Vec<Bridge> = store.get_all().await.unwrap();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "b1");
        assert_eq!(all[1].id, "b2");
        assert!(store.get_all::<Port>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_applies_in_order_and_atomically() {
        let store = store().await;
        store
            .multi(vec![
                PersistOp::create(&bridge("b1")).unwrap(),
                PersistOp::create(&Port {
                    id: "p1".into(),
                    bridge_id: Some("b1".into()),
                })
                .unwrap(),
            ])
            .await
            .unwrap();

        let b: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
        assert_eq!(b.port_ids, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn provenance_tracks_owner_and_change() {
        let store = store().await;
        let mut tx = store.transaction(Owner::named("agent-7")).await.unwrap();
        tx.create(&bridge("b1")).await.unwrap();
        tx.commit().await.unwrap();

        let rec = store.provenance::<Bridge>(&ObjId::new("b1")).await.unwrap();
        assert_eq!(rec.owner, Owner::named("agent-7"));
        assert_eq!(rec.change, topograph_core::ChangeKind::Create);
    }

    #[tokio::test]
    async fn closed_store_refuses_operations() {
        let store = store().await;
        store.close().await;
        let err = store.get::<Bridge>(&ObjId::new("b1")).await.unwrap_err();
        assert!(matches!(err, StoreError::ServiceUnavailable { .. }));
        let err = store.transaction(Owner::anonymous()).await.unwrap_err();
        assert!(matches!(err, StoreError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn rebuild_against_same_backend_is_idempotent() {
        let backend = MemoryBackend::new();
        let build = |backend: MemoryBackend| async move {
            ObjectStore::builder(backend)
                .register_class::<Bridge>()
                .unwrap()
                .register_class::<Port>()
                .unwrap()
                .build()
                .await
                .unwrap()
        };
        let first = build(backend.clone()).await;
        drop(first);
        build(backend).await;
    }
}
