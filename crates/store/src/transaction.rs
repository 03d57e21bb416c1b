//! Snapshot + plan + commit transactions.
//!
//! A transaction opens by creating an ephemeral sequential marker node; the
//! marker's creation zxid is the snapshot ceiling `Z`. Every object read
//! fetches payload and provenance siblings in parallel and caches them for
//! the life of the transaction; the planner rewrites cached documents as it
//! schedules mutations, so later reads see the transaction's own writes. Any
//! read whose backend mzxid exceeds `Z` aborts with
//! `ConcurrentModification`; so does any version mismatch reported by the
//! atomic commit.
//!
//! Mutations are driven through the binding catalog: creating or updating an
//! object schedules inverse updates on every referenced peer, deleting one
//! applies the per-field on-delete action (reject, clear, or cascade).
//! Before commit the planner has already consolidated everything to at most
//! one write per object; commit expands that into a single backend multi-op
//! and maps a failure back to the user intent at the failing index.
//!
//! A transaction object is not thread-safe; it is confined to the task that
//! opened it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use topograph_backend::{
    Backend, BackendError, BackendOp, CreateMode, ErrorKind,
};
use topograph_core::{ChangeKind, ObjId, Owner, ProvenanceRecord, Result, StoreError};

use crate::class::{
    from_document, id_of, list_add, list_remove, ref_targets, to_document, write_single, ObjKey,
    ObjectClass,
};
use crate::registry::{DeleteAction, FieldBinding, FieldKind};
use crate::store::StoreCtx;

/// Consolidated per-object mutation.
#[derive(Debug, Clone)]
enum TxOp {
    Create(Value),
    Update(Value),
    Delete,
}

/// Snapshot of one object inside the transaction.
///
/// `doc` is the transaction's current view and is rewritten by the planner;
/// `version`/`prov_version` stay pinned to the backend state observed at
/// first read and guard the commit CAS.
#[derive(Debug)]
struct CachedObject {
    doc: Option<Value>,
    version: Option<u64>,
    prov: Option<ProvenanceRecord>,
    prov_version: Option<u64>,
}

/// Raw node operation scheduled alongside object writes.
#[derive(Debug, Clone)]
enum NodeOpPlan {
    Create { path: String, data: Vec<u8> },
    Update { path: String, data: Vec<u8> },
    Delete { path: String },
    DeleteRecursive { path: String },
}

/// What the user asked for at a given multi-op index; used to map a backend
/// failure back onto the right surface error.
#[derive(Debug, Clone)]
enum Intent {
    CreateObject(ObjKey),
    UpdateObject(ObjKey),
    DeleteObject(ObjKey),
    ProvWrite(ObjKey),
    RawCreate(String),
    RawUpdate(String),
    RawDelete(String),
}

/// A single logical transaction against the store.
pub struct Transaction<B: Backend> {
    ctx: Arc<StoreCtx<B>>,
    owner: Owner,
    marker_path: String,
    ceiling: u64,
    cache: FxHashMap<ObjKey, CachedObject>,
    order: Vec<ObjKey>,
    ops: FxHashMap<ObjKey, TxOp>,
    node_ops: Vec<NodeOpPlan>,
    finished: bool,
}

impl<B: Backend> std::fmt::Debug for Transaction<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("owner", &self.owner)
            .field("marker_path", &self.marker_path)
            .field("ceiling", &self.ceiling)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<B: Backend> Transaction<B> {
    /// Open a transaction: create the marker node and record the snapshot
    /// ceiling from its creation zxid.
    pub(crate) async fn open(ctx: Arc<StoreCtx<B>>, owner: Owner) -> Result<Self> {
        let payload = serde_json::to_vec(&json!({
            "owner": owner.name(),
            "opened_at": Utc::now().to_rfc3339(),
        }))?;
        let prefix = ctx.layout.tx_marker_prefix();
        let (marker_path, stat) = ctx
            .backend
            .create(&prefix, payload, CreateMode::EphemeralSequential)
            .await
            .map_err(|e| {
                ctx.err(StoreError::storage_failure_with_source(
                    "could not open transaction marker",
                    e,
                ))
            })?;
        debug!(marker = %marker_path, ceiling = stat.czxid, "transaction opened");
        Ok(Transaction {
            ctx,
            owner,
            marker_path,
            ceiling: stat.czxid,
            cache: FxHashMap::default(),
            order: Vec::new(),
            ops: FxHashMap::default(),
            node_ops: Vec::new(),
            finished: false,
        })
    }

    /// Snapshot ceiling `Z`; reads of anything modified past it abort.
    pub fn snapshot_ceiling(&self) -> u64 {
        self.ceiling
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read an object inside the transaction's snapshot.
    pub async fn get<T: ObjectClass>(&mut self, id: &ObjId) -> Result<T> {
        let key = ObjKey::new(T::NAME, id.clone());
        self.ensure_loaded(&key).await?;
        match self.view_doc(&key) {
            Some(doc) => from_document(doc.clone()),
            None => Err(self
                .ctx
                .err(StoreError::not_found(T::NAME, id))),
        }
    }

    /// Whether an object exists in the transaction's view.
    pub async fn exists<T: ObjectClass>(&mut self, id: &ObjId) -> Result<bool> {
        let key = ObjKey::new(T::NAME, id.clone());
        self.ensure_loaded(&key).await?;
        Ok(self.view_doc(&key).is_some())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create an object and schedule inverse updates on every referenced
    /// peer.
    pub async fn create<T: ObjectClass>(&mut self, obj: &T) -> Result<()> {
        let doc = to_document(obj)?;
        self.create_document(T::NAME, doc).await
    }

    /// Update an object; bound-field deltas propagate to affected peers.
    pub async fn update<T: ObjectClass>(&mut self, obj: &T) -> Result<()> {
        self.update_with(obj, |_old: &T, _new: &T| Ok(())).await
    }

    /// Update with a validator that may reject the new value against the
    /// snapshot.
    pub async fn update_with<T, F>(&mut self, obj: &T, validator: F) -> Result<()>
    where
        T: ObjectClass,
        F: FnOnce(&T, &T) -> Result<()>,
    {
        let doc = to_document(obj)?;
        let id_field = self.ctx.registry.class(T::NAME)?.id_field.clone();
        let id = id_of(&doc, T::NAME, &id_field)?;
        let key = ObjKey::new(T::NAME, id.clone());
        self.ensure_loaded(&key).await?;
        let old_doc = match self.view_doc(&key) {
            Some(d) => d.clone(),
            None => return Err(self.ctx.err(StoreError::not_found(T::NAME, &id))),
        };
        let old: T = from_document(old_doc)?;
        validator(&old, obj)?;
        self.update_document(T::NAME, doc).await
    }

    /// Delete an object, applying each bound field's on-delete action.
    pub async fn delete<T: ObjectClass>(&mut self, id: &ObjId) -> Result<()> {
        self.delete_key(T::NAME, id, false).await.map(|_| ())
    }

    /// Idempotent delete: returns false instead of failing when the object
    /// does not exist.
    pub async fn delete_if_exists<T: ObjectClass>(&mut self, id: &ObjId) -> Result<bool> {
        self.delete_key(T::NAME, id, true).await
    }

    /// Schedule a raw node create, atomic with the rest of the transaction.
    pub fn create_node(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.node_ops.push(NodeOpPlan::Create {
            path: path.into(),
            data,
        });
    }

    /// Schedule a raw node data replacement.
    pub fn update_node(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.node_ops.push(NodeOpPlan::Update {
            path: path.into(),
            data,
        });
    }

    /// Schedule a raw node delete.
    pub fn delete_node(&mut self, path: impl Into<String>) {
        self.node_ops.push(NodeOpPlan::Delete { path: path.into() });
    }

    /// Schedule a raw node delete including all descendants (expanded at
    /// commit time).
    pub fn delete_node_recursive(&mut self, path: impl Into<String>) {
        self.node_ops
            .push(NodeOpPlan::DeleteRecursive { path: path.into() });
    }

    // ------------------------------------------------------------------
    // Document-level operations (shared with the facade's `multi`)
    // ------------------------------------------------------------------

    pub(crate) async fn create_document(&mut self, class: &str, doc: Value) -> Result<()> {
        let info = self.ctx.registry.class(class)?;
        let id_field = info.id_field.clone();
        let bindings: Vec<Arc<FieldBinding>> = info.bindings().cloned().collect();
        let id = id_of(&doc, class, &id_field)?;
        let key = ObjKey::new(class, id.clone());

        self.ensure_loaded(&key).await?;
        if self.view_doc(&key).is_some() {
            return Err(self.ctx.err(StoreError::object_exists(class, &id)));
        }
        self.schedule(key.clone(), TxOp::Create(doc.clone()))?;

        for binding in &bindings {
            for target in ref_targets(&doc, &binding.field, binding.kind) {
                self.add_backreference(binding, &key.id, &target).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn update_document(&mut self, class: &str, doc: Value) -> Result<()> {
        let info = self.ctx.registry.class(class)?;
        let id_field = info.id_field.clone();
        let bindings: Vec<Arc<FieldBinding>> = info.bindings().cloned().collect();
        let id = id_of(&doc, class, &id_field)?;
        let key = ObjKey::new(class, id.clone());

        self.ensure_loaded(&key).await?;
        let old_doc = match self.view_doc(&key) {
            Some(d) => d.clone(),
            None => return Err(self.ctx.err(StoreError::not_found(class, &id))),
        };
        self.schedule(key.clone(), TxOp::Update(doc.clone()))?;

        for binding in &bindings {
            let old_ids = ref_targets(&old_doc, &binding.field, binding.kind);
            let new_ids = ref_targets(&doc, &binding.field, binding.kind);
            for removed in old_ids.iter().filter(|t| !new_ids.contains(t)) {
                self.clear_backreference(binding, &key.id, removed).await?;
            }
            for added in new_ids.iter().filter(|t| !old_ids.contains(t)) {
                self.add_backreference(binding, &key.id, added).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn delete_key(
        &mut self,
        class: &str,
        id: &ObjId,
        ignore_missing: bool,
    ) -> Result<bool> {
        let key = ObjKey::new(class, id.clone());
        self.ensure_loaded(&key).await?;
        if self.view_doc(&key).is_none() {
            if ignore_missing {
                return Ok(false);
            }
            return Err(self.ctx.err(StoreError::not_found(class, id)));
        }
        self.delete_cascading(key).await?;
        Ok(true)
    }

    /// Recursive delete driver. The transaction view doubles as the visited
    /// set: an object already deleted in this transaction reads as absent,
    /// which terminates reference cycles.
    fn delete_cascading(
        &mut self,
        key: ObjKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_loaded(&key).await?;
            let doc = match self.view_doc(&key) {
                Some(d) => d.clone(),
                None => return Ok(()),
            };
            let bindings: Vec<Arc<FieldBinding>> = self
                .ctx
                .registry
                .class(&key.class)?
                .bindings()
                .cloned()
                .collect();

            self.schedule(key.clone(), TxOp::Delete)?;

            for binding in &bindings {
                let targets = ref_targets(&doc, &binding.field, binding.kind);
                if targets.is_empty() {
                    continue;
                }
                match binding.on_delete {
                    DeleteAction::Error => {
                        return Err(self.ctx.err(StoreError::object_referenced(
                            key.class.clone(),
                            &key.id,
                            binding.field.clone(),
                        )));
                    }
                    DeleteAction::Clear => {
                        for target in &targets {
                            self.clear_backreference(binding, &key.id, target).await?;
                        }
                    }
                    DeleteAction::Cascade => {
                        for target in &targets {
                            let peer = ObjKey::new(binding.peer_class.clone(), target.clone());
                            self.delete_cascading(peer).await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Binding propagation
    // ------------------------------------------------------------------

    /// Write `from` into the peer's inverse field.
    ///
    /// Enforces both the no-dangling rule (the peer must exist in the
    /// transaction view) and the no-stealing rule (a populated
    /// single-reference field is never silently re-pointed).
    async fn add_backreference(
        &mut self,
        binding: &FieldBinding,
        from: &ObjId,
        peer_id: &ObjId,
    ) -> Result<()> {
        let peer_key = ObjKey::new(binding.peer_class.clone(), peer_id.clone());
        self.ensure_loaded(&peer_key).await?;
        let mut peer_doc = match self.view_doc(&peer_key) {
            Some(d) => d.clone(),
            None => {
                return Err(self
                    .ctx
                    .err(StoreError::not_found(binding.peer_class.clone(), peer_id)))
            }
        };
        match binding.peer_kind {
            FieldKind::Single => {
                let current = ref_targets(&peer_doc, &binding.peer_field, FieldKind::Single);
                match current.first() {
                    Some(existing) if existing == from => return Ok(()),
                    Some(_) => {
                        return Err(self.ctx.err(StoreError::reference_conflict(
                            binding.peer_class.clone(),
                            peer_id,
                            binding.peer_field.clone(),
                        )));
                    }
                    None => write_single(&mut peer_doc, &binding.peer_field, Some(from)),
                }
            }
            FieldKind::List => {
                let current = ref_targets(&peer_doc, &binding.peer_field, FieldKind::List);
                if current.contains(from) {
                    return Ok(());
                }
                list_add(&mut peer_doc, &binding.peer_field, from);
            }
        }
        self.schedule(peer_key, TxOp::Update(peer_doc))
    }

    /// Remove `from` from the peer's inverse field. A peer already gone
    /// (cascade-deleted in this transaction) is skipped.
    async fn clear_backreference(
        &mut self,
        binding: &FieldBinding,
        from: &ObjId,
        peer_id: &ObjId,
    ) -> Result<()> {
        let peer_key = ObjKey::new(binding.peer_class.clone(), peer_id.clone());
        self.ensure_loaded(&peer_key).await?;
        let mut peer_doc = match self.view_doc(&peer_key) {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        match binding.peer_kind {
            FieldKind::Single => {
                let current = ref_targets(&peer_doc, &binding.peer_field, FieldKind::Single);
                if current.first() != Some(from) {
                    return Ok(());
                }
                write_single(&mut peer_doc, &binding.peer_field, None);
            }
            FieldKind::List => {
                let current = ref_targets(&peer_doc, &binding.peer_field, FieldKind::List);
                if !current.contains(from) {
                    return Ok(());
                }
                list_remove(&mut peer_doc, &binding.peer_field, from);
            }
        }
        self.schedule(peer_key, TxOp::Update(peer_doc))
    }

    // ------------------------------------------------------------------
    // Snapshot cache
    // ------------------------------------------------------------------

    /// Fetch object and provenance siblings in parallel and pin them in the
    /// snapshot cache. A backend mzxid past the ceiling aborts immediately.
    async fn ensure_loaded(&mut self, key: &ObjKey) -> Result<()> {
        if self.cache.contains_key(key) {
            return Ok(());
        }
        self.ctx.registry.class(&key.class)?;
        let ctx = self.ctx.clone();
        let obj_path = ctx.layout.object_path(&key.class, &key.id);
        let prov_path = ctx.layout.provenance_path(&key.class, &key.id);

        let (obj_res, prov_res) =
            tokio::join!(ctx.backend.get(&obj_path), ctx.backend.get(&prov_path));

        let (doc, version) = match obj_res {
            Ok((bytes, stat)) => {
                if stat.mzxid > self.ceiling {
                    return Err(self.ctx.err(StoreError::concurrent_modification(format!(
                        "{key} modified after the transaction snapshot"
                    ))));
                }
                (Some(ctx.serializer.decode_document(&bytes)?), Some(stat.version))
            }
            Err(e) if e.kind == ErrorKind::NoNode => (None, None),
            Err(e) => return Err(self.ctx.err(read_failure(e))),
        };
        let (prov, prov_version) = match prov_res {
            Ok((bytes, stat)) => {
                if stat.mzxid > self.ceiling {
                    return Err(self.ctx.err(StoreError::concurrent_modification(format!(
                        "{key} provenance modified after the transaction snapshot"
                    ))));
                }
                (
                    Some(ctx.serializer.decode_provenance(&bytes)?),
                    Some(stat.version),
                )
            }
            Err(e) if e.kind == ErrorKind::NoNode => (None, None),
            Err(e) => return Err(self.ctx.err(read_failure(e))),
        };

        self.cache.insert(
            key.clone(),
            CachedObject {
                doc,
                version,
                prov,
                prov_version,
            },
        );
        Ok(())
    }

    fn view_doc(&self, key: &ObjKey) -> Option<&Value> {
        self.cache.get(key).and_then(|c| c.doc.as_ref())
    }

    /// Merge a new operation into the plan and advance the cached view.
    fn schedule(&mut self, key: ObjKey, op: TxOp) -> Result<()> {
        let new_view = match &op {
            TxOp::Create(d) | TxOp::Update(d) => Some(d.clone()),
            TxOp::Delete => None,
        };

        let merged = match (self.ops.remove(&key), op) {
            (None, op) => Some(op),
            (Some(TxOp::Create(_)), TxOp::Update(d)) => Some(TxOp::Create(d)),
            // Create then delete within one transaction cancels out.
            (Some(TxOp::Create(_)), TxOp::Delete) => None,
            (Some(TxOp::Update(_)), TxOp::Update(d)) => Some(TxOp::Update(d)),
            (Some(TxOp::Update(_)), TxOp::Delete) => Some(TxOp::Delete),
            (Some(TxOp::Delete), TxOp::Create(_)) => {
                return Err(self.ctx.err(StoreError::internal(format!(
                    "{key} cannot be re-created in the transaction that deletes it"
                ))));
            }
            (Some(prev), _) => {
                self.ops.insert(key.clone(), prev);
                return Err(self
                    .ctx
                    .err(StoreError::internal(format!("conflicting plan for {key}"))));
            }
        };

        if let Some(merged) = merged {
            if !self.ops.contains_key(&key) && !self.order.contains(&key) {
                self.order.push(key.clone());
            }
            self.ops.insert(key.clone(), merged);
        }
        if let Some(entry) = self.cache.get_mut(&key) {
            entry.doc = new_view;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Flatten the plan into one atomic backend submission.
    pub async fn commit(mut self) -> Result<()> {
        if self.finished {
            return Err(StoreError::internal("transaction already finished"));
        }
        let (backend_ops, intents) = match self.flatten().await {
            Ok(v) => v,
            Err(e) => {
                self.release_marker().await;
                return Err(e);
            }
        };
        if backend_ops.is_empty() {
            self.release_marker().await;
            return Ok(());
        }

        let result = self.ctx.backend.multi(backend_ops).await;
        self.release_marker().await;
        match result {
            Ok(_) => Ok(()),
            Err(multi) => {
                let intent = intents.get(multi.index).cloned().unwrap_or_else(|| {
                    Intent::RawUpdate(multi.error.path.clone())
                });
                Err(self.ctx.err(map_failure(&intent, multi.error)))
            }
        }
    }

    /// Discard the transaction without committing.
    pub async fn close(mut self) {
        self.release_marker().await;
    }

    async fn flatten(&mut self) -> Result<(Vec<BackendOp>, Vec<Intent>)> {
        let mut backend_ops = Vec::new();
        let mut intents = Vec::new();

        for key in &self.order {
            // Cancelled entries (create-then-delete) have no op left.
            let Some(op) = self.ops.get(key) else { continue };
            let entry = self
                .cache
                .get(key)
                .ok_or_else(|| StoreError::internal(format!("no snapshot for planned {key}")))?;
            let obj_path = self.ctx.layout.object_path(&key.class, &key.id);
            let prov_path = self.ctx.layout.provenance_path(&key.class, &key.id);

            match op {
                TxOp::Create(doc) => {
                    backend_ops.push(BackendOp::Create {
                        path: obj_path,
                        data: self.ctx.serializer.encode_document(doc)?,
                        mode: CreateMode::Persistent,
                    });
                    intents.push(Intent::CreateObject(key.clone()));

                    let record = ProvenanceRecord::new(self.owner.clone(), ChangeKind::Create);
                    backend_ops.push(BackendOp::Create {
                        path: prov_path,
                        data: self.ctx.serializer.encode_provenance(&record)?,
                        mode: CreateMode::Persistent,
                    });
                    intents.push(Intent::ProvWrite(key.clone()));
                }
                TxOp::Update(doc) => {
                    let version = entry.version.ok_or_else(|| {
                        StoreError::internal(format!("update of {key} without a snapshot version"))
                    })?;
                    backend_ops.push(BackendOp::SetData {
                        path: obj_path,
                        data: self.ctx.serializer.encode_document(doc)?,
                        expected: Some(version),
                    });
                    intents.push(Intent::UpdateObject(key.clone()));

                    let record = ProvenanceRecord::new(self.owner.clone(), ChangeKind::Update);
                    match entry.prov_version {
                        // Unchanged provenance bytes are skipped to reduce churn.
                        Some(_) if entry.prov.as_ref() == Some(&record) => {}
                        Some(prov_version) => {
                            backend_ops.push(BackendOp::SetData {
                                path: prov_path,
                                data: self.ctx.serializer.encode_provenance(&record)?,
                                expected: Some(prov_version),
                            });
                            intents.push(Intent::ProvWrite(key.clone()));
                        }
                        // Legacy object without a provenance sibling.
                        None => {
                            backend_ops.push(BackendOp::Create {
                                path: prov_path,
                                data: self.ctx.serializer.encode_provenance(&record)?,
                                mode: CreateMode::Persistent,
                            });
                            intents.push(Intent::ProvWrite(key.clone()));
                        }
                    }
                }
                TxOp::Delete => {
                    let version = entry.version.ok_or_else(|| {
                        StoreError::internal(format!("delete of {key} without a snapshot version"))
                    })?;
                    backend_ops.push(BackendOp::Delete {
                        path: obj_path,
                        expected: Some(version),
                    });
                    intents.push(Intent::DeleteObject(key.clone()));
                    if let Some(prov_version) = entry.prov_version {
                        backend_ops.push(BackendOp::Delete {
                            path: prov_path,
                            expected: Some(prov_version),
                        });
                        intents.push(Intent::ProvWrite(key.clone()));
                    }
                }
            }
        }

        for plan in self.node_ops.clone() {
            match plan {
                NodeOpPlan::Create { path, data } => {
                    backend_ops.push(BackendOp::Create {
                        path: path.clone(),
                        data,
                        mode: CreateMode::Persistent,
                    });
                    intents.push(Intent::RawCreate(path));
                }
                NodeOpPlan::Update { path, data } => {
                    backend_ops.push(BackendOp::SetData {
                        path: path.clone(),
                        data,
                        expected: None,
                    });
                    intents.push(Intent::RawUpdate(path));
                }
                NodeOpPlan::Delete { path } => {
                    backend_ops.push(BackendOp::Delete {
                        path: path.clone(),
                        expected: None,
                    });
                    intents.push(Intent::RawDelete(path));
                }
                NodeOpPlan::DeleteRecursive { path } => {
                    for descendant in self.descendants_deepest_first(&path).await {
                        backend_ops.push(BackendOp::Delete {
                            path: descendant.clone(),
                            expected: None,
                        });
                        intents.push(Intent::RawDelete(descendant));
                    }
                }
            }
        }
        Ok((backend_ops, intents))
    }

    /// Expand a recursive delete into per-node deletes, deepest first. A
    /// missing root degrades to a plain delete so the commit surfaces the
    /// usual not-found error.
    async fn descendants_deepest_first(&self, root: &str) -> Vec<String> {
        let mut stack = vec![root.to_string()];
        let mut ordered = Vec::new();
        while let Some(path) = stack.pop() {
            ordered.push(path.clone());
            if let Ok(children) = self.ctx.backend.children(&path).await {
                for child in children {
                    stack.push(format!("{path}/{child}"));
                }
            }
        }
        ordered.reverse();
        ordered
    }

    /// Delete the marker node; failure is logged, never raised (the node is
    /// ephemeral and self-clears with the session).
    async fn release_marker(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.ctx.backend.delete(&self.marker_path, None).await {
            warn!(marker = %self.marker_path, error = %e, "transaction marker release failed");
        }
    }
}

impl<B: Backend> Drop for Transaction<B> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned without commit/close: clear the marker in the background
        // if a runtime is still around; the session would clear it anyway.
        self.finished = true;
        let ctx = self.ctx.clone();
        let marker = self.marker_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = ctx.backend.delete(&marker, None).await {
                    warn!(marker = %marker, error = %e, "dropped transaction marker release failed");
                }
            });
        }
    }
}

fn read_failure(e: BackendError) -> StoreError {
    match e.kind {
        ErrorKind::ConnectionLoss | ErrorKind::SessionExpired => {
            StoreError::storage_failure_with_source("backend read failed", e)
        }
        _ => StoreError::internal_with_source("backend read failed", e),
    }
}

/// Map a failing multi-op back to the user intent at that index.
fn map_failure(intent: &Intent, error: BackendError) -> StoreError {
    match error.kind {
        ErrorKind::NodeExists => match intent {
            Intent::CreateObject(key) => StoreError::object_exists(key.class.clone(), &key.id),
            Intent::RawCreate(path) => StoreError::storage_node_exists(path.clone()),
            _ => StoreError::concurrent_modification(format!("unexpected node at {}", error.path)),
        },
        ErrorKind::NoNode => match intent {
            Intent::RawUpdate(path) | Intent::RawDelete(path) => {
                StoreError::storage_node_not_found(path.clone())
            }
            _ => StoreError::concurrent_modification(format!("{} vanished before commit", error.path)),
        },
        ErrorKind::BadVersion | ErrorKind::NotEmpty => {
            StoreError::concurrent_modification(format!("commit lost the race at {}", error.path))
        }
        ErrorKind::ConnectionLoss | ErrorKind::SessionExpired => {
            StoreError::storage_failure_with_source("commit submission failed", error)
        }
        _ => StoreError::internal_with_source("commit submission failed", error),
    }
}
