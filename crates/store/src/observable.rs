//! Observable cache.
//!
//! Live change streams are deduplicated per `(class, id)` and per class: the
//! first subscription creates an entry wrapping a backend watch and spawns a
//! driver task; later subscriptions share the same upstream. Entries carry a
//! monotonically assigned reference number and eviction compares it, so a
//! stale removal can never take out a replacement entry.
//!
//! Per-object streams emit the current value on subscribe and on every
//! change, complete on deletion, and surface `NotFound` as a terminal error
//! when the object does not exist. A watch that closes without a terminal
//! event (session loss) is transparently re-established; the only visible
//! trace is the recovery counter. Per-class streams emit one object stream
//! per existing and subsequently created object.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use topograph_backend::{Backend, ChildEvent, DataEvent, ErrorKind};
use topograph_core::{ObjId, Result, StoreError};

use crate::class::{from_document, ObjKey, ObjectClass};
use crate::store::StoreCtx;

/// Event fanned out to object subscribers.
#[derive(Clone)]
enum ObjectEvent {
    Data(Arc<Vec<u8>>),
    NotFound,
    Complete,
}

/// Notifies the owning driver when a subscriber goes away.
struct SubscriptionGuard {
    notify: Arc<Notify>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}

struct ObjectFanoutInner {
    subs: Vec<mpsc::UnboundedSender<ObjectEvent>>,
    last: Option<ObjectEvent>,
    terminal: bool,
}

struct ObjectFanout {
    inner: Mutex<ObjectFanoutInner>,
    gone: Arc<Notify>,
}

impl ObjectFanout {
    fn new() -> Self {
        ObjectFanout {
            inner: Mutex::new(ObjectFanoutInner {
                subs: Vec::new(),
                last: None,
                terminal: false,
            }),
            gone: Arc::new(Notify::new()),
        }
    }

    /// Join the fanout, receiving the most recent value immediately.
    /// Returns `None` once the stream is terminal; the caller then evicts
    /// the stale entry and builds a fresh one.
    fn try_subscribe(&self) -> Option<mpsc::UnboundedReceiver<ObjectEvent>> {
        let mut inner = self.inner.lock();
        if inner.terminal {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(last) = &inner.last {
            let _ = tx.send(last.clone());
        }
        inner.subs.push(tx);
        Some(rx)
    }

    fn emit(&self, event: ObjectEvent) {
        let mut inner = self.inner.lock();
        inner.last = Some(event.clone());
        inner.subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn emit_terminal(&self, event: ObjectEvent) {
        let mut inner = self.inner.lock();
        inner.terminal = true;
        for tx in inner.subs.drain(..) {
            let _ = tx.send(event.clone());
        }
    }

    /// Drop closed subscribers; true if nobody is left.
    fn prune(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.subs.retain(|tx| !tx.is_closed());
        inner.subs.is_empty()
    }
}

struct ObjectEntry {
    refnum: u64,
    fanout: Arc<ObjectFanout>,
    task: JoinHandle<()>,
}

/// Untyped object subscription handed to typed wrappers.
struct RawSubscription {
    key: ObjKey,
    rx: mpsc::UnboundedReceiver<ObjectEvent>,
    _guard: SubscriptionGuard,
}

struct ClassFanoutInner {
    subs: Vec<mpsc::UnboundedSender<RawSubscription>>,
    known: std::collections::BTreeSet<ObjId>,
    terminal: bool,
}

struct ClassFanout {
    inner: Mutex<ClassFanoutInner>,
    gone: Arc<Notify>,
}

impl ClassFanout {
    fn new() -> Self {
        ClassFanout {
            inner: Mutex::new(ClassFanoutInner {
                subs: Vec::new(),
                known: std::collections::BTreeSet::new(),
                terminal: false,
            }),
            gone: Arc::new(Notify::new()),
        }
    }

    fn prune(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.subs.retain(|tx| !tx.is_closed());
        inner.subs.is_empty()
    }
}

struct ClassEntry {
    refnum: u64,
    fanout: Arc<ClassFanout>,
    task: JoinHandle<()>,
}

/// Process-wide cache of live subscriptions.
pub(crate) struct ObservableCache<B: Backend> {
    ctx: Arc<StoreCtx<B>>,
    objects: DashMap<ObjKey, ObjectEntry>,
    classes: DashMap<String, ClassEntry>,
    next_ref: AtomicU64,
}

impl<B: Backend> ObservableCache<B> {
    pub fn new(ctx: Arc<StoreCtx<B>>) -> Arc<Self> {
        Arc::new(ObservableCache {
            ctx,
            objects: DashMap::new(),
            classes: DashMap::new(),
            next_ref: AtomicU64::new(1),
        })
    }

    /// Subscribe to one object's change stream.
    pub fn subscribe<T: ObjectClass>(self: &Arc<Self>, id: &ObjId) -> ObjectSubscription<T> {
        let key = ObjKey::new(T::NAME, id.clone());
        let raw = self.subscribe_raw(key);
        ObjectSubscription {
            serializer: self.ctx.serializer.clone(),
            raw,
            done: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Subscribe to a class: one object stream per existing and future
    /// instance.
    pub fn subscribe_class<T: ObjectClass>(self: &Arc<Self>) -> ClassSubscription<T> {
        let class = T::NAME.to_string();
        loop {
            if let Some(entry) = self.classes.get(&class) {
                let refnum = entry.refnum;
                let fanout = entry.fanout.clone();
                drop(entry);
                let mut inner = fanout.inner.lock();
                if !inner.terminal {
                    let (tx, rx) = mpsc::unbounded_channel();
                    // Seed the new subscriber with streams for every known
                    // object before it sees incremental additions.
                    for id in inner.known.clone() {
                        let raw = self.subscribe_raw(ObjKey::new(class.clone(), id));
                        let _ = tx.send(raw);
                    }
                    inner.subs.push(tx);
                    drop(inner);
                    return ClassSubscription {
                        serializer: self.ctx.serializer.clone(),
                        rx,
                        _guard: SubscriptionGuard {
                            notify: fanout.gone.clone(),
                        },
                        _marker: std::marker::PhantomData,
                    };
                }
                drop(inner);
                self.classes.remove_if(&class, |_, e| e.refnum == refnum);
                continue;
            }

            // First subscriber: join the fresh fanout before the driver can
            // run, so a fast terminal emission cannot be missed.
            let refnum = self.next_ref.fetch_add(1, Ordering::Relaxed);
            let fanout = Arc::new(ClassFanout::new());
            let (tx, rx) = mpsc::unbounded_channel();
            fanout.inner.lock().subs.push(tx);
            match self.classes.entry(class.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let task = tokio::spawn(drive_class(
                        self.clone(),
                        class.clone(),
                        fanout.clone(),
                        refnum,
                    ));
                    slot.insert(ClassEntry {
                        refnum,
                        fanout: fanout.clone(),
                        task,
                    });
                    return ClassSubscription {
                        serializer: self.ctx.serializer.clone(),
                        rx,
                        _guard: SubscriptionGuard {
                            notify: fanout.gone.clone(),
                        },
                        _marker: std::marker::PhantomData,
                    };
                }
            }
        }
    }

    fn subscribe_raw(self: &Arc<Self>, key: ObjKey) -> RawSubscription {
        loop {
            if let Some(entry) = self.objects.get(&key) {
                let refnum = entry.refnum;
                let fanout = entry.fanout.clone();
                drop(entry);
                if let Some(rx) = fanout.try_subscribe() {
                    return RawSubscription {
                        key,
                        rx,
                        _guard: SubscriptionGuard {
                            notify: fanout.gone.clone(),
                        },
                    };
                }
                // Terminal stream still cached: evict (refnum-guarded) and
                // build a replacement.
                self.objects.remove_if(&key, |_, e| e.refnum == refnum);
                continue;
            }

            // First subscriber: join the fresh fanout before the driver can
            // run, so a fast terminal emission cannot be missed.
            let refnum = self.next_ref.fetch_add(1, Ordering::Relaxed);
            let fanout = Arc::new(ObjectFanout::new());
            let rx = match fanout.try_subscribe() {
                Some(rx) => rx,
                None => continue,
            };
            match self.objects.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let task = tokio::spawn(drive_object(
                        self.clone(),
                        key.clone(),
                        fanout.clone(),
                        refnum,
                    ));
                    slot.insert(ObjectEntry {
                        refnum,
                        fanout: fanout.clone(),
                        task,
                    });
                    return RawSubscription {
                        key,
                        rx,
                        _guard: SubscriptionGuard {
                            notify: fanout.gone.clone(),
                        },
                    };
                }
            }
        }
    }

    fn evict_object(&self, key: &ObjKey, refnum: u64) {
        self.objects.remove_if(key, |_, e| e.refnum == refnum);
    }

    fn evict_class(&self, class: &str, refnum: u64) {
        self.classes.remove_if(class, |_, e| e.refnum == refnum);
    }

    /// Number of live per-object entries; test observability.
    pub fn object_entry_count(&self) -> usize {
        self.objects.len()
    }

    /// Abort every driver and drop all entries.
    pub fn shutdown(&self) {
        self.objects.retain(|_, entry| {
            entry.task.abort();
            false
        });
        self.classes.retain(|_, entry| {
            entry.task.abort();
            false
        });
    }
}

/// Driver for one object entry: pump backend watch events into the fanout,
/// re-arming after interruptions, and evict the entry on terminal events or
/// when the last subscriber leaves.
async fn drive_object<B: Backend>(
    cache: Arc<ObservableCache<B>>,
    key: ObjKey,
    fanout: Arc<ObjectFanout>,
    refnum: u64,
) {
    let path = cache.ctx.layout.object_path(&key.class, &key.id);
    let mut seen_value = false;
    loop {
        let mut watch = match cache.ctx.backend.watch_data(&path).await {
            Ok(w) => w,
            Err(e) => {
                warn!(key = %key, error = %e, "object watch could not arm; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
        };

        match watch.initial {
            Some((data, _)) => {
                seen_value = true;
                fanout.emit(ObjectEvent::Data(Arc::new(data)));
            }
            None if seen_value => {
                // Deleted while the watch was down.
                fanout.emit_terminal(ObjectEvent::Complete);
                cache.evict_object(&key, refnum);
                return;
            }
            None => {
                fanout.emit_terminal(ObjectEvent::NotFound);
                cache.evict_object(&key, refnum);
                return;
            }
        }

        loop {
            tokio::select! {
                event = watch.events.recv() => match event {
                    Some(DataEvent::Changed { data, .. }) => {
                        seen_value = true;
                        fanout.emit(ObjectEvent::Data(Arc::new(data)));
                    }
                    Some(DataEvent::Deleted) => {
                        fanout.emit_terminal(ObjectEvent::Complete);
                        cache.evict_object(&key, refnum);
                        return;
                    }
                    None => {
                        cache.ctx.metrics.record_observable_recovery();
                        debug!(key = %key, "object watch interrupted; re-arming");
                        break;
                    }
                },
                _ = fanout.gone.notified() => {
                    if fanout.prune() {
                        cache.evict_object(&key, refnum);
                        return;
                    }
                }
            }
        }
    }
}

/// Driver for one class entry: track directory membership and hand every
/// subscriber a stream per member.
async fn drive_class<B: Backend>(
    cache: Arc<ObservableCache<B>>,
    class: String,
    fanout: Arc<ClassFanout>,
    refnum: u64,
) {
    let path = cache.ctx.layout.class_models_dir(&class);
    loop {
        let mut watch = match cache.ctx.backend.watch_children(&path).await {
            Ok(w) => w,
            Err(e) if e.kind == ErrorKind::NoNode => {
                // Class directories exist from build() on; a missing one is
                // an internal fault, surfaced by ending every stream.
                warn!(class = %class, "class directory missing; closing class streams");
                {
                    let mut inner = fanout.inner.lock();
                    inner.terminal = true;
                    inner.subs.clear();
                }
                cache.evict_class(&class, refnum);
                return;
            }
            Err(e) => {
                warn!(class = %class, error = %e, "class watch could not arm; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
        };

        for name in watch.initial.drain(..) {
            emit_member(&cache, &class, &fanout, name);
        }

        loop {
            tokio::select! {
                event = watch.events.recv() => match event {
                    Some(ChildEvent::Added(name)) => emit_member(&cache, &class, &fanout, name),
                    // Object streams complete themselves on deletion.
                    Some(ChildEvent::Removed(_)) => {}
                    None => {
                        cache.ctx.metrics.record_observable_recovery();
                        debug!(class = %class, "class watch interrupted; re-arming");
                        break;
                    }
                },
                _ = fanout.gone.notified() => {
                    if fanout.prune() {
                        cache.evict_class(&class, refnum);
                        return;
                    }
                }
            }
        }
    }
}

fn emit_member<B: Backend>(
    cache: &Arc<ObservableCache<B>>,
    class: &str,
    fanout: &Arc<ClassFanout>,
    name: String,
) {
    let id = ObjId::new(name);
    let mut inner = fanout.inner.lock();
    if !inner.known.insert(id.clone()) {
        return;
    }
    inner.subs.retain(|tx| {
        let raw = cache.subscribe_raw(ObjKey::new(class.to_string(), id.clone()));
        tx.send(raw).is_ok()
    });
}

/// Typed per-object change stream.
///
/// Yields the current value on subscribe and on every committed change,
/// ends after the object is deleted, and yields a terminal `NotFound` error
/// if the object does not exist.
pub struct ObjectSubscription<T> {
    serializer: Arc<dyn crate::serializer::Serializer>,
    raw: RawSubscription,
    done: bool,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> ObjectSubscription<T> {
    pub fn id(&self) -> &ObjId {
        &self.raw.key.id
    }

    pub fn class(&self) -> &str {
        &self.raw.key.class
    }
}

impl<T: ObjectClass> Stream for ObjectSubscription<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.raw.rx.poll_recv(cx) {
            Poll::Ready(Some(ObjectEvent::Data(bytes))) => {
                let decoded = this
                    .serializer
                    .decode_document(&bytes)
                    .and_then(from_document::<T>);
                if decoded.is_err() {
                    this.done = true;
                }
                Poll::Ready(Some(decoded))
            }
            Poll::Ready(Some(ObjectEvent::NotFound)) => {
                this.done = true;
                Poll::Ready(Some(Err(StoreError::not_found(
                    this.raw.key.class.clone(),
                    &this.raw.key.id,
                ))))
            }
            Poll::Ready(Some(ObjectEvent::Complete)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Typed per-class stream of object streams.
pub struct ClassSubscription<T> {
    serializer: Arc<dyn crate::serializer::Serializer>,
    rx: mpsc::UnboundedReceiver<RawSubscription>,
    _guard: SubscriptionGuard,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: ObjectClass> Stream for ClassSubscription<T> {
    type Item = ObjectSubscription<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(raw)) => Poll::Ready(Some(ObjectSubscription {
                serializer: this.serializer.clone(),
                raw,
                done: false,
                _marker: std::marker::PhantomData,
            })),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
