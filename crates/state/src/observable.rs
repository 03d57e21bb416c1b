//! State-key observables.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

use topograph_backend::{Backend, ChildEvent, ErrorKind};
use topograph_core::{ObjId, Result};

use crate::{StateInner, StateStore, StateValues};

/// Stream of value-set snapshots for one state key.
///
/// Emits the current set on subscribe and after every change; completes when
/// the namespace, class, or object the key hangs off does not exist (or goes
/// away while the watch is being re-established).
pub struct KeyObservable {
    rx: mpsc::UnboundedReceiver<Result<StateValues>>,
}

impl KeyObservable {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<StateValues>>) -> Self {
        KeyObservable { rx }
    }
}

impl Stream for KeyObservable {
    type Item = Result<StateValues>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

pub(crate) fn spawn_key_observable<B: Backend>(
    inner: Arc<StateInner<B>>,
    namespace: String,
    class: String,
    id: ObjId,
    key: String,
) -> KeyObservable {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(drive_key(inner, namespace, class, id, key, tx));
    KeyObservable::new(rx)
}

/// Emit to the subscriber, deduplicating consecutive identical sets (a
/// re-established watch re-reads the same state).
fn emit(
    tx: &mpsc::UnboundedSender<Result<StateValues>>,
    last: &mut Option<StateValues>,
    set: StateValues,
) -> bool {
    if last.as_ref() == Some(&set) {
        return true;
    }
    let ok = tx.send(Ok(set.clone())).is_ok();
    *last = Some(set);
    ok
}

async fn drive_key<B: Backend>(
    inner: Arc<StateInner<B>>,
    namespace: String,
    class: String,
    id: ObjId,
    key: String,
    tx: mpsc::UnboundedSender<Result<StateValues>>,
) {
    let key_dir = inner.layout.state_key_dir(&namespace, &class, &id, &key);
    let object_dir = inner.layout.state_object_dir(&namespace, &class, &id);
    let mut last: Option<StateValues> = None;

    loop {
        if tx.is_closed() {
            return;
        }
        match inner.backend.watch_children(&key_dir).await {
            Ok(mut watch) => {
                let mut set: BTreeSet<String> = watch.initial.drain(..).collect();
                if !emit(&tx, &mut last, set.clone()) {
                    return;
                }
                loop {
                    match watch.events.recv().await {
                        Some(ChildEvent::Added(value)) => {
                            set.insert(value);
                            if !emit(&tx, &mut last, set.clone()) {
                                return;
                            }
                        }
                        Some(ChildEvent::Removed(value)) => {
                            set.remove(&value);
                            if !emit(&tx, &mut last, set.clone()) {
                                return;
                            }
                        }
                        // Interrupted; re-establish.
                        None => break,
                    }
                }
            }
            Err(e) if e.kind == ErrorKind::NoNode => {
                // Key directory absent. If the object coordinate itself is
                // gone the stream completes; a missing key alone reads as an
                // empty set until the key shows up.
                match inner.backend.exists(&object_dir).await {
                    Ok(Some(_)) => {
                        if !emit(&tx, &mut last, StateValues::new()) {
                            return;
                        }
                        if !wait_for_key(&inner, &object_dir, &key).await {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "state observable existence probe failed");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "state key watch could not arm");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

/// Park on the object directory until the key appears. Returns false when
/// the stream should complete (object gone).
async fn wait_for_key<B: Backend>(inner: &StateInner<B>, object_dir: &str, key: &str) -> bool {
    loop {
        match inner.backend.watch_children(object_dir).await {
            Ok(mut watch) => {
                if watch.initial.iter().any(|c| c == key) {
                    return true;
                }
                loop {
                    match watch.events.recv().await {
                        Some(ChildEvent::Added(name)) if name == key => return true,
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            Err(e) if e.kind == ErrorKind::NoNode => return false,
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

pub(crate) fn spawn_switching_observable<B, S>(
    store: StateStore<B>,
    namespaces: S,
    class: String,
    id: ObjId,
    key: String,
) -> KeyObservable
where
    B: Backend,
    S: Stream<Item = Option<String>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut namespaces = Box::pin(namespaces);
        let mut current: Option<KeyObservable> = None;
        loop {
            tokio::select! {
                switch = namespaces.next() => match switch {
                    Some(Some(namespace)) => {
                        current = Some(store.key_observable(&namespace, &class, &id, &key));
                    }
                    // Sentinel: unsubscribe without resubscribing.
                    Some(None) => current = None,
                    // Namespace input exhausted: drain the active stream,
                    // then complete.
                    None => {
                        if let Some(mut stream) = current.take() {
                            while let Some(value) = stream.next().await {
                                if tx.send(value).is_err() {
                                    return;
                                }
                            }
                        }
                        return;
                    }
                },
                item = next_or_pending(&mut current) => match item {
                    Some(value) => {
                        if tx.send(value).is_err() {
                            return;
                        }
                    }
                    // The active stream completed (its object vanished);
                    // stay parked until the next namespace switch.
                    None => current = None,
                },
            }
        }
    });
    KeyObservable::new(rx)
}

async fn next_or_pending(current: &mut Option<KeyObservable>) -> Option<Result<StateValues>> {
    match current {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
