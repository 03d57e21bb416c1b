//! Read-through cached state store.
//!
//! Wraps a [`StateStore`] with a snapshot map. Reads populate the snapshot,
//! writes keep it current, and the cached observable emits the snapshot
//! value before deferring to the live stream, so a subscriber never sees a
//! gap between "subscribed" and "first backend emission".

use dashmap::DashMap;
use tokio::sync::mpsc;

use futures_util::StreamExt;
use topograph_backend::Backend;
use topograph_core::{ObjId, Result};

use crate::{KeyObservable, StateStore, StateValues};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateCoord {
    namespace: String,
    class: String,
    id: ObjId,
    key: String,
}

impl StateCoord {
    fn new(namespace: &str, class: &str, id: &ObjId, key: &str) -> Self {
        StateCoord {
            namespace: namespace.to_string(),
            class: class.to_string(),
            id: id.clone(),
            key: key.to_string(),
        }
    }
}

/// [`StateStore`] with a read-through snapshot.
pub struct CachedStateStore<B: Backend> {
    inner: StateStore<B>,
    snapshot: DashMap<StateCoord, StateValues>,
}

impl<B: Backend> CachedStateStore<B> {
    pub fn new(inner: StateStore<B>) -> Self {
        CachedStateStore {
            inner,
            snapshot: DashMap::new(),
        }
    }

    pub async fn add_value(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.inner
            .add_value(namespace, class, id, key, value)
            .await?;
        self.snapshot
            .entry(StateCoord::new(namespace, class, id, key))
            .or_default()
            .insert(value.to_string());
        Ok(())
    }

    pub async fn remove_value(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.inner
            .remove_value(namespace, class, id, key, value)
            .await?;
        if let Some(mut entry) = self
            .snapshot
            .get_mut(&StateCoord::new(namespace, class, id, key))
        {
            entry.remove(value);
        }
        Ok(())
    }

    /// Read through the snapshot: a cached set is served directly, a miss
    /// fetches from the backend and populates the snapshot.
    pub async fn get_key(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> Result<StateValues> {
        let coord = StateCoord::new(namespace, class, id, key);
        if let Some(cached) = self.snapshot.get(&coord) {
            return Ok(cached.clone());
        }
        let values = self.inner.get_key(namespace, class, id, key).await?;
        self.snapshot.insert(coord, values.clone());
        Ok(values)
    }

    /// Like [`StateStore::key_observable`], but the cached set (when one
    /// exists) is emitted first, ahead of the live stream's own snapshot.
    pub fn key_observable(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> KeyObservable {
        let cached = self
            .snapshot
            .get(&StateCoord::new(namespace, class, id, key))
            .map(|v| v.clone());
        let mut live = self.inner.key_observable(namespace, class, id, key);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Some(values) = cached {
                if tx.send(Ok(values)).is_err() {
                    return;
                }
            }
            while let Some(item) = live.next().await {
                if tx.send(item).is_err() {
                    return;
                }
            }
        });
        KeyObservable::new(rx)
    }
}
