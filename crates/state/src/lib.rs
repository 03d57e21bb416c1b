//! Per-namespace state keys.
//!
//! State lives beside the object store, not inside it: each
//! `(namespace, class, id, key)` coordinate holds a set of string values as
//! ephemeral backend nodes, so a value disappears with the session that
//! wrote it. Reads are point-in-time; [`StateStore::key_observable`] streams
//! the current value set and every subsequent change.
//!
//! A missing namespace, class, or object completes the observable
//! immediately; a missing key is an empty value set, not an error.

pub mod cached;
mod observable;

use std::collections::BTreeSet;
use std::sync::Arc;

use topograph_backend::{Backend, CreateMode, ErrorKind};
use topograph_core::{ObjId, PathLayout, Result, StoreConfig, StoreError};

pub use cached::CachedStateStore;
pub use observable::KeyObservable;

/// The value set held by one state key.
pub type StateValues = BTreeSet<String>;

pub(crate) struct StateInner<B> {
    pub(crate) backend: B,
    pub(crate) layout: PathLayout,
}

/// State-key store over a coordination backend.
pub struct StateStore<B: Backend> {
    inner: Arc<StateInner<B>>,
    /// Default namespace for the convenience accessors; host-derived via
    /// configuration.
    namespace: String,
}

impl<B: Backend> Clone for StateStore<B> {
    fn clone(&self) -> Self {
        StateStore {
            inner: self.inner.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

fn check_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        return Err(StoreError::internal(format!(
            "{what} {value:?} is not a legal path segment"
        )));
    }
    Ok(())
}

impl<B: Backend> StateStore<B> {
    pub fn new(backend: B, config: &StoreConfig) -> Self {
        StateStore {
            inner: Arc::new(StateInner {
                backend,
                layout: PathLayout::new(&config.root_key),
            }),
            namespace: config.namespace.clone(),
        }
    }

    /// The namespace used by the convenience wrappers.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Add `value` to the key's value set in `namespace`.
    ///
    /// The key path is created on demand; the value node itself is
    /// ephemeral. Adding a value that is already present is a no-op.
    pub async fn add_value(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        for (what, v) in [
            ("namespace", namespace),
            ("class", class),
            ("key", key),
            ("value", value),
        ] {
            check_segment(what, v)?;
        }
        let key_dir = self.inner.layout.state_key_dir(namespace, class, id, key);
        for dir in PathLayout::ancestry(&key_dir) {
            match self
                .inner
                .backend
                .create(&dir, Vec::new(), CreateMode::Persistent)
                .await
            {
                Ok(_) => {}
                Err(e) if e.kind == ErrorKind::NodeExists => {}
                Err(e) => {
                    return Err(StoreError::storage_failure_with_source(
                        format!("could not create state path {dir}"),
                        e,
                    ))
                }
            }
        }
        let value_path = self
            .inner
            .layout
            .state_value_path(namespace, class, id, key, value);
        match self
            .inner
            .backend
            .create(&value_path, Vec::new(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind == ErrorKind::NodeExists => Ok(()),
            Err(e) => Err(StoreError::storage_failure_with_source(
                "state value write failed",
                e,
            )),
        }
    }

    /// Remove `value` from the key's value set. Removing an absent value is
    /// a no-op.
    pub async fn remove_value(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let value_path = self
            .inner
            .layout
            .state_value_path(namespace, class, id, key, value);
        match self.inner.backend.delete(&value_path, None).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind == ErrorKind::NoNode => Ok(()),
            Err(e) => Err(StoreError::storage_failure_with_source(
                "state value removal failed",
                e,
            )),
        }
    }

    /// Read the key's current value set. Missing coordinates read as empty.
    pub async fn get_key(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> Result<StateValues> {
        let key_dir = self.inner.layout.state_key_dir(namespace, class, id, key);
        match self.inner.backend.children(&key_dir).await {
            Ok(values) => Ok(values.into_iter().collect()),
            Err(e) if e.kind == ErrorKind::NoNode => Ok(StateValues::new()),
            Err(e) => Err(StoreError::storage_failure_with_source(
                "state key read failed",
                e,
            )),
        }
    }

    /// Stream the key's value set: the current set on subscribe, then one
    /// emission per change. Completes immediately when namespace, class, or
    /// object are missing.
    pub fn key_observable(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> KeyObservable {
        observable::spawn_key_observable(
            self.inner.clone(),
            namespace.to_string(),
            class.to_string(),
            id.clone(),
            key.to_string(),
        )
    }

    /// Follow the key across namespaces: the output switches to whichever
    /// namespace the input stream last emitted. A `None` sentinel
    /// unsubscribes from the previous namespace without subscribing to a
    /// new one.
    pub fn switching_key_observable<S>(
        &self,
        namespaces: S,
        class: &str,
        id: &ObjId,
        key: &str,
    ) -> KeyObservable
    where
        S: futures_util::Stream<Item = Option<String>> + Send + 'static,
    {
        observable::spawn_switching_observable(
            self.clone(),
            namespaces,
            class.to_string(),
            id.clone(),
            key.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topograph_backend::MemoryBackend;

    fn config() -> StoreConfig {
        StoreConfig::default().root_key("/t").namespace("host-1")
    }

    fn store() -> StateStore<MemoryBackend> {
        StateStore::new(MemoryBackend::new(), &config())
    }

    #[tokio::test]
    async fn add_and_read_values() {
        let store = store();
        let id = ObjId::new("p1");
        store
            .add_value("host-1", "Port", &id, "active", "yes")
            .await
            .unwrap();
        store
            .add_value("host-1", "Port", &id, "routes", "10.0.0.0/16__via1")
            .await
            .unwrap();
        store
            .add_value("host-1", "Port", &id, "routes", "10.1.0.0/16__via2")
            .await
            .unwrap();

        let values = store.get_key("host-1", "Port", &id, "routes").await.unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains("10.0.0.0/16__via1"));

        // Re-adding is a no-op.
        store
            .add_value("host-1", "Port", &id, "active", "yes")
            .await
            .unwrap();
        let values = store.get_key("host-1", "Port", &id, "active").await.unwrap();
        assert_eq!(values.len(), 1);
    }

    #[tokio::test]
    async fn remove_value_and_missing_key() {
        let store = store();
        let id = ObjId::new("p1");
        store
            .add_value("host-1", "Port", &id, "active", "yes")
            .await
            .unwrap();
        store
            .remove_value("host-1", "Port", &id, "active", "yes")
            .await
            .unwrap();
        // Removing again is a no-op.
        store
            .remove_value("host-1", "Port", &id, "active", "yes")
            .await
            .unwrap();

        assert!(store
            .get_key("host-1", "Port", &id, "active")
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_key("nowhere", "Port", &id, "active")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn values_are_ephemeral() {
        let backend = MemoryBackend::new();
        let store = StateStore::new(backend.clone(), &config());
        let id = ObjId::new("p1");
        store
            .add_value("host-1", "Port", &id, "active", "yes")
            .await
            .unwrap();

        backend.expire_ephemerals();
        assert!(store
            .get_key("host-1", "Port", &id, "active")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn illegal_segments_rejected() {
        let store = store();
        let id = ObjId::new("p1");
        assert!(store
            .add_value("host-1", "Port", &id, "a/b", "v")
            .await
            .is_err());
        assert!(store.add_value("", "Port", &id, "k", "v").await.is_err());
    }
}
