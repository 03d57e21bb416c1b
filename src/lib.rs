//! # Topograph
//!
//! A transactional object-graph store layered on a hierarchical coordination
//! service. Typed objects persist as versioned nodes, declared bindings keep
//! cross-object references symmetric, multi-operation transactions commit
//! atomically under optimistic concurrency control, and every object and
//! class can be observed as a live change stream.
//!
//! # Quick Start
//!
//! ```no_run
//! use topograph::{
//!     BindingEnd, DeleteAction, MemoryBackend, ObjectClass, ObjectStore, ObjId, Owner,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Bridge {
//!     id: String,
//!     port_ids: Vec<String>,
//! }
//! impl ObjectClass for Bridge {
//!     const NAME: &'static str = "Bridge";
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Port {
//!     id: String,
//!     bridge_id: Option<String>,
//! }
//! impl ObjectClass for Port {
//!     const NAME: &'static str = "Port";
//! }
//!
//! #[tokio::main]
//! async fn main() -> topograph::Result<()> {
//!     let store = ObjectStore::builder(MemoryBackend::new())
//!         .register_class::<Bridge>()?
//!         .register_class::<Port>()?
//!         .bind::<Bridge, Port>(
//!             BindingEnd::list("port_ids", DeleteAction::Clear),
//!             BindingEnd::single("bridge_id", DeleteAction::Clear),
//!         )?
//!         .build()
//!         .await?;
//!
//!     let mut tx = store.transaction(Owner::named("setup")).await?;
//!     tx.create(&Bridge { id: "b1".into(), port_ids: vec![] }).await?;
//!     tx.create(&Port { id: "p1".into(), bridge_id: Some("b1".into()) }).await?;
//!     tx.commit().await?;
//!
//!     // The inverse reference was written for us.
//!     let bridge: Bridge = store.get(&ObjId::new("b1")).await?;
//!     assert_eq!(bridge.port_ids, vec!["p1".to_string()]);
//!     Ok(())
//! }
//! ```
//!
//! # Crate Layout
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `topograph-core` | ids, errors, configuration, path layout, metrics |
//! | `topograph-backend` | coordination-service trait + in-memory backend |
//! | `topograph-store` | registry, bindings, transactions, facade, observables, topology lock |
//! | `topograph-state` | per-namespace state keys with live value-set streams |

pub use topograph_backend::{Backend, CreateMode, MemoryBackend};
pub use topograph_core::{
    ChangeKind, ObjId, Owner, PathLayout, ProvenanceRecord, Result, StoreConfig, StoreError,
};
pub use topograph_state::{CachedStateStore, KeyObservable, StateStore, StateValues};
pub use topograph_store::{
    BindingEnd, ClassSubscription, DeleteAction, FieldKind, MessagePackSerializer, ObjectClass,
    ObjectStore, ObjectSubscription, PersistOp, Serializer, StoreBuilder, Transaction,
};
