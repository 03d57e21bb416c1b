//! Transactional object-graph store.
//!
//! Persists typed objects in a hierarchical coordination service, enforces
//! referential integrity through declared cross-object field bindings,
//! exposes atomic multi-operation transactions with optimistic concurrency
//! control, and delivers live change streams to subscribers.
//!
//! Entry point is [`StoreBuilder`]: register classes, declare bindings,
//! `build()`, then read, write, and observe through [`ObjectStore`].

pub mod class;
mod lock;
pub mod metered;
pub mod observable;
pub mod registry;
pub mod serializer;
pub mod store;
pub mod transaction;

pub use class::{ObjectClass, ObjKey};
pub use observable::{ClassSubscription, ObjectSubscription};
pub use registry::{BindingEnd, DeleteAction, FieldKind, Registry};
pub use serializer::{MessagePackSerializer, Serializer};
pub use store::{ObjectStore, PersistOp, StoreBuilder};
pub use transaction::Transaction;
