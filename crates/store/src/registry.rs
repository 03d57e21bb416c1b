//! Class registry and binding catalog.
//!
//! Registration happens on the builder before `build()`; the resulting
//! [`Registry`] is immutable for the life of the store. Each binding is
//! declared once, symmetrically, and indexed from both ends so that the
//! transaction planner can reach the peer side in O(1).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use topograph_core::{Result, StoreError};

use crate::class::ObjectClass;

/// Behavior when deleting an object whose bound field is non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// Delete the referenced peers too.
    Cascade,
    /// Null out / remove this object's id from the peers.
    Clear,
    /// Reject the delete.
    Error,
}

/// Cardinality of a bound reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Holds one peer id or null.
    Single,
    /// Holds a list of peer ids.
    List,
}

/// One end of a symmetric binding declaration.
#[derive(Debug, Clone)]
pub struct BindingEnd {
    pub field: String,
    pub kind: FieldKind,
    pub on_delete: DeleteAction,
}

impl BindingEnd {
    pub fn single(field: impl Into<String>, on_delete: DeleteAction) -> Self {
        BindingEnd {
            field: field.into(),
            kind: FieldKind::Single,
            on_delete,
        }
    }

    pub fn list(field: impl Into<String>, on_delete: DeleteAction) -> Self {
        BindingEnd {
            field: field.into(),
            kind: FieldKind::List,
            on_delete,
        }
    }
}

/// One directed view of a binding, memoized with everything the planner
/// needs about the opposite end.
#[derive(Debug)]
pub struct FieldBinding {
    pub class: String,
    pub field: String,
    pub kind: FieldKind,
    pub on_delete: DeleteAction,
    pub peer_class: String,
    pub peer_field: String,
    pub peer_kind: FieldKind,
}

/// A registered class: simple name, id attribute, and its bound fields.
#[derive(Debug)]
pub struct ClassInfo {
    pub name: String,
    pub id_field: String,
    bindings: BTreeMap<String, Arc<FieldBinding>>,
}

impl ClassInfo {
    pub fn binding(&self, field: &str) -> Option<&Arc<FieldBinding>> {
        self.bindings.get(field)
    }

    /// Bound fields in declaration-stable (lexicographic) order.
    pub fn bindings(&self) -> impl Iterator<Item = &Arc<FieldBinding>> {
        self.bindings.values()
    }
}

/// Immutable registry produced at `build()`.
#[derive(Debug, Default)]
pub struct Registry {
    classes: HashMap<String, ClassInfo>,
}

impl Registry {
    pub fn class(&self, name: &str) -> Result<&ClassInfo> {
        self.classes
            .get(name)
            .ok_or_else(|| StoreError::internal(format!("class {name} is not registered")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Mutable registration state held by the store builder.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    classes: HashMap<String, ClassInfo>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class by its descriptor constants.
    ///
    /// Rejects duplicate simple names and blank id fields.
    pub fn register_class<T: ObjectClass>(&mut self) -> Result<()> {
        if T::NAME.is_empty() || T::NAME.contains('/') {
            return Err(StoreError::internal(format!(
                "class name {:?} is not a legal path segment",
                T::NAME
            )));
        }
        if T::ID_FIELD.is_empty() {
            return Err(StoreError::internal(format!(
                "class {} declares an empty id field",
                T::NAME
            )));
        }
        if self.classes.contains_key(T::NAME) {
            return Err(StoreError::internal(format!(
                "class name {} registered twice",
                T::NAME
            )));
        }
        self.classes.insert(
            T::NAME.to_string(),
            ClassInfo {
                name: T::NAME.to_string(),
                id_field: T::ID_FIELD.to_string(),
                bindings: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Declare a symmetric binding between `A::field_a` and `B::field_b`.
    ///
    /// Both classes must already be registered and neither field may carry a
    /// prior binding. A class may bind to itself, including on a single
    /// shared field (`A.peer_id ↔ A.peer_id`).
    pub fn bind<A: ObjectClass, B: ObjectClass>(
        &mut self,
        end_a: BindingEnd,
        end_b: BindingEnd,
    ) -> Result<()> {
        for (class, end) in [(A::NAME, &end_a), (B::NAME, &end_b)] {
            let info = self.classes.get(class).ok_or_else(|| {
                StoreError::internal(format!("binding references unregistered class {class}"))
            })?;
            if end.field == info.id_field {
                return Err(StoreError::internal(format!(
                    "class {class} cannot bind its id field {}",
                    end.field
                )));
            }
        }
        let reflexive = A::NAME == B::NAME && end_a.field == end_b.field;
        if reflexive && end_a.kind != end_b.kind {
            return Err(StoreError::internal(format!(
                "reflexive binding on {}.{} declares conflicting cardinalities",
                A::NAME,
                end_a.field
            )));
        }

        self.add_side(
            A::NAME,
            &end_a,
            B::NAME,
            &end_b,
        )?;
        if !reflexive {
            self.add_side(B::NAME, &end_b, A::NAME, &end_a)?;
        }
        Ok(())
    }

    fn add_side(
        &mut self,
        class: &str,
        end: &BindingEnd,
        peer_class: &str,
        peer_end: &BindingEnd,
    ) -> Result<()> {
        let info = self
            .classes
            .get_mut(class)
            .ok_or_else(|| StoreError::internal(format!("class {class} is not registered")))?;
        if info.bindings.contains_key(&end.field) {
            return Err(StoreError::internal(format!(
                "field {class}.{} already carries a binding",
                end.field
            )));
        }
        info.bindings.insert(
            end.field.clone(),
            Arc::new(FieldBinding {
                class: class.to_string(),
                field: end.field.clone(),
                kind: end.kind,
                on_delete: end.on_delete,
                peer_class: peer_class.to_string(),
                peer_field: peer_end.field.clone(),
                peer_kind: peer_end.kind,
            }),
        );
        Ok(())
    }

    /// Freeze registration.
    pub fn build(self) -> Registry {
        Registry {
            classes: self.classes,
        }
    }
}
