//! Class descriptors and document field access.
//!
//! Objects cross the public API as typed Rust values and live inside the
//! store as `serde_json::Value` documents. The functions here are the
//! store's only way of touching object fields; there is no reflection.
//! Reference fields hold either a single id string (or null) or an array of
//! id strings.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use topograph_core::{ObjId, Result, StoreError};

use crate::registry::FieldKind;

/// A persistable class.
///
/// `NAME` is the simple class name used in backend paths and must be unique
/// within a store. `ID_FIELD` names the identifier attribute; the referenced
/// field must serialize to a string.
pub trait ObjectClass:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const NAME: &'static str;
    const ID_FIELD: &'static str = "id";
}

/// Store-internal object coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjKey {
    pub class: String,
    pub id: ObjId,
}

impl ObjKey {
    pub fn new(class: impl Into<String>, id: ObjId) -> Self {
        ObjKey {
            class: class.into(),
            id,
        }
    }
}

impl std::fmt::Display for ObjKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class, self.id)
    }
}

/// Serialize a typed object into its document form.
pub fn to_document<T: Serialize>(obj: &T) -> Result<Value> {
    let doc = serde_json::to_value(obj)?;
    if !doc.is_object() {
        return Err(StoreError::internal(
            "persistable objects must serialize to a map",
        ));
    }
    Ok(doc)
}

/// Deserialize a document back into its typed form.
pub fn from_document<T: DeserializeOwned>(doc: Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

/// Extract the object id from a document.
pub fn id_of(doc: &Value, class: &str, id_field: &str) -> Result<ObjId> {
    match doc.get(id_field) {
        Some(Value::String(s)) if !s.is_empty() && !s.contains('/') => Ok(ObjId::new(s.clone())),
        Some(Value::Number(n)) => Ok(ObjId::new(n.to_string())),
        _ => Err(StoreError::internal(format!(
            "class {class} has no usable id in field {id_field}"
        ))),
    }
}

/// Ids referenced by a bound field. Missing and null fields read as empty.
pub fn ref_targets(doc: &Value, field: &str, kind: FieldKind) -> Vec<ObjId> {
    match (kind, doc.get(field)) {
        (FieldKind::Single, Some(Value::String(s))) => vec![ObjId::new(s.clone())],
        (FieldKind::List, Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(ObjId::new))
            .collect(),
        _ => Vec::new(),
    }
}

/// Overwrite a single-reference field.
pub fn write_single(doc: &mut Value, field: &str, id: Option<&ObjId>) {
    if let Some(map) = doc.as_object_mut() {
        let value = match id {
            Some(id) => Value::String(id.as_str().to_string()),
            None => Value::Null,
        };
        map.insert(field.to_string(), value);
    }
}

/// Append an id to a reference list if not already present.
pub fn list_add(doc: &mut Value, field: &str, id: &ObjId) {
    if let Some(map) = doc.as_object_mut() {
        let entry = map
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            if !items.iter().any(|v| v.as_str() == Some(id.as_str())) {
                items.push(Value::String(id.as_str().to_string()));
            }
        }
    }
}

/// Remove an id from a reference list.
pub fn list_remove(doc: &mut Value, field: &str, id: &ObjId) {
    if let Some(Value::Array(items)) = doc.get_mut(field) {
        items.retain(|v| v.as_str() != Some(id.as_str()));
    }
}
