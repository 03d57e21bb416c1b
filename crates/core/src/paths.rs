//! Backend path layout.
//!
//! Every path the store touches is built here. Relative to a configurable
//! root the layout is:
//!
//! ```text
//! <root>/zoom/<v>/models/<Class>/<id>       object payload
//! <root>/zoom/<v>/objects/<Class>/<id>      provenance sibling
//! <root>/zoom/<v>/locks/zoom-topology       topology lock node
//! <root>/zoom/<v>/zoomlocks/lock            transaction marker prefix
//! <root>/zoom/<v>/state/<ns>/<Class>/<id>/<key>/<value>
//! ```

use crate::types::ObjId;

/// Fixed layout version segment.
pub const LAYOUT_VERSION: u32 = 1;

/// Name of the topology lock node under the locks directory.
pub const TOPOLOGY_LOCK_NAME: &str = "zoom-topology";

/// Owns construction of every backend path.
#[derive(Debug, Clone)]
pub struct PathLayout {
    base: String,
}

impl PathLayout {
    /// Build a layout rooted at `root_key` (e.g. `/topograph`).
    ///
    /// The root is normalized to a single leading slash and no trailing
    /// slash.
    pub fn new(root_key: &str) -> Self {
        let trimmed = root_key.trim_matches('/');
        let base = if trimmed.is_empty() {
            format!("/zoom/{}", LAYOUT_VERSION)
        } else {
            format!("/{}/zoom/{}", trimmed, LAYOUT_VERSION)
        };
        PathLayout { base }
    }

    /// `<root>/zoom/<v>`
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn models_dir(&self) -> String {
        format!("{}/models", self.base)
    }

    pub fn class_models_dir(&self, class: &str) -> String {
        format!("{}/models/{}", self.base, class)
    }

    pub fn object_path(&self, class: &str, id: &ObjId) -> String {
        format!("{}/models/{}/{}", self.base, class, id)
    }

    pub fn objects_dir(&self) -> String {
        format!("{}/objects", self.base)
    }

    pub fn class_objects_dir(&self, class: &str) -> String {
        format!("{}/objects/{}", self.base, class)
    }

    pub fn provenance_path(&self, class: &str, id: &ObjId) -> String {
        format!("{}/objects/{}/{}", self.base, class, id)
    }

    pub fn locks_dir(&self) -> String {
        format!("{}/locks", self.base)
    }

    pub fn topology_lock_path(&self) -> String {
        format!("{}/locks/{}", self.base, TOPOLOGY_LOCK_NAME)
    }

    pub fn tx_locks_dir(&self) -> String {
        format!("{}/zoomlocks", self.base)
    }

    /// Prefix for ephemeral sequential transaction markers; the backend
    /// appends the sequence suffix.
    pub fn tx_marker_prefix(&self) -> String {
        format!("{}/zoomlocks/lock", self.base)
    }

    pub fn state_dir(&self) -> String {
        format!("{}/state", self.base)
    }

    pub fn state_namespace_dir(&self, namespace: &str) -> String {
        format!("{}/state/{}", self.base, namespace)
    }

    pub fn state_class_dir(&self, namespace: &str, class: &str) -> String {
        format!("{}/state/{}/{}", self.base, namespace, class)
    }

    pub fn state_object_dir(&self, namespace: &str, class: &str, id: &ObjId) -> String {
        format!("{}/state/{}/{}/{}", self.base, namespace, class, id)
    }

    pub fn state_key_dir(&self, namespace: &str, class: &str, id: &ObjId, key: &str) -> String {
        format!("{}/state/{}/{}/{}/{}", self.base, namespace, class, id, key)
    }

    pub fn state_value_path(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> String {
        format!(
            "{}/state/{}/{}/{}/{}/{}",
            self.base, namespace, class, id, key, value
        )
    }

    /// Directories that must exist before the store serves traffic.
    /// Per-class directories are appended by the builder.
    pub fn base_dirs(&self) -> Vec<String> {
        vec![
            self.base.clone(),
            self.models_dir(),
            self.objects_dir(),
            self.locks_dir(),
            self.tx_locks_dir(),
            self.state_dir(),
        ]
    }

    /// All ancestors of `path` beneath the root, shortest first, the path
    /// itself included. Used for idempotent directory creation.
    pub fn ancestry(path: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut acc = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            acc.push('/');
            acc.push_str(seg);
            out.push(acc.clone());
        }
        out
    }
}
