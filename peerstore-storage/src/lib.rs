//! Peerstore Storage
//!
//! Provides the local persistence layer:
//! - `PathKey` and pluggable path transforms (`cas_path_transform`, `identity_path_transform`)
//! - `Store`, a namespaced on-disk object store addressed through a path transform
//!
//! Objects live at `<root>/<namespace>/<segment>/.../<filename>`.

pub mod path;
pub mod store;

pub use path::{
    cas_path_transform, identity_path_transform, PathKey, PathTransform, PathTransformKind,
};
pub use store::Store;

use peerstore_core::DEFAULT_ROOT_FOLDER;
use std::path::PathBuf;
use std::sync::Arc;

/// Storage configuration
#[derive(Clone)]
pub struct StoreConfig {
    /// Root directory containing every namespace
    pub root: PathBuf,

    /// Namespace of the owning node. `None` generates a random identifier.
    pub id: Option<String>,

    /// Maps a logical key to its on-disk location
    pub path_transform: PathTransform,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT_FOLDER),
            id: None,
            path_transform: Arc::new(identity_path_transform),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("root", &self.root)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    /// Create a new storage config rooted at the given path
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Pin the namespace (single-tenant deployments use a constant here)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the path transform
    pub fn with_path_transform(mut self, transform: PathTransform) -> Self {
        self.path_transform = transform;
        self
    }

    /// Use the content-addressable transform
    pub fn with_cas(self) -> Self {
        self.with_path_transform(Arc::new(cas_path_transform))
    }
}
