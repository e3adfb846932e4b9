//! Snapshotters.
//!
//! A snapshotter owns unpacked layers (committed snapshots, keyed by chain
//! ID) and the views prepared on top of them (active snapshots, keyed by a
//! caller-chosen string). Image volumes only ever prepare read-only views.

mod local;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use imgvol_common::{Digest, ImgvolResult};

use crate::filesystem::Mount;

pub use local::LocalSnapshotter;

/// Snapshot storage backend.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Name the snapshotter is registered under.
    fn name(&self) -> &str;

    /// Prepare a read-only view of the committed snapshot `parent` under `key`.
    ///
    /// Fails with [`AlreadyExists`](imgvol_common::ImgvolError::AlreadyExists)
    /// if `key` is already active; the existing view is left untouched and
    /// can be read with [`Snapshotter::mounts`].
    async fn prepare(&self, key: &str, parent: &Digest) -> ImgvolResult<Vec<Mount>>;

    /// Mounts of the active snapshot `key`.
    async fn mounts(&self, key: &str) -> ImgvolResult<Vec<Mount>>;

    /// Remove the active snapshot `key`.
    ///
    /// Fails with [`NotFound`](imgvol_common::ImgvolError::NotFound) if `key`
    /// is not active.
    async fn remove(&self, key: &str) -> ImgvolResult<()>;

    /// Unpack a layer blob and commit it as `chain_id` on top of `parent`.
    ///
    /// Does nothing if `chain_id` is already committed.
    async fn apply_layer(
        &self,
        chain_id: &Digest,
        parent: Option<&Digest>,
        blob: &Path,
        diff_id: &Digest,
    ) -> ImgvolResult<()>;

    /// Keys of all active snapshots.
    async fn list_active(&self) -> ImgvolResult<Vec<String>>;
}

/// Snapshotters available to the manager, by name.
#[derive(Clone, Default)]
pub struct SnapshotterRegistry {
    snapshotters: HashMap<String, Arc<dyn Snapshotter>>,
}

impl SnapshotterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshotter under its own name.
    pub fn register(&mut self, snapshotter: Arc<dyn Snapshotter>) {
        self.snapshotters
            .insert(snapshotter.name().to_string(), snapshotter);
    }

    /// Look up a snapshotter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Snapshotter>> {
        self.snapshotters.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshotters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SnapshotterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotterRegistry")
            .field("snapshotters", &self.names())
            .finish()
    }
}
