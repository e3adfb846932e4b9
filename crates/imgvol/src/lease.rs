//! Garbage collection leases.
//!
//! A lease pins content against garbage collection for as long as it
//! exists. Image volumes take one lease per target, named after the target
//! path, that references the target's view snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgvol_common::{ImgvolError, ImgvolResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Label naming the snapshotter a lease's resources live in.
pub const SNAPSHOTTER_LABEL: &str = "imgvol.io/snapshotter";

/// Label prefix for a GC reference to a snapshot; the snapshotter name is appended.
pub const GC_REF_SNAPSHOT_LABEL: &str = "imgvol.io/gc.ref.snapshot.";

/// A lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease identifier.
    pub id: String,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Labels for an image volume lease on `target` in `snapshotter`.
#[must_use]
pub fn image_volume_labels(snapshotter: &str, target: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SNAPSHOTTER_LABEL.to_string(), snapshotter.to_string()),
        (
            format!("{GC_REF_SNAPSHOT_LABEL}{snapshotter}"),
            target.to_string(),
        ),
    ])
}

/// Lease management.
#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Create a lease with no expiry.
    ///
    /// Fails with [`ImgvolError::AlreadyExists`] if `id` is taken.
    async fn create(&self, id: &str, labels: BTreeMap<String, String>) -> ImgvolResult<Lease>;

    /// Delete a lease.
    ///
    /// Fails with [`ImgvolError::NotFound`] if there is no such lease.
    async fn delete(&self, id: &str) -> ImgvolResult<()>;

    /// All leases, ordered by id.
    async fn list(&self) -> ImgvolResult<Vec<Lease>>;
}

/// Leases stored as one JSON file each.
///
/// Creation links a fully written temp file into place, so a lease file is
/// either absent or complete and two creators of one id cannot both win.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    /// Open (creating if needed) a lease store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> ImgvolResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(id.as_bytes()));
        self.dir.join(format!("{name}.json"))
    }

    fn create_blocking(&self, lease: &Lease) -> ImgvolResult<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".lease-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(lease)?)?;
        tmp.as_file().sync_all()?;

        match fs::hard_link(tmp.path(), self.path(&lease.id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(ImgvolError::already_exists(format!("lease {}", lease.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_blocking(&self, id: &str) -> ImgvolResult<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImgvolError::not_found(format!("lease {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_blocking(&self) -> ImgvolResult<Vec<Lease>> {
        let mut leases = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match fs::read(entry.path()) {
                Ok(data) => leases.push(serde_json::from_slice::<Lease>(&data)?),
                // Deleted between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        leases.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(leases)
    }
}

fn join_error(e: tokio::task::JoinError) -> ImgvolError {
    ImgvolError::Internal {
        message: format!("lease task failed: {e}"),
    }
}

#[async_trait]
impl LeaseService for FileLeaseStore {
    async fn create(&self, id: &str, labels: BTreeMap<String, String>) -> ImgvolResult<Lease> {
        let lease = Lease {
            id: id.to_string(),
            labels,
            created_at: Utc::now(),
        };

        let store = self.clone();
        let record = lease.clone();
        tokio::task::spawn_blocking(move || store.create_blocking(&record))
            .await
            .map_err(join_error)??;

        tracing::debug!(lease = %lease.id, "Lease created");
        Ok(lease)
    }

    async fn delete(&self, id: &str) -> ImgvolResult<()> {
        let store = self.clone();
        let owned = id.to_string();
        tokio::task::spawn_blocking(move || store.delete_blocking(&owned))
            .await
            .map_err(join_error)??;

        tracing::debug!(lease = %id, "Lease deleted");
        Ok(())
    }

    async fn list(&self) -> ImgvolResult<Vec<Lease>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking())
            .await
            .map_err(join_error)?
    }
}
