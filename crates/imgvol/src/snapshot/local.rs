//! Directory-backed snapshotter.
//!
//! ```text
//! <root>/metadata.lock
//! <root>/committed/<chain-hex>/fs             unpacked layer
//! <root>/committed/<chain-hex>/snapshot.json  parent link
//! <root>/active/<sha256(key)>.json            prepared view
//! <root>/tmp/                                 in-flight unpacks
//! ```
//!
//! Metadata changes happen under an exclusive `flock` on `metadata.lock`,
//! so concurrent prepares of the same key across tasks or processes are
//! detected rather than duplicated.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgvol_common::{Digest, ImgvolError, ImgvolResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::Snapshotter;
use crate::filesystem::{LayerView, Mount};

const LOCK_FILE: &str = "metadata.lock";
const COMMITTED_DIR: &str = "committed";
const ACTIVE_DIR: &str = "active";
const TMP_DIR: &str = "tmp";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Snapshotter storing each layer as a plain directory.
#[derive(Debug, Clone)]
pub struct LocalSnapshotter {
    name: String,
    store: Arc<SnapshotStore>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommittedRecord {
    chain_id: Digest,
    parent: Option<Digest>,
    diff_id: Digest,
    created: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActiveRecord {
    key: String,
    parent: Digest,
    created: DateTime<Utc>,
}

#[derive(Debug)]
struct SnapshotStore {
    root: PathBuf,
}

/// Held exclusive `flock`; released when dropped.
struct MetadataLock {
    _file: File,
}

impl LocalSnapshotter {
    /// Open (creating if needed) a snapshotter rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory layout cannot be created.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> ImgvolResult<Self> {
        let root = root.into();
        for dir in [COMMITTED_DIR, ACTIVE_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }

        Ok(Self {
            name: name.into(),
            store: Arc::new(SnapshotStore { root }),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.store.root
    }

    /// Whether `chain_id` has been committed.
    #[must_use]
    pub fn is_committed(&self, chain_id: &Digest) -> bool {
        self.store.committed_dir(chain_id).join(SNAPSHOT_FILE).is_file()
    }

    async fn blocking<T, F>(&self, f: F) -> ImgvolResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotStore) -> ImgvolResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ImgvolError::Internal {
                message: format!("snapshotter task failed: {e}"),
            })?
    }
}

#[async_trait]
impl Snapshotter for LocalSnapshotter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, key: &str, parent: &Digest) -> ImgvolResult<Vec<Mount>> {
        let key = key.to_string();
        let parent = parent.clone();
        self.blocking(move |store| store.prepare(&key, &parent)).await
    }

    async fn mounts(&self, key: &str) -> ImgvolResult<Vec<Mount>> {
        let key = key.to_string();
        self.blocking(move |store| store.mounts(&key)).await
    }

    async fn remove(&self, key: &str) -> ImgvolResult<()> {
        let key = key.to_string();
        self.blocking(move |store| store.remove(&key)).await
    }

    async fn apply_layer(
        &self,
        chain_id: &Digest,
        parent: Option<&Digest>,
        blob: &Path,
        diff_id: &Digest,
    ) -> ImgvolResult<()> {
        let chain_id = chain_id.clone();
        let parent = parent.cloned();
        let blob = blob.to_path_buf();
        let diff_id = diff_id.clone();
        self.blocking(move |store| store.apply_layer(&chain_id, parent.as_ref(), &blob, &diff_id))
            .await
    }

    async fn list_active(&self) -> ImgvolResult<Vec<String>> {
        self.blocking(SnapshotStore::list_active).await
    }
}

impl SnapshotStore {
    fn lock(&self) -> ImgvolResult<MetadataLock> {
        use rustix::fs::{FlockOperation, flock};

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        flock(&file, FlockOperation::LockExclusive).map_err(|e| ImgvolError::Io(e.into()))?;
        Ok(MetadataLock { _file: file })
    }

    fn committed_dir(&self, chain_id: &Digest) -> PathBuf {
        self.root.join(COMMITTED_DIR).join(chain_id.hex())
    }

    fn active_path(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(ACTIVE_DIR).join(format!("{name}.json"))
    }

    fn read_committed(&self, chain_id: &Digest) -> ImgvolResult<CommittedRecord> {
        match fs::read(self.committed_dir(chain_id).join(SNAPSHOT_FILE)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImgvolError::not_found(format!("snapshot {chain_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_active(&self, key: &str) -> ImgvolResult<ActiveRecord> {
        match fs::read(self.active_path(key)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImgvolError::not_found(format!("active snapshot {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Layer directories of `top` and its ancestors, top first.
    fn view(&self, top: &Digest) -> ImgvolResult<LayerView> {
        let mut dirs = Vec::new();
        let mut next = Some(top.clone());
        while let Some(chain_id) = next {
            let record = self.read_committed(&chain_id)?;
            dirs.push(self.committed_dir(&chain_id).join("fs"));
            next = record.parent;
        }
        Ok(LayerView::new(dirs))
    }

    fn write_json(&self, path: &Path, value: &impl Serialize) -> ImgvolResult<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(value)?)?;
        tmp.persist(path).map_err(|e| ImgvolError::Io(e.error))?;
        Ok(())
    }

    fn prepare(&self, key: &str, parent: &Digest) -> ImgvolResult<Vec<Mount>> {
        let _lock = self.lock()?;

        let path = self.active_path(key);
        if path.exists() {
            return Err(ImgvolError::already_exists(format!("active snapshot {key}")));
        }

        let view = self.view(parent)?;
        self.write_json(
            &path,
            &ActiveRecord {
                key: key.to_string(),
                parent: parent.clone(),
                created: Utc::now(),
            },
        )?;

        tracing::debug!(key, %parent, layers = view.lower_dirs.len(), "Prepared view snapshot");
        Ok(view.mounts())
    }

    fn mounts(&self, key: &str) -> ImgvolResult<Vec<Mount>> {
        let record = self.read_active(key)?;
        Ok(self.view(&record.parent)?.mounts())
    }

    fn remove(&self, key: &str) -> ImgvolResult<()> {
        let _lock = self.lock()?;

        match fs::remove_file(self.active_path(key)) {
            Ok(()) => {
                tracing::debug!(key, "Removed view snapshot");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImgvolError::not_found(format!("active snapshot {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn apply_layer(
        &self,
        chain_id: &Digest,
        parent: Option<&Digest>,
        blob: &Path,
        diff_id: &Digest,
    ) -> ImgvolResult<()> {
        let dest = self.committed_dir(chain_id);
        if dest.join(SNAPSHOT_FILE).is_file() {
            tracing::debug!(%chain_id, "Layer already unpacked");
            return Ok(());
        }
        if let Some(parent) = parent {
            self.read_committed(parent)?;
        }

        let staging = tempfile::tempdir_in(self.root.join(TMP_DIR))?;
        imgvol_image::layer::extract_layer(blob, &staging.path().join("fs"), diff_id)?;
        self.write_json(
            &staging.path().join(SNAPSHOT_FILE),
            &CommittedRecord {
                chain_id: chain_id.clone(),
                parent: parent.cloned(),
                diff_id: diff_id.clone(),
                created: Utc::now(),
            },
        )?;

        let _lock = self.lock()?;
        if dest.join(SNAPSHOT_FILE).is_file() {
            // Lost a race with another unpack of the same layer.
            return Ok(());
        }
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(staging.path(), &dest)?;

        tracing::debug!(%chain_id, %diff_id, "Layer committed");
        Ok(())
    }

    fn list_active(&self) -> ImgvolResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(self.root.join(ACTIVE_DIR))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let record: ActiveRecord = serde_json::from_slice(&fs::read(&path)?)?;
                keys.push(record.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_blob(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, Digest) {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
        let tar = builder.into_inner().unwrap();

        let path = dir.join(format!("{name}.tar"));
        fs::write(&path, &tar).unwrap();
        (path, Digest::from_sha256_bytes(&Sha256::digest(&tar)))
    }

    async fn two_layer_snapshotter(dir: &Path) -> (LocalSnapshotter, Digest) {
        let snapshotter = LocalSnapshotter::new("overlayfs", dir.join("snapshots")).unwrap();
        let (a, a_diff) = layer_blob(dir, "a", b"a");
        let (b, b_diff) = layer_blob(dir, "b", b"b");
        let chain = imgvol_image::chain_ids(&[a_diff.clone(), b_diff.clone()]);

        snapshotter
            .apply_layer(&chain[0], None, &a, &a_diff)
            .await
            .unwrap();
        snapshotter
            .apply_layer(&chain[1], Some(&chain[0]), &b, &b_diff)
            .await
            .unwrap();
        (snapshotter, chain[1].clone())
    }

    #[tokio::test]
    async fn prepare_is_detectable() {
        let temp = tempfile::tempdir().unwrap();
        let (snapshotter, top) = two_layer_snapshotter(temp.path()).await;

        let mounts = snapshotter.prepare("/run/x", &top).await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype, "overlay");

        let err = snapshotter.prepare("/run/x", &top).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(snapshotter.mounts("/run/x").await.unwrap(), mounts);
        assert_eq!(snapshotter.list_active().await.unwrap(), vec!["/run/x"]);
    }

    #[tokio::test]
    async fn remove_reports_missing_keys() {
        let temp = tempfile::tempdir().unwrap();
        let (snapshotter, top) = two_layer_snapshotter(temp.path()).await;

        snapshotter.prepare("/run/x", &top).await.unwrap();
        snapshotter.remove("/run/x").await.unwrap();
        assert!(snapshotter.remove("/run/x").await.unwrap_err().is_not_found());
        assert!(snapshotter.mounts("/run/x").await.unwrap_err().is_not_found());
        assert!(snapshotter.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_layer_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let snapshotter = LocalSnapshotter::new("native", temp.path().join("s")).unwrap();
        let (blob, diff) = layer_blob(temp.path(), "only", b"x");

        snapshotter.apply_layer(&diff, None, &blob, &diff).await.unwrap();
        snapshotter.apply_layer(&diff, None, &blob, &diff).await.unwrap();
        assert!(snapshotter.is_committed(&diff));

        let mounts = snapshotter.prepare("k", &diff).await.unwrap();
        assert_eq!(mounts, vec![Mount::bind(
            snapshotter.root().join("committed").join(diff.hex()).join("fs"),
            true
        )]);
    }

    #[tokio::test]
    async fn missing_parent_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let snapshotter = LocalSnapshotter::new("native", temp.path().join("s")).unwrap();
        let missing = Digest::from_sha256_bytes(&[9; 32]);

        assert!(snapshotter.prepare("k", &missing).await.unwrap_err().is_not_found());
        assert!(snapshotter.list_active().await.unwrap().is_empty());
    }
}
