//! Shared fixtures for imgvol integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use imgvol::filesystem::{Mount, Mounter};
use imgvol::image::{ImageService, LocalImageService, ResolvedImage};
use imgvol::lease::{FileLeaseStore, LeaseService};
use imgvol::snapshot::{LocalSnapshotter, Snapshotter};
use imgvol::{ImageVolumeManager, RuntimeConfig};
use imgvol_common::{Digest, ImgvolError, ImgvolResult, SandboxId};
use imgvol_image::{ImageStore, Platform, import_layout};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;

pub const SNAPSHOTTER: &str = "overlayfs";

/// Records mounts instead of calling into the kernel.
#[derive(Default)]
pub struct FakeMounter {
    stacks: Mutex<HashMap<PathBuf, Vec<Mount>>>,
    applied: AtomicUsize,
    fail_apply: AtomicBool,
    fail_unmount: AtomicBool,
}

impl FakeMounter {
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `apply_mounts` calls.
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// Mounts currently stacked at `target`.
    pub fn depth(&self, target: &Path) -> usize {
        self.stacks.lock().get(target).map_or(0, Vec::len)
    }

    pub fn mounted_targets(&self) -> usize {
        self.stacks.lock().values().filter(|s| !s.is_empty()).count()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn apply_mounts(&self, mounts: &[Mount], target: &Path) -> ImgvolResult<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ImgvolError::Io(std::io::Error::other("injected mount failure")));
        }
        if !target.is_dir() {
            return Err(ImgvolError::Io(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )));
        }
        assert!(!mounts.is_empty(), "no mounts for {}", target.display());
        assert!(mounts.iter().all(Mount::is_readonly) || mounts[0].fstype == "overlay");

        self.stacks
            .lock()
            .entry(target.to_path_buf())
            .or_default()
            .extend_from_slice(mounts);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unmount_all(&self, target: &Path) -> ImgvolResult<()> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(ImgvolError::Io(std::io::Error::other("device or resource busy")));
        }
        self.stacks.lock().remove(target);
        Ok(())
    }
}

/// Delegates to a [`LocalSnapshotter`], optionally failing prepares.
pub struct FlakySnapshotter {
    pub inner: LocalSnapshotter,
    pub fail_prepare: AtomicBool,
}

#[async_trait]
impl Snapshotter for FlakySnapshotter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn prepare(&self, key: &str, parent: &Digest) -> ImgvolResult<Vec<Mount>> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(ImgvolError::Io(std::io::Error::other("injected prepare failure")));
        }
        self.inner.prepare(key, parent).await
    }

    async fn mounts(&self, key: &str) -> ImgvolResult<Vec<Mount>> {
        self.inner.mounts(key).await
    }

    async fn remove(&self, key: &str) -> ImgvolResult<()> {
        self.inner.remove(key).await
    }

    async fn apply_layer(
        &self,
        chain_id: &Digest,
        parent: Option<&Digest>,
        blob: &Path,
        diff_id: &Digest,
    ) -> ImgvolResult<()> {
        self.inner.apply_layer(chain_id, parent, blob, diff_id).await
    }

    async fn list_active(&self) -> ImgvolResult<Vec<String>> {
        self.inner.list_active().await
    }
}

/// Counts unpacks on top of a [`LocalImageService`].
pub struct CountingImages {
    pub inner: LocalImageService,
    pub unpacks: AtomicUsize,
}

#[async_trait]
impl ImageService for CountingImages {
    async fn resolve(&self, reference: &str) -> ImgvolResult<ResolvedImage> {
        self.inner.resolve(reference).await
    }

    async fn unpack(
        &self,
        image: &ResolvedImage,
        snapshotter: &dyn Snapshotter,
        platform: &Platform,
    ) -> ImgvolResult<Vec<Digest>> {
        self.unpacks.fetch_add(1, Ordering::SeqCst);
        self.inner.unpack(image, snapshotter, platform).await
    }
}

/// A scratch imgvol root with fake mounts and instrumented collaborators.
pub struct Harness {
    pub temp: TempDir,
    pub config: RuntimeConfig,
    pub mounter: Arc<FakeMounter>,
    pub snapshotter: Arc<FlakySnapshotter>,
    pub images: Arc<CountingImages>,
    pub leases: Arc<FileLeaseStore>,
    pub manager: Arc<ImageVolumeManager>,
}

impl Harness {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::default().with_root(temp.path().join("root"));
        let paths = &config.paths;

        let mounter = Arc::new(FakeMounter::default());
        let snapshotter = Arc::new(FlakySnapshotter {
            inner: LocalSnapshotter::new(SNAPSHOTTER, paths.snapshotter(SNAPSHOTTER)).unwrap(),
            fail_prepare: AtomicBool::new(false),
        });
        let images = Arc::new(CountingImages {
            inner: LocalImageService::new(paths.images()).unwrap(),
            unpacks: AtomicUsize::new(0),
        });
        let leases = Arc::new(FileLeaseStore::new(paths.leases()).unwrap());

        let manager = ImageVolumeManager::builder(config.clone())
            .mounter(mounter.clone())
            .snapshotter(snapshotter.clone())
            .images(images.clone())
            .leases(leases.clone())
            .build()
            .unwrap();

        Self {
            temp,
            config,
            mounter,
            snapshotter,
            images,
            leases,
            manager: Arc::new(manager),
        }
    }

    /// Import a one-layer image holding `files` for the host platform.
    pub fn import(&self, reference: &str, files: &[(&str, &[u8])]) -> Digest {
        self.import_for(reference, files, &Platform::host())
    }

    pub fn import_for(&self, reference: &str, files: &[(&str, &[u8])], platform: &Platform) -> Digest {
        let layout = self.temp.path().join(format!("layout-{}", hex_of(reference.as_bytes())));
        write_layout(&layout, files, platform);

        let mut store = ImageStore::new(self.config.paths.images()).unwrap();
        import_layout(&mut store, &layout, reference, platform)
            .unwrap()
            .digest
    }

    pub fn register(&self, sandbox: &SandboxId) {
        imgvol::sandbox::FileSandboxStore::new(self.config.paths.clone())
            .register(sandbox, "runc")
            .unwrap();
    }

    pub fn target(&self, sandbox: &SandboxId, manifest: &Digest) -> PathBuf {
        self.config.paths.image_volume_target(sandbox, manifest)
    }

    pub fn base_dir(&self, sandbox: &SandboxId) -> PathBuf {
        self.config.paths.image_volume_base_dir(sandbox)
    }

    pub async fn lease_ids(&self) -> Vec<String> {
        self.leases
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect()
    }

    pub async fn active_snapshots(&self) -> Vec<String> {
        self.snapshotter.list_active().await.unwrap()
    }

    pub fn unpacks(&self) -> usize {
        self.images.unpacks.load(Ordering::SeqCst)
    }
}

pub fn sandbox(id: &str) -> SandboxId {
    SandboxId::new(id).unwrap()
}

fn hex_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn sha256(data: &[u8]) -> Digest {
    Digest::from_sha256_bytes(&Sha256::digest(data))
}

fn write_blob(layout: &Path, data: &[u8]) -> Digest {
    let digest = sha256(data);
    let dir = layout.join("blobs/sha256");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(digest.hex()), data).unwrap();
    digest
}

/// Write a one-layer image as an OCI layout directory.
pub fn write_layout(layout: &Path, files: &[(&str, &[u8])], platform: &Platform) -> Digest {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let diff_id = sha256(&tar);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    let layer = encoder.finish().unwrap();
    let layer_digest = write_blob(layout, &layer);

    let config = serde_json::to_vec(&serde_json::json!({
        "architecture": platform.architecture,
        "os": platform.os,
        "rootfs": { "type": "layers", "diff_ids": [diff_id.to_string()] },
    }))
    .unwrap();
    let config_digest = write_blob(layout, &config);

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest.to_string(),
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer_digest.to_string(),
            "size": layer.len(),
        }],
    }))
    .unwrap();
    let manifest_digest = write_blob(layout, &manifest);

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest.to_string(),
            "size": manifest.len(),
            "platform": { "os": platform.os, "architecture": platform.architecture },
        }],
    });
    fs::write(layout.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    fs::write(layout.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    manifest_digest
}
