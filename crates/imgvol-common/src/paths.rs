//! Standard filesystem paths for imgvol.

use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::id::{Digest, SandboxId};

/// Default root directory for persistent imgvol data.
pub static IMGVOL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("IMGVOL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/imgvol"))
});

/// Default state directory for per-boot imgvol data.
pub static IMGVOL_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("IMGVOL_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/imgvol"))
});

/// Directory name holding a sandbox's image volume targets.
pub const IMAGE_VOLUMES_DIR: &str = "image-volumes";

/// Standard paths used by imgvol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImgvolPaths {
    /// Root data directory (default: /var/lib/imgvol).
    pub root: PathBuf,
    /// State directory (default: /run/imgvol).
    pub state: PathBuf,
}

impl ImgvolPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    ///
    /// The state directory is placed under the root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state = root.join("run");
        Self { root, state }
    }

    /// Local image store.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Lease records.
    #[must_use]
    pub fn leases(&self) -> PathBuf {
        self.root.join("leases")
    }

    /// Root of all snapshotters.
    #[must_use]
    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Root of a named snapshotter.
    #[must_use]
    pub fn snapshotter(&self, name: &str) -> PathBuf {
        self.snapshots().join(name)
    }

    /// Directory holding all sandbox state.
    #[must_use]
    pub fn sandboxes(&self) -> PathBuf {
        self.state.join("sandboxes")
    }

    /// State directory of one sandbox.
    #[must_use]
    pub fn sandbox(&self, id: &SandboxId) -> PathBuf {
        self.sandboxes().join(id.as_str())
    }

    /// Sandbox registration record.
    #[must_use]
    pub fn sandbox_record(&self, id: &SandboxId) -> PathBuf {
        self.sandbox(id).join("sandbox.json")
    }

    /// Parent directory of every image volume target of a sandbox.
    #[must_use]
    pub fn image_volume_base_dir(&self, id: &SandboxId) -> PathBuf {
        self.sandbox(id).join(IMAGE_VOLUMES_DIR)
    }

    /// Host directory an image is mounted at for a sandbox.
    ///
    /// Keyed by the hex of the image manifest digest, so two requests for the
    /// same image in the same sandbox always land on the same directory.
    #[must_use]
    pub fn image_volume_target(&self, id: &SandboxId, manifest: &Digest) -> PathBuf {
        self.image_volume_base_dir(id).join(manifest.hex())
    }
}

impl Default for ImgvolPaths {
    fn default() -> Self {
        Self {
            root: IMGVOL_ROOT.clone(),
            state: IMGVOL_STATE_DIR.clone(),
        }
    }
}
