//! Image volumes.
//!
//! An image volume mounts the contents of a container image, read-only, at
//! a path inside a container. The image is prepared once per sandbox at a
//! host directory derived from the sandbox ID and the image manifest
//! digest; every container in the sandbox that asks for the same image
//! shares that directory.
//!
//! The existence of the target directory is the only coordination signal:
//! there is no in-process lock per target. Concurrent first callers are
//! reconciled by the lease store reporting duplicate leases and by the
//! snapshotter reporting duplicate prepares.

mod mount;
mod rollback;
mod sweep;
mod unmount;

use std::path::PathBuf;
use std::sync::Arc;

use imgvol_common::{ImgvolError, ImgvolResult};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::filesystem::{Mounter, SystemMounter};
use crate::image::{ImageService, LocalImageService};
use crate::lease::{FileLeaseStore, LeaseService};
use crate::sandbox::{FileSandboxStore, SandboxStore};
use crate::snapshot::{LocalSnapshotter, Snapshotter, SnapshotterRegistry};

/// Image to mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Image reference or image ID.
    pub image: String,
}

/// A container mount request.
///
/// For image volumes `host_path` is an output: it must be empty on input and
/// is set to the image volume target once the image is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Path inside the container.
    pub container_path: PathBuf,
    /// Host path backing the mount.
    #[serde(default)]
    pub host_path: PathBuf,
    /// Read-only mount.
    #[serde(default)]
    pub readonly: bool,
    /// Image backing the mount, if this is an image volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSpec>,
}

impl MountSpec {
    /// A read-only image volume request.
    pub fn image(container_path: impl Into<PathBuf>, reference: impl Into<String>) -> Self {
        Self {
            container_path: container_path.into(),
            host_path: PathBuf::new(),
            readonly: true,
            image: Some(ImageSpec {
                image: reference.into(),
            }),
        }
    }

    /// The image reference, if this is an image volume.
    #[must_use]
    pub fn image_reference(&self) -> Option<&str> {
        self.image.as_ref().map(|i| i.image.as_str())
    }

    /// Check the caller contract for image volumes.
    fn validate(&self) -> ImgvolResult<()> {
        let invalid = |reason: String| Err(ImgvolError::InvalidRequest { reason });

        match self.image_reference() {
            None => Ok(()),
            Some("") => invalid(format!(
                "image volume at {} has an empty image reference",
                self.container_path.display()
            )),
            Some(_) if !self.host_path.as_os_str().is_empty() => invalid(format!(
                "image volume at {} must not set a host path (got {})",
                self.container_path.display(),
                self.host_path.display()
            )),
            Some(_) if !self.readonly => invalid(format!(
                "image volume at {} must be read-only",
                self.container_path.display()
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Mounts, unmounts and sweeps image volumes.
pub struct ImageVolumeManager {
    config: RuntimeConfig,
    images: Arc<dyn ImageService>,
    leases: Arc<dyn LeaseService>,
    snapshotters: SnapshotterRegistry,
    mounter: Arc<dyn Mounter>,
    sandboxes: Arc<dyn SandboxStore>,
}

impl ImageVolumeManager {
    /// Start building a manager for `config`.
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> ImageVolumeManagerBuilder {
        ImageVolumeManagerBuilder {
            config,
            images: None,
            leases: None,
            snapshotters: SnapshotterRegistry::new(),
            mounter: None,
            sandboxes: None,
        }
    }

    /// A manager wired to the local collaborators under `config.paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if any local store cannot be opened.
    pub fn local(config: RuntimeConfig) -> ImgvolResult<Self> {
        Self::builder(config).build()
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Lease service.
    #[must_use]
    pub fn leases(&self) -> &Arc<dyn LeaseService> {
        &self.leases
    }

    /// Registered snapshotters.
    #[must_use]
    pub fn snapshotters(&self) -> &SnapshotterRegistry {
        &self.snapshotters
    }

    fn snapshotter(&self, name: &str) -> ImgvolResult<Arc<dyn Snapshotter>> {
        self.snapshotters
            .get(name)
            .ok_or_else(|| ImgvolError::Config {
                message: format!(
                    "snapshotter '{name}' is not available (have: {})",
                    self.snapshotters.names().join(", ")
                ),
            })
    }
}

impl std::fmt::Debug for ImageVolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageVolumeManager")
            .field("config", &self.config)
            .field("snapshotters", &self.snapshotters)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ImageVolumeManager`].
///
/// Collaborators left unset fall back to the local implementations.
pub struct ImageVolumeManagerBuilder {
    config: RuntimeConfig,
    images: Option<Arc<dyn ImageService>>,
    leases: Option<Arc<dyn LeaseService>>,
    snapshotters: SnapshotterRegistry,
    mounter: Option<Arc<dyn Mounter>>,
    sandboxes: Option<Arc<dyn SandboxStore>>,
}

impl ImageVolumeManagerBuilder {
    /// Use `images` to resolve and unpack images.
    #[must_use]
    pub fn images(mut self, images: Arc<dyn ImageService>) -> Self {
        self.images = Some(images);
        self
    }

    /// Use `leases` for GC leases.
    #[must_use]
    pub fn leases(mut self, leases: Arc<dyn LeaseService>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Register a snapshotter.
    #[must_use]
    pub fn snapshotter(mut self, snapshotter: Arc<dyn Snapshotter>) -> Self {
        self.snapshotters.register(snapshotter);
        self
    }

    /// Use `mounter` to apply and remove mounts.
    #[must_use]
    pub fn mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = Some(mounter);
        self
    }

    /// Use `sandboxes` to look up runtime handlers.
    #[must_use]
    pub fn sandboxes(mut self, sandboxes: Arc<dyn SandboxStore>) -> Self {
        self.sandboxes = Some(sandboxes);
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if a local fallback store cannot be opened.
    pub fn build(self) -> ImgvolResult<ImageVolumeManager> {
        let paths = &self.config.paths;

        let images: Arc<dyn ImageService> = match self.images {
            Some(images) => images,
            None => Arc::new(LocalImageService::new(paths.images())?),
        };
        let leases: Arc<dyn LeaseService> = match self.leases {
            Some(leases) => leases,
            None => Arc::new(FileLeaseStore::new(paths.leases())?),
        };
        let mut snapshotters = self.snapshotters;
        if snapshotters.names().is_empty() {
            for name in self.config.snapshotter_names() {
                let local = LocalSnapshotter::new(name.as_str(), paths.snapshotter(&name))?;
                snapshotters.register(Arc::new(local));
            }
        }
        let mounter: Arc<dyn Mounter> = match self.mounter {
            Some(mounter) => mounter,
            None => Arc::new(SystemMounter),
        };
        let sandboxes: Arc<dyn SandboxStore> = match self.sandboxes {
            Some(sandboxes) => sandboxes,
            None => Arc::new(FileSandboxStore::new(paths.clone())),
        };

        Ok(ImageVolumeManager {
            config: self.config,
            images,
            leases,
            snapshotters,
            mounter,
            sandboxes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mounts_pass_validation() {
        let spec = MountSpec {
            container_path: PathBuf::from("/data"),
            host_path: PathBuf::from("/srv/data"),
            readonly: false,
            image: None,
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn image_volumes_must_be_readonly_without_host_path() {
        let mut spec = MountSpec::image("/tools", "tools:v1");
        assert!(spec.validate().is_ok());

        spec.readonly = false;
        let err = spec.validate().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Invalid image volume request: image volume at /tools must be read-only");

        let mut spec = MountSpec::image("/tools", "tools:v1");
        spec.host_path = PathBuf::from("/srv/tools");
        assert!(matches!(
            spec.validate(),
            Err(ImgvolError::InvalidRequest { .. })
        ));

        let spec = MountSpec::image("/tools", "");
        assert!(matches!(
            spec.validate(),
            Err(ImgvolError::InvalidRequest { .. })
        ));
    }
}
