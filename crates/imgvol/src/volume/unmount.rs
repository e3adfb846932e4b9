//! Unmounting image volumes.

use std::io::ErrorKind;
use std::path::Path;

use imgvol_common::{ImgvolError, ImgvolResult};

use super::{ImageVolumeManager, MountSpec};
use crate::filesystem::canonicalize;
use crate::snapshot::Snapshotter;

impl ImageVolumeManager {
    /// Unmount an image volume and release what backs it.
    ///
    /// Specs without an image or without a host path, and host paths that no
    /// longer exist, are a no-op, so this can be called any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::UnmountFailed`] if the target cannot be
    /// unmounted or its snapshot removed, and [`ImgvolError::LeaseFailed`] if
    /// the lease cannot be deleted. Nothing is rolled back; a later sweep
    /// retries.
    pub async fn unmount_image_volume(&self, spec: &MountSpec, snapshotter: &str) -> ImgvolResult<()> {
        if spec.image.is_none() || spec.host_path.as_os_str().is_empty() {
            return Ok(());
        }

        let target = canonicalize(&spec.host_path)?;
        match tokio::fs::symlink_metadata(&target).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(target = %target.display(), "Image volume already gone");
                return Ok(());
            }
            Err(e) => {
                return Err(ImgvolError::UnmountFailed {
                    target,
                    source: Box::new(e.into()),
                });
            }
        }

        let snapshotter = self.snapshotter(snapshotter)?;
        self.teardown(&target, snapshotter.as_ref()).await?;

        tracing::info!(
            target = %target.display(),
            container_path = %spec.container_path.display(),
            "Image volume unmounted"
        );
        Ok(())
    }

    /// Unmount every image volume of a container, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`Self::unmount_image_volume`].
    pub async fn unmount_image_volumes(&self, specs: &[MountSpec], snapshotter: &str) -> ImgvolResult<()> {
        for spec in specs {
            self.unmount_image_volume(spec, snapshotter).await?;
        }
        Ok(())
    }

    /// Unmount `target`, delete its lease, remove its snapshot, then remove
    /// the directory. Missing leases, snapshots and directories are fine.
    pub(super) async fn teardown(&self, target: &Path, snapshotter: &dyn Snapshotter) -> ImgvolResult<()> {
        let unmount_failed = |source: ImgvolError| ImgvolError::UnmountFailed {
            target: target.to_path_buf(),
            source: Box::new(source),
        };
        let key = target.to_string_lossy().into_owned();

        self.mounter
            .unmount_all(target)
            .await
            .map_err(unmount_failed)?;

        match self.leases.delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(lease = %key, "Lease already released");
            }
            Err(e) => {
                return Err(ImgvolError::LeaseFailed {
                    id: key,
                    source: Box::new(e),
                });
            }
        }

        match snapshotter.remove(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(key = %key, "Snapshot already removed");
            }
            Err(e) => return Err(unmount_failed(e)),
        }

        match tokio::fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => remove_ignoring_missing(tokio::fs::remove_dir(target).await),
            Ok(_) => remove_ignoring_missing(tokio::fs::remove_file(target).await),
            Err(e) => remove_ignoring_missing(Err(e)),
        }
        .map_err(unmount_failed)
    }
}

fn remove_ignoring_missing(result: std::io::Result<()>) -> ImgvolResult<()> {
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
