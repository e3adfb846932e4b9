//! Mounting image volumes.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use imgvol_common::{ImgvolError, ImgvolResult, SandboxId};
use imgvol_image::{Platform, chain_id};

use super::rollback::{Compensation, Rollback};
use super::{ImageVolumeManager, MountSpec};
use crate::filesystem::canonicalize;
use crate::image::ResolvedImage;
use crate::lease::image_volume_labels;
use crate::snapshot::Snapshotter;

impl ImageVolumeManager {
    /// Mount the image named by `spec` for a container of `sandbox_id`.
    ///
    /// Specs without an image are left untouched. On success
    /// `spec.host_path` is the image volume target. Calling this again for
    /// the same image in the same sandbox returns the same target without
    /// repeating any work.
    ///
    /// # Errors
    ///
    /// - [`ImgvolError::InvalidRequest`] if `spec` sets a host path, is not
    ///   read-only, or names an empty image.
    /// - [`ImgvolError::ImageNotFound`] if the image is not in the local store.
    /// - [`ImgvolError::UnpackFailed`], [`ImgvolError::PrepareFailed`] or
    ///   [`ImgvolError::MountFailed`] for failures after the lease is taken;
    ///   everything this call acquired is released first.
    pub async fn mount_image_volume(
        &self,
        spec: &mut MountSpec,
        snapshotter: &str,
        sandbox_id: &SandboxId,
        platform: &Platform,
    ) -> ImgvolResult<()> {
        let Some(reference) = spec.image_reference().map(str::to_string) else {
            return Ok(());
        };
        spec.validate()?;
        let snapshotter = self.snapshotter(snapshotter)?;

        let image = self.resolve(&reference).await?;
        let target = canonicalize(
            &self
                .config
                .paths
                .image_volume_target(sandbox_id, &image.manifest_digest),
        )?;

        if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            tracing::debug!(
                target = %target.display(),
                image = %reference,
                "Image volume already mounted"
            );
            spec.host_path = target;
            return Ok(());
        }

        let key = target.to_string_lossy().into_owned();
        let mut rollback = Rollback::new(&target);

        match self
            .leases
            .create(&key, image_volume_labels(snapshotter.name(), &key))
            .await
        {
            Ok(_) => rollback.push(Compensation::ReleaseLease {
                leases: Arc::clone(&self.leases),
                id: key.clone(),
            }),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(lease = %key, "Lease already held, sharing it");
            }
            Err(e) => {
                return Err(ImgvolError::LeaseFailed {
                    id: key,
                    source: Box::new(e),
                });
            }
        }

        match self
            .prepare_and_mount(&image, &snapshotter, &key, &target, platform, &mut rollback)
            .await
        {
            Ok(()) => {
                rollback.disarm();
                tracing::info!(
                    sandbox = %sandbox_id,
                    image = %image.reference,
                    target = %target.display(),
                    container_path = %spec.container_path.display(),
                    "Image volume mounted"
                );
                spec.host_path = target;
                Ok(())
            }
            Err(e) => {
                tracing::debug!(target = %target.display(), error = %e, "Image volume mount failed, rolling back");
                rollback.run().await;
                Err(e)
            }
        }
    }

    /// Mount every image volume of a container, in order.
    ///
    /// Stops at the first failure. Volumes mounted before it stay mounted
    /// and are released by unmount or sweep.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`Self::mount_image_volume`].
    pub async fn mount_image_volumes(
        &self,
        specs: &mut [MountSpec],
        snapshotter: &str,
        sandbox_id: &SandboxId,
        platform: &Platform,
    ) -> ImgvolResult<()> {
        for spec in specs.iter_mut() {
            self.mount_image_volume(spec, snapshotter, sandbox_id, platform)
                .await?;
        }
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> ImgvolResult<ResolvedImage> {
        match self.images.resolve(reference).await {
            Ok(image) => Ok(image),
            Err(e @ (ImgvolError::ImageNotFound { .. } | ImgvolError::InvalidRequest { .. })) => {
                Err(e)
            }
            Err(e) => {
                tracing::warn!(image = %reference, error = %e, "Failed to resolve image");
                Err(ImgvolError::ImageNotFound {
                    reference: reference.to_string(),
                })
            }
        }
    }

    async fn prepare_and_mount(
        &self,
        image: &ResolvedImage,
        snapshotter: &Arc<dyn Snapshotter>,
        key: &str,
        target: &Path,
        platform: &Platform,
        rollback: &mut Rollback,
    ) -> ImgvolResult<()> {
        let unpack_failed = |source: ImgvolError| ImgvolError::UnpackFailed {
            reference: image.reference.clone(),
            source: Box::new(source),
        };
        let prepare_failed = |source: ImgvolError| ImgvolError::PrepareFailed {
            reference: image.reference.clone(),
            target: target.to_path_buf(),
            source: Box::new(source),
        };
        let mount_failed = |source: ImgvolError| ImgvolError::MountFailed {
            target: target.to_path_buf(),
            source: Box::new(source),
        };

        let diff_ids = self
            .images
            .unpack(image, snapshotter.as_ref(), platform)
            .await
            .map_err(unpack_failed)?;
        let parent = chain_id(&diff_ids).ok_or_else(|| {
            unpack_failed(ImgvolError::Internal {
                message: "unpack returned no layers".to_string(),
            })
        })?;

        let mounts = match snapshotter.prepare(key, &parent).await {
            Ok(mounts) => {
                rollback.push(Compensation::RemoveSnapshot {
                    snapshotter: Arc::clone(snapshotter),
                    key: key.to_string(),
                });
                mounts
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(key, "Snapshot already prepared, reusing its mounts");
                snapshotter.mounts(key).await.map_err(prepare_failed)?
            }
            Err(e) => return Err(prepare_failed(e)),
        };

        if let Some(base) = target.parent() {
            tokio::fs::create_dir_all(base)
                .await
                .map_err(|e| mount_failed(e.into()))?;
        }
        match tokio::fs::create_dir(target).await {
            Ok(()) => rollback.push(Compensation::RemoveDir(target.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(mount_failed(e.into())),
        }

        tracing::debug!(target = %target.display(), mounts = mounts.len(), "Applying mounts");
        self.mounter
            .apply_mounts(&mounts, target)
            .await
            .map_err(mount_failed)
    }
}
