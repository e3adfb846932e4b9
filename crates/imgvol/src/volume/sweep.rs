//! Pod teardown sweep.

use std::io::ErrorKind;

use imgvol_common::{ImgvolError, ImgvolResult, SandboxId};

use super::ImageVolumeManager;
use crate::filesystem::canonicalize;

impl ImageVolumeManager {
    /// Tear down every image volume left under a sandbox, then its base
    /// directory.
    ///
    /// Sandboxes without a known runtime handler or snapshotter are skipped.
    /// A failure stops the sweep; entries not yet reached are left for the
    /// next one.
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::UnmountFailed`] or [`ImgvolError::LeaseFailed`]
    /// from the failing entry, or an I/O error if the base directory cannot
    /// be read or removed.
    pub async fn sweep_pod_image_volumes(&self, sandbox_id: &SandboxId) -> ImgvolResult<()> {
        let handler = match self.sandboxes.runtime_handler(sandbox_id).await {
            Ok(handler) => handler,
            Err(e) if e.is_not_found() => {
                tracing::debug!(sandbox = %sandbox_id, "Sandbox not registered, nothing to sweep");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(sandbox = %sandbox_id, error = %e, "Failed to look up sandbox runtime handler");
                return Ok(());
            }
        };

        let name = self.config.snapshotter_for(&handler);
        let Some(snapshotter) = self.snapshotters.get(name) else {
            tracing::debug!(sandbox = %sandbox_id, snapshotter = name, "Snapshotter unavailable, nothing to sweep");
            return Ok(());
        };

        let base = self.config.paths.image_volume_base_dir(sandbox_id);
        let mut entries = match tokio::fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut swept = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let target = canonicalize(&base.join(entry.file_name()))?;
            tracing::debug!(sandbox = %sandbox_id, target = %target.display(), "Sweeping image volume");
            self.teardown(&target, snapshotter.as_ref()).await?;
            swept += 1;
        }

        match tokio::fs::remove_dir(&base).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ImgvolError::Io(e)),
        }

        tracing::info!(sandbox = %sandbox_id, swept, "Image volumes swept");
        Ok(())
    }
}
