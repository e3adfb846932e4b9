//! Compensating actions for a partially applied mount.

use std::path::PathBuf;
use std::sync::Arc;

use crate::lease::LeaseService;
use crate::snapshot::Snapshotter;

/// Undoes one step of a mount.
pub(crate) enum Compensation {
    /// Remove a target directory this call created.
    RemoveDir(PathBuf),
    /// Remove a view snapshot this call prepared.
    RemoveSnapshot {
        snapshotter: Arc<dyn Snapshotter>,
        key: String,
    },
    /// Delete a lease this call created.
    ReleaseLease {
        leases: Arc<dyn LeaseService>,
        id: String,
    },
}

impl Compensation {
    fn describe(&self) -> &'static str {
        match self {
            Self::RemoveDir(_) => "remove target directory",
            Self::RemoveSnapshot { .. } => "remove snapshot",
            Self::ReleaseLease { .. } => "release lease",
        }
    }

    async fn apply(&self) -> imgvol_common::ImgvolResult<()> {
        match self {
            Self::RemoveDir(dir) => Ok(tokio::fs::remove_dir(dir).await?),
            Self::RemoveSnapshot { snapshotter, key } => snapshotter.remove(key).await,
            Self::ReleaseLease { leases, id } => leases.delete(id).await,
        }
    }
}

/// Stack of compensating actions, run in reverse on failure.
///
/// Only resources the current call acquired are pushed; anything another
/// caller owns is left alone.
pub(crate) struct Rollback {
    target: PathBuf,
    steps: Vec<Compensation>,
}

impl Rollback {
    pub(crate) fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Keep everything acquired so far.
    pub(crate) fn disarm(mut self) {
        self.steps.clear();
    }

    /// Run every step, newest first. Failures are logged and skipped.
    pub(crate) async fn run(mut self) {
        while let Some(step) = self.steps.pop() {
            match step.apply().await {
                Ok(()) => tracing::debug!(
                    target = %self.target.display(),
                    step = step.describe(),
                    "Rolled back"
                ),
                Err(e) => tracing::warn!(
                    target = %self.target.display(),
                    step = step.describe(),
                    error = %e,
                    "Rollback step failed"
                ),
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::warn!(
                target = %self.target.display(),
                pending = self.steps.len(),
                "Image volume mount abandoned, resources left for sweep"
            );
        }
    }
}
