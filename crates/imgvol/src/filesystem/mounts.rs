//! Mount operations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use imgvol_common::{ImgvolError, ImgvolResult};
use serde::{Deserialize, Serialize};

/// A filesystem mount returned by a snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type ("bind", "overlay", ...).
    #[serde(rename = "type")]
    pub fstype: String,
    /// Mount source.
    pub source: PathBuf,
    /// Mount options in fstab form.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// A recursive bind mount.
    pub fn bind(source: impl Into<PathBuf>, readonly: bool) -> Self {
        let mut options = vec!["rbind".to_string()];
        if readonly {
            options.insert(0, "ro".to_string());
        }
        Self {
            fstype: "bind".to_string(),
            source: source.into(),
            options,
        }
    }

    /// Whether the mount is requested read-only.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.parse_options().readonly
    }

    /// Split the option list into mount flags and filesystem data.
    #[must_use]
    pub fn parse_options(&self) -> MountOptions {
        let mut options = MountOptions::default();
        let mut data = Vec::new();

        for option in &self.options {
            match option.as_str() {
                "ro" => options.readonly = true,
                "rw" => options.readonly = false,
                "bind" => options.bind = true,
                "rbind" => {
                    options.bind = true;
                    options.recursive = true;
                }
                "nosuid" => options.nosuid = true,
                "nodev" => options.nodev = true,
                "noexec" => options.noexec = true,
                "suid" | "dev" | "exec" | "defaults" => {}
                other => data.push(other.to_string()),
            }
        }
        if self.fstype == "bind" {
            options.bind = true;
        }

        options.data = data.join(",");
        options
    }
}

/// Mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Read-only mount.
    pub readonly: bool,
    /// Bind mount.
    pub bind: bool,
    /// Recursive bind mount.
    pub recursive: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
    /// No exec.
    pub noexec: bool,
    /// Filesystem specific data, comma separated.
    pub data: String,
}

/// Applies and removes mounts on the host.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Apply `mounts` at `target`, in order.
    async fn apply_mounts(&self, mounts: &[Mount], target: &Path) -> ImgvolResult<()>;

    /// Unmount everything stacked at `target`. Succeeds if nothing is mounted.
    async fn unmount_all(&self, target: &Path) -> ImgvolResult<()>;
}

/// [`Mounter`] that issues mount syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn apply_mounts(&self, mounts: &[Mount], target: &Path) -> ImgvolResult<()> {
        let mounts = mounts.to_vec();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            for (applied, mount) in mounts.iter().enumerate() {
                if let Err(e) = mount_one(mount, &target) {
                    for _ in 0..applied {
                        undo_mount(&target, "partial mount");
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn unmount_all(&self, target: &Path) -> ImgvolResult<()> {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || unmount_all(&target))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> ImgvolError {
    ImgvolError::Internal {
        message: format!("mount task failed: {e}"),
    }
}

/// Mount a filesystem.
///
/// # Errors
///
/// Returns an error if the mount syscall fails or the options contain a NUL byte.
#[cfg(target_os = "linux")]
pub fn mount_one(mount: &Mount, target: &Path) -> ImgvolResult<()> {
    use rustix::mount::{MountFlags, mount as sys_mount, mount_remount};
    use std::ffi::CString;

    let options = mount.parse_options();

    tracing::debug!(
        source = %mount.source.display(),
        target = %target.display(),
        fstype = %mount.fstype,
        ?options,
        "Mounting filesystem"
    );

    let mut flags = MountFlags::empty();
    if options.nosuid {
        flags |= MountFlags::NOSUID;
    }
    if options.nodev {
        flags |= MountFlags::NODEV;
    }
    if options.noexec {
        flags |= MountFlags::NOEXEC;
    }
    if options.bind {
        flags |= MountFlags::BIND;
        if options.recursive {
            flags |= MountFlags::REC;
        }
    } else if options.readonly {
        flags |= MountFlags::RDONLY;
    }

    let data = if options.data.is_empty() {
        None
    } else {
        Some(CString::new(options.data.as_str()).map_err(|_| ImgvolError::Config {
            message: format!("Invalid {} mount options (contains null byte)", mount.fstype),
        })?)
    };
    let fstype = if options.bind {
        None
    } else {
        Some(mount.fstype.as_str())
    };

    sys_mount(
        mount.source.as_path(),
        target,
        fstype.unwrap_or(""),
        flags,
        data.as_deref(),
    )
    .map_err(|e| ImgvolError::Io(e.into()))?;

    // MS_RDONLY is ignored on the initial bind, it only sticks on a remount.
    if options.bind && options.readonly {
        if let Err(e) = mount_remount(target, MountFlags::BIND | MountFlags::RDONLY, "") {
            undo_mount(target, "read-only remount failed");
            return Err(ImgvolError::Io(e.into()));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_one(_mount: &Mount, _target: &Path) -> ImgvolResult<()> {
    Err(ImgvolError::Unsupported {
        feature: "mounts".to_string(),
    })
}

/// Unmount the top mount at `target`.
#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> rustix::io::Result<()> {
    use rustix::mount::UnmountFlags;

    tracing::debug!(target = %target.display(), "Unmounting filesystem");
    rustix::mount::unmount(target, UnmountFlags::empty())
}

/// Unmount the top mount at `target` after a failed step, logging failures.
///
/// Returns whether a mount was removed.
fn undo_mount(target: &Path, reason: &str) -> bool {
    match unmount(target) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                target = %target.display(),
                error = %e,
                reason,
                "Failed to undo mount"
            );
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn unmount(_target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

/// Unmount every mount stacked at `target`.
///
/// Stops once the kernel reports that `target` is no longer a mount point
/// (`EINVAL`) or does not exist (`ENOENT`). `EBUSY` is retried briefly.
///
/// # Errors
///
/// Returns an error for any other unmount failure, or if `target` stays busy.
#[cfg(target_os = "linux")]
pub fn unmount_all(target: &Path) -> ImgvolResult<()> {
    use rustix::io::Errno;

    const BUSY_RETRIES: u32 = 50;

    let mut busy = 0;
    let mut peeled = 0usize;
    loop {
        match unmount(target) {
            Ok(()) => {
                peeled += 1;
                busy = 0;
            }
            Err(Errno::INVAL | Errno::NOENT) => break,
            Err(Errno::BUSY) if busy < BUSY_RETRIES => {
                busy += 1;
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => return Err(ImgvolError::Io(e.into())),
        }
    }

    if peeled > 0 {
        tracing::debug!(target = %target.display(), peeled, "Unmounted stacked mounts");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn unmount_all(_target: &Path) -> ImgvolResult<()> {
    Err(ImgvolError::Unsupported {
        feature: "mounts".to_string(),
    })
}
