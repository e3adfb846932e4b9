//! # imgvol
//!
//! Mount container images as read-only volumes.
//!
//! A container asks for an image at a path; imgvol resolves the image in the
//! local store, pins it with a GC lease, unpacks its layers into a
//! snapshotter, and mounts a read-only view at a per-sandbox host directory
//! that every container of the sandbox shares.
//!
//! ## Usage
//!
//! ```no_run
//! use imgvol::{ImageVolumeManager, MountSpec, RuntimeConfig};
//! use imgvol_common::SandboxId;
//! use imgvol_image::Platform;
//!
//! # async fn example() -> imgvol_common::ImgvolResult<()> {
//! let manager = ImageVolumeManager::local(RuntimeConfig::default())?;
//! let sandbox = SandboxId::new("pod-1")?;
//!
//! let mut spec = MountSpec::image("/tools", "ghcr.io/org/tools:v1");
//! manager
//!     .mount_image_volume(&mut spec, "overlayfs", &sandbox, &Platform::host())
//!     .await?;
//! println!("mounted at {}", spec.host_path.display());
//!
//! manager.unmount_image_volume(&spec, "overlayfs").await?;
//! manager.sweep_pod_image_volumes(&sandbox).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod filesystem;
pub mod image;
pub mod lease;
pub mod sandbox;
pub mod snapshot;
pub mod volume;

pub use config::RuntimeConfig;
pub use volume::{ImageSpec, ImageVolumeManager, ImageVolumeManagerBuilder, MountSpec};
