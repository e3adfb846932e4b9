//! Filesystem operations for image volumes.
//!
//! This module handles:
//! - Mount application and stacked unmounts
//! - Read-only layer views (bind or lowerdir-only overlay)
//! - Path canonicalization

mod canonical;
mod mounts;
mod overlay;

pub use canonical::{canonicalize, clean};
pub use mounts::{Mount, MountOptions, Mounter, SystemMounter, mount_one, unmount_all};
pub use overlay::LayerView;
