//! # imgvol-image
//!
//! Local image storage for imgvol.
//!
//! This crate provides:
//! - A content-addressed image store with tag lookups
//! - OCI image layout import
//! - Layer extraction with diff ID verification
//! - Chain ID computation and platform matching

#![warn(missing_docs)]

pub mod identity;
pub mod layer;
pub mod layout;
pub mod platform;
pub mod reference;
/// Local image store.
pub mod store;

pub use identity::{chain_id, chain_ids};
pub use layout::{OciLayout, import_layout};
pub use platform::Platform;
pub use reference::{ImageReference, ImageTag};
pub use store::{Descriptor, ImageStore, StoredImage};
