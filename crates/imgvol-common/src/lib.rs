//! # imgvol-common
//!
//! Shared utilities and types for imgvol.
//!
//! This crate provides common functionality used across all imgvol crates:
//! - Sandbox ID and content digest validation
//! - Standard filesystem paths, including image volume targets
//! - The common error type

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ImgvolError, ImgvolResult};
pub use id::{Digest, SandboxId};
pub use paths::ImgvolPaths;
