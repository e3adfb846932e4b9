//! Common error types for imgvol.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ImgvolError`].
pub type ImgvolResult<T> = Result<T, ImgvolError>;

/// Errors raised by image volume operations and their collaborators.
#[derive(Error, Diagnostic, Debug)]
pub enum ImgvolError {
    /// The mount request violates the caller contract.
    #[error("Invalid image volume request: {reason}")]
    #[diagnostic(
        code(imgvol::volume::invalid_request),
        help("Image volumes must be read-only and must not carry a host path")
    )]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// Image not found in the local store.
    #[error("Image not found: {reference}")]
    #[diagnostic(
        code(imgvol::image::not_found),
        help("Import the image first with `imgvol image import`")
    )]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Unpacking the image into the snapshotter failed.
    #[error("Failed to unpack image volume {reference}")]
    #[diagnostic(code(imgvol::volume::unpack_failed))]
    UnpackFailed {
        /// The image being unpacked.
        reference: String,
        /// Underlying failure.
        #[source]
        source: Box<ImgvolError>,
    },

    /// Preparing the active snapshot failed.
    #[error("Failed to prepare image volume {reference} at {target}")]
    #[diagnostic(code(imgvol::volume::prepare_failed))]
    PrepareFailed {
        /// The image being prepared.
        reference: String,
        /// The image volume target.
        target: PathBuf,
        /// Underlying failure.
        #[source]
        source: Box<ImgvolError>,
    },

    /// Applying the snapshot mounts failed.
    #[error("Failed to mount image volume at {target}")]
    #[diagnostic(code(imgvol::volume::mount_failed))]
    MountFailed {
        /// The image volume target.
        target: PathBuf,
        /// Underlying failure.
        #[source]
        source: Box<ImgvolError>,
    },

    /// Unmounting an image volume failed.
    #[error("Failed to unmount image volume at {target}")]
    #[diagnostic(
        code(imgvol::volume::unmount_failed),
        help("The mount may still be busy; teardown can be retried later")
    )]
    UnmountFailed {
        /// The image volume target.
        target: PathBuf,
        /// Underlying failure.
        #[source]
        source: Box<ImgvolError>,
    },

    /// A lease operation failed.
    #[error("Lease operation failed for {id}")]
    #[diagnostic(code(imgvol::lease::failed))]
    LeaseFailed {
        /// The lease identifier.
        id: String,
        /// Underlying failure.
        #[source]
        source: Box<ImgvolError>,
    },

    /// The resource already exists.
    #[error("Already exists: {resource}")]
    #[diagnostic(code(imgvol::already_exists))]
    AlreadyExists {
        /// Description of the existing resource.
        resource: String,
    },

    /// The resource does not exist.
    #[error("Not found: {resource}")]
    #[diagnostic(code(imgvol::not_found))]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },

    /// Invalid sandbox ID format.
    #[error("Invalid sandbox ID: {id}")]
    #[diagnostic(
        code(imgvol::sandbox::invalid_id),
        help("Sandbox IDs must be alphanumeric with hyphens and underscores, 1-128 characters")
    )]
    InvalidSandboxId {
        /// The invalid sandbox ID.
        id: String,
    },

    /// Invalid content digest.
    #[error("Invalid digest: {digest}")]
    #[diagnostic(
        code(imgvol::digest::invalid),
        help("Digests look like 'sha256:' followed by 64 lowercase hex characters")
    )]
    InvalidDigest {
        /// The invalid digest string.
        digest: String,
    },

    /// Content did not hash to the expected digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(imgvol::digest::mismatch))]
    DigestMismatch {
        /// The digest recorded in the image config.
        expected: String,
        /// The digest of the content actually read.
        actual: String,
    },

    /// The image does not provide the requested platform.
    #[error("Image {reference} is {available}, requested {requested}")]
    #[diagnostic(code(imgvol::image::platform_mismatch))]
    PlatformMismatch {
        /// The image reference.
        reference: String,
        /// Platform the caller asked for.
        requested: String,
        /// Platform the image provides.
        available: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(imgvol::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(imgvol::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(imgvol::unsupported),
        help("Image volume mounts require Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(imgvol::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(imgvol::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/imgvol/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl ImgvolError {
    /// Create a [`ImgvolError::NotFound`].
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a [`ImgvolError::AlreadyExists`].
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Whether this error, or the error it wraps, means "does not exist".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::ImageNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => self.wrapped().is_some_and(Self::is_not_found),
        }
    }

    /// Whether this error, or the error it wraps, means "already exists".
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => self.wrapped().is_some_and(Self::is_already_exists),
        }
    }

    fn wrapped(&self) -> Option<&Self> {
        match self {
            Self::UnpackFailed { source, .. }
            | Self::PrepareFailed { source, .. }
            | Self::MountFailed { source, .. }
            | Self::UnmountFailed { source, .. }
            | Self::LeaseFailed { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ImgvolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
