//! Image reference parsing.

use std::str::FromStr;

use imgvol_common::{Digest, ImgvolError, ImgvolResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A manifest digest (e.g., "sha256:abc123...").
    Digest(Digest),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `pause` -> docker.io/library/pause:latest
    /// - `pause:3.9` -> docker.io/library/pause:3.9
    /// - `myuser/tools` -> docker.io/myuser/tools:latest
    /// - `localhost:5000/tools:v1` -> localhost:5000/tools:v1
    /// - `ghcr.io/org/app@sha256:...` -> pinned by manifest digest
    ///
    /// # Errors
    ///
    /// Returns an error for an empty reference or a malformed digest.
    pub fn parse(reference: &str) -> ImgvolResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImgvolError::InvalidRequest {
                reason: "image reference is empty".to_string(),
            });
        }

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            (name, ImageTag::Digest(digest.parse()?))
        } else if let Some(idx) = reference.rfind(':') {
            // registry:port/image has no tag
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                (&reference[..idx], ImageTag::Tag(potential_tag.to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        if name.is_empty() || matches!(&tag, ImageTag::Tag(t) if t.is_empty()) {
            return Err(ImgvolError::InvalidRequest {
                reason: format!("malformed image reference '{reference}'"),
            });
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{name}"),
            ),
        };

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Registry and repository without tag or digest.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        match &self.reference {
            ImageTag::Tag(t) => format!("{}:{t}", self.name()),
            ImageTag::Digest(d) => format!("{}@{d}", self.name()),
        }
    }
}

impl FromStr for ImageReference {
    type Err = ImgvolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
