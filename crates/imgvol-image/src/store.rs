//! Image store.
//!
//! This module provides local storage for container images: a
//! content-addressed blob directory plus a repository index mapping
//! `registry/repository:tag` to a manifest digest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use imgvol_common::{Digest, ImgvolError, ImgvolResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::platform::Platform;
use crate::reference::{ImageReference, ImageTag};

const BLOBS_DIR: &str = "blobs/sha256";
const REPOSITORIES_FILE: &str = "repositories.json";

/// Local image store.
pub struct ImageStore {
    /// Storage root directory.
    root: PathBuf,
    /// Repository index.
    repositories: HashMap<String, ImageIndex>,
}

/// Image index for a repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImageIndex {
    /// Tag to manifest digest mapping.
    tags: HashMap<String, Digest>,
}

/// Stored image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image reference the image was resolved through.
    pub reference: String,
    /// Manifest digest.
    pub digest: Digest,
    /// Config digest (the image ID).
    pub config_digest: Digest,
    /// Layer blobs, bottom layer first.
    pub layers: Vec<Descriptor>,
    /// Uncompressed layer digests, bottom layer first.
    pub diff_ids: Vec<Digest>,
    /// Total size in bytes.
    pub size: u64,
    /// Created timestamp.
    pub created: Option<String>,
    /// Platform the image was built for.
    pub platform: Platform,
}

/// OCI Image Manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// OCI Image Config, reduced to what image volumes need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// OS.
    #[serde(default)]
    pub os: String,
    /// Architecture variant.
    #[serde(default)]
    pub variant: Option<String>,
    /// Created timestamp.
    #[serde(default)]
    pub created: Option<String>,
    /// Rootfs.
    #[serde(default)]
    pub rootfs: Rootfs,
}

impl ImageConfig {
    /// Platform described by this config.
    #[must_use]
    pub fn platform(&self) -> Platform {
        let mut platform = Platform::new(&self.os, &self.architecture);
        if platform.variant.is_none() {
            platform.variant.clone_from(&self.variant);
        }
        platform
    }
}

/// Rootfs configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rootfs {
    /// Type.
    #[serde(rename = "type", default)]
    pub fs_type: String,
    /// Layer diff IDs.
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Content size.
    pub size: u64,
    /// Target platform, set on image index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ImageStore {
    /// Create a new image store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directories cannot be created or the
    /// repository index cannot be read.
    pub fn new(root: impl Into<PathBuf>) -> ImgvolResult<Self> {
        let root = root.into();

        fs::create_dir_all(root.join(BLOBS_DIR))?;

        let repositories = Self::load_repositories(&root)?;

        Ok(Self { root, repositories })
    }

    /// Get the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reload the repository index from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn refresh(&mut self) -> ImgvolResult<()> {
        self.repositories = Self::load_repositories(&self.root)?;
        Ok(())
    }

    fn load_repositories(root: &Path) -> ImgvolResult<HashMap<String, ImageIndex>> {
        let path = root.join(REPOSITORIES_FILE);

        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_repositories(&self) -> ImgvolResult<()> {
        let path = self.root.join(REPOSITORIES_FILE);
        let content = serde_json::to_string_pretty(&self.repositories)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.persist(&path).map_err(|e| ImgvolError::Io(e.error))?;
        Ok(())
    }

    /// Save an image to the store and tag it as `reference`.
    ///
    /// `layers` pairs each layer's expected digest with its bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or config cannot be parsed, a layer
    /// does not match its expected digest, or the store cannot be written.
    pub fn save(
        &mut self,
        reference: &str,
        manifest_bytes: &[u8],
        config_bytes: &[u8],
        layers: &[(Digest, Vec<u8>)],
    ) -> ImgvolResult<StoredImage> {
        tracing::info!(reference, "Saving image to store");

        let parsed = ImageReference::parse(reference)?;
        let ImageTag::Tag(tag) = &parsed.reference else {
            return Err(ImgvolError::InvalidRequest {
                reason: format!("cannot tag an image with a digest reference '{reference}'"),
            });
        };

        let manifest: ImageManifest = serde_json::from_slice(manifest_bytes)?;
        let config: ImageConfig = serde_json::from_slice(config_bytes)?;

        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(ImgvolError::InvalidRequest {
                reason: format!(
                    "manifest lists {} layers but config lists {} diff IDs",
                    manifest.layers.len(),
                    config.rootfs.diff_ids.len()
                ),
            });
        }

        for (expected, layer_data) in layers {
            let digest = self.store_blob(layer_data)?;
            if &digest != expected {
                return Err(ImgvolError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        for layer in &manifest.layers {
            if !self.has_blob(&layer.digest) {
                return Err(ImgvolError::not_found(format!("layer blob {}", layer.digest)));
            }
        }

        self.store_blob(config_bytes)?;
        let manifest_digest = self.store_blob(manifest_bytes)?;

        self.repositories
            .entry(parsed.name())
            .or_default()
            .tags
            .insert(tag.clone(), manifest_digest.clone());
        self.save_repositories()?;

        let stored = Self::describe(parsed.full_reference(), manifest_digest, manifest_bytes, &manifest, config_bytes, &config);

        tracing::info!(
            reference,
            digest = %stored.digest,
            layers = stored.layers.len(),
            size = stored.size,
            "Image saved"
        );

        Ok(stored)
    }

    /// Load an image from the store by reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is malformed or stored metadata is corrupt.
    pub fn load(&self, reference: &str) -> ImgvolResult<Option<StoredImage>> {
        tracing::debug!(reference, "Loading image from store");

        let parsed = ImageReference::parse(reference)?;

        let digest = match &parsed.reference {
            ImageTag::Digest(d) => d.clone(),
            ImageTag::Tag(tag) => {
                match self
                    .repositories
                    .get(&parsed.name())
                    .and_then(|index| index.tags.get(tag))
                {
                    Some(d) => d.clone(),
                    None => return Ok(None),
                }
            }
        };

        self.load_manifest(parsed.full_reference(), &digest)
    }

    fn load_manifest(&self, reference: String, digest: &Digest) -> ImgvolResult<Option<StoredImage>> {
        let Some(manifest_bytes) = self.get_blob(digest)? else {
            return Ok(None);
        };
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        let Some(config_bytes) = self.get_blob(&manifest.config.digest)? else {
            return Ok(None);
        };
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

        Ok(Some(Self::describe(
            reference,
            digest.clone(),
            &manifest_bytes,
            &manifest,
            &config_bytes,
            &config,
        )))
    }

    fn describe(
        reference: String,
        digest: Digest,
        manifest_bytes: &[u8],
        manifest: &ImageManifest,
        config_bytes: &[u8],
        config: &ImageConfig,
    ) -> StoredImage {
        let size = manifest_bytes.len() as u64
            + config_bytes.len() as u64
            + manifest.layers.iter().map(|l| l.size).sum::<u64>();

        StoredImage {
            reference,
            digest,
            config_digest: manifest.config.digest.clone(),
            layers: manifest.layers.clone(),
            diff_ids: config.rootfs.diff_ids.clone(),
            size,
            created: config.created.clone(),
            platform: config.platform(),
        }
    }

    /// Resolve a reference or image ID to a stored image.
    ///
    /// Accepts a tagged or digested reference, a bare manifest digest, or a
    /// bare config digest (the image ID).
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::ImageNotFound`] if nothing matches.
    pub fn resolve(&self, reference: &str) -> ImgvolResult<StoredImage> {
        let not_found = || ImgvolError::ImageNotFound {
            reference: reference.to_string(),
        };

        let bare_digest = reference
            .parse::<Digest>()
            .ok()
            .filter(|d| d.algorithm() == Digest::SHA256);
        if let Some(digest) = bare_digest {
            if let Some(image) = self.load_manifest(reference.to_string(), &digest)? {
                return Ok(image);
            }
            return self
                .list()?
                .into_iter()
                .find(|image| image.config_digest == digest)
                .ok_or_else(not_found);
        }

        match self.load(reference) {
            Ok(Some(image)) => Ok(image),
            Ok(None) => Err(not_found()),
            Err(e @ ImgvolError::InvalidRequest { .. }) => Err(e),
            Err(e) => {
                tracing::warn!(reference, error = %e, "Failed to read stored image");
                Err(not_found())
            }
        }
    }

    /// List all stored images.
    ///
    /// # Errors
    ///
    /// Returns an error if stored metadata is corrupt.
    pub fn list(&self) -> ImgvolResult<Vec<StoredImage>> {
        let mut images = Vec::new();

        for (name, index) in &self.repositories {
            for tag in index.tags.keys() {
                if let Some(image) = self.load(&format!("{name}:{tag}"))? {
                    images.push(image);
                }
            }
        }

        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(images)
    }

    /// Remove a tag. Blobs are left for garbage collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is malformed or the index cannot be written.
    pub fn delete(&mut self, reference: &str) -> ImgvolResult<bool> {
        tracing::info!(reference, "Deleting image from store");

        let parsed = ImageReference::parse(reference)?;
        let ImageTag::Tag(tag) = &parsed.reference else {
            return Ok(false);
        };
        let name = parsed.name();

        if let Some(index) = self.repositories.get_mut(&name) {
            if index.tags.remove(tag).is_some() {
                if index.tags.is_empty() {
                    self.repositories.remove(&name);
                }
                self.save_repositories()?;
                tracing::info!(reference, "Image deleted");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Store a blob and return its digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be written.
    pub fn store_blob(&self, data: &[u8]) -> ImgvolResult<Digest> {
        let digest = Digest::from_sha256_bytes(&Sha256::digest(data));
        let blob_path = self.blob_path(&digest);

        if !blob_path.exists() {
            let mut tmp = tempfile::NamedTempFile::new_in(self.root.join(BLOBS_DIR))?;
            std::io::Write::write_all(&mut tmp, data)?;
            tmp.persist(&blob_path).map_err(|e| ImgvolError::Io(e.error))?;
            tracing::debug!(digest = %digest, size = data.len(), "Blob stored");
        }

        Ok(digest)
    }

    /// Get a blob by digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob exists but cannot be read.
    pub fn get_blob(&self, digest: &Digest) -> ImgvolResult<Option<Vec<u8>>> {
        match fs::read(self.blob_path(digest)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a blob exists.
    #[must_use]
    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Get the path for a blob.
    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_blob() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp_dir.path()).unwrap();

        let data = b"hello world";
        let digest = store.store_blob(data).unwrap();

        assert_eq!(digest.algorithm(), "sha256");
        assert!(store.has_blob(&digest));

        let retrieved = store.get_blob(&digest).unwrap().unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn missing_image_is_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp_dir.path()).unwrap();

        let err = store.resolve("pause:3.9").unwrap_err();
        assert!(matches!(err, ImgvolError::ImageNotFound { .. }));
        assert!(store.resolve("").is_err());
    }

    #[test]
    fn config_platform_keeps_variant() {
        let config: ImageConfig = serde_json::from_str(
            r#"{"architecture":"arm","os":"linux","variant":"v7","rootfs":{"type":"layers","diff_ids":[]}}"#,
        )
        .unwrap();
        assert_eq!(config.platform().to_string(), "linux/arm/v7");
    }
}
