//! OCI image layout import.
//!
//! Reads an on-disk [OCI image layout] (`oci-layout`, `index.json`,
//! `blobs/<alg>/<hex>`) and saves one of its images into an [`ImageStore`].
//!
//! [OCI image layout]: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::fs;
use std::path::{Path, PathBuf};

use imgvol_common::{Digest, ImgvolError, ImgvolResult};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use crate::platform::Platform;
use crate::store::{Descriptor, ImageManifest, ImageStore, StoredImage};

/// OCI image index media type.
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker manifest list media type.
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const LAYOUT_VERSION: &str = "1.0.0";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

#[derive(Debug, Deserialize)]
struct ImageIndex {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open a layout directory and check its version marker.
    ///
    /// # Errors
    ///
    /// Returns an error if `oci-layout` is missing or names an unsupported version.
    pub fn open(root: impl Into<PathBuf>) -> ImgvolResult<Self> {
        let root = root.into();
        let marker: LayoutMarker = serde_json::from_slice(&fs::read(root.join("oci-layout"))?)?;
        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(ImgvolError::Unsupported {
                feature: format!("OCI layout version {}", marker.image_layout_version),
            });
        }
        Ok(Self { root })
    }

    /// Path of a blob inside the layout.
    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// Read a blob and verify it against its digest.
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::DigestMismatch`] if the content does not hash to `digest`.
    pub fn read_blob(&self, digest: &Digest) -> ImgvolResult<Vec<u8>> {
        let data = fs::read(self.blob_path(digest))?;
        let actual = Digest::from_sha256_bytes(&Sha256::digest(&data));
        if &actual != digest {
            return Err(ImgvolError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Pick the image manifest for `platform`.
    ///
    /// Nested indexes are followed. An entry without a platform is accepted
    /// only when it is the sole candidate.
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::PlatformMismatch`] if no manifest serves `platform`.
    pub fn select_manifest(&self, platform: &Platform) -> ImgvolResult<Descriptor> {
        let index: ImageIndex = serde_json::from_slice(&fs::read(self.root.join("index.json"))?)?;
        self.select_from(index.manifests, platform)
    }

    fn select_from(&self, manifests: Vec<Descriptor>, platform: &Platform) -> ImgvolResult<Descriptor> {
        let available: Vec<String> = manifests
            .iter()
            .filter_map(|d| d.platform.as_ref().map(ToString::to_string))
            .collect();

        let chosen = if manifests.len() == 1 && manifests[0].platform.is_none() {
            manifests.into_iter().next()
        } else {
            manifests
                .into_iter()
                .find(|d| d.platform.as_ref().is_some_and(|p| p.satisfies(platform)))
        };

        let Some(chosen) = chosen else {
            return Err(ImgvolError::PlatformMismatch {
                reference: self.root.display().to_string(),
                requested: platform.to_string(),
                available: available.join(", "),
            });
        };

        if is_index(&chosen.media_type) {
            let nested: ImageIndex = serde_json::from_slice(&self.read_blob(&chosen.digest)?)?;
            return self.select_from(nested.manifests, platform);
        }
        Ok(chosen)
    }
}

fn is_index(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_INDEX || media_type == MEDIA_TYPE_DOCKER_LIST
}

/// Import the image for `platform` from an OCI layout and tag it `reference`.
///
/// # Errors
///
/// Returns an error if the layout is malformed, a blob is corrupt, or no
/// manifest matches `platform`.
pub fn import_layout(
    store: &mut ImageStore,
    layout_dir: &Path,
    reference: &str,
    platform: &Platform,
) -> ImgvolResult<StoredImage> {
    tracing::info!(layout = %layout_dir.display(), reference, %platform, "Importing OCI layout");

    let layout = OciLayout::open(layout_dir)?;
    let descriptor = layout.select_manifest(platform)?;
    if let Some(name) = descriptor.annotations.get(REF_NAME_ANNOTATION) {
        tracing::debug!(ref_name = %name, "Layout manifest annotated with ref name");
    }

    let manifest_bytes = layout.read_blob(&descriptor.digest)?;
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
    let config_bytes = layout.read_blob(&manifest.config.digest)?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let data = fs::read(layout.blob_path(&layer.digest))?;
        layers.push((layer.digest.clone(), data));
    }

    store.save(reference, &manifest_bytes, &config_bytes, &layers)
}
