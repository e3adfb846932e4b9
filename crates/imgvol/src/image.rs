//! Image resolution and unpacking.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use imgvol_common::{Digest, ImgvolError, ImgvolResult};
use imgvol_image::{ImageStore, Platform, StoredImage, chain_ids};
use parking_lot::Mutex;

use crate::snapshot::Snapshotter;

/// An image resolved from the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Normalized reference the image was found under.
    pub reference: String,
    /// Manifest digest; names the image volume target.
    pub manifest_digest: Digest,
    /// Config digest (image ID).
    pub config_digest: Digest,
    /// Layer blob digests, bottom layer first.
    pub layers: Vec<Digest>,
    /// Uncompressed layer digests, bottom layer first.
    pub diff_ids: Vec<Digest>,
    /// Platform the image was built for.
    pub platform: Platform,
}

impl From<StoredImage> for ResolvedImage {
    fn from(image: StoredImage) -> Self {
        Self {
            reference: image.reference,
            manifest_digest: image.digest,
            config_digest: image.config_digest,
            layers: image.layers.into_iter().map(|l| l.digest).collect(),
            diff_ids: image.diff_ids,
            platform: image.platform,
        }
    }
}

/// Image lookup and unpacking.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Resolve a reference or image ID against local images.
    ///
    /// Fails with [`ImgvolError::ImageNotFound`] if the image is not present.
    async fn resolve(&self, reference: &str) -> ImgvolResult<ResolvedImage>;

    /// Unpack `image` into `snapshotter` for `platform`.
    ///
    /// Returns the image's diff IDs, bottom layer first. Layers already
    /// present in the snapshotter are not unpacked again.
    async fn unpack(
        &self,
        image: &ResolvedImage,
        snapshotter: &dyn Snapshotter,
        platform: &Platform,
    ) -> ImgvolResult<Vec<Digest>>;
}

/// [`ImageService`] backed by the local [`ImageStore`].
#[derive(Clone)]
pub struct LocalImageService {
    store: Arc<Mutex<ImageStore>>,
}

impl LocalImageService {
    /// Open the image store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub fn new(root: impl Into<PathBuf>) -> ImgvolResult<Self> {
        Ok(Self::from_store(ImageStore::new(root)?))
    }

    /// Wrap an existing store.
    #[must_use]
    pub fn from_store(store: ImageStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Shared handle to the underlying store.
    #[must_use]
    pub fn store(&self) -> Arc<Mutex<ImageStore>> {
        Arc::clone(&self.store)
    }
}

impl std::fmt::Debug for LocalImageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalImageService")
            .field("root", &self.store.lock().root())
            .finish()
    }
}

#[async_trait]
impl ImageService for LocalImageService {
    async fn resolve(&self, reference: &str) -> ImgvolResult<ResolvedImage> {
        let store = Arc::clone(&self.store);
        let reference = reference.to_string();
        tokio::task::spawn_blocking(move || {
            let mut store = store.lock();
            // Another process may have imported since we opened the index.
            store.refresh()?;
            store.resolve(&reference).map(ResolvedImage::from)
        })
        .await
        .map_err(|e| ImgvolError::Internal {
            message: format!("image task failed: {e}"),
        })?
    }

    async fn unpack(
        &self,
        image: &ResolvedImage,
        snapshotter: &dyn Snapshotter,
        platform: &Platform,
    ) -> ImgvolResult<Vec<Digest>> {
        if !image.platform.satisfies(platform) {
            return Err(ImgvolError::PlatformMismatch {
                reference: image.reference.clone(),
                requested: platform.to_string(),
                available: image.platform.to_string(),
            });
        }
        if image.diff_ids.is_empty() {
            return Err(ImgvolError::Unsupported {
                feature: format!("image {} has no layers", image.reference),
            });
        }
        if image.layers.len() != image.diff_ids.len() {
            return Err(ImgvolError::Internal {
                message: format!(
                    "image {} has {} layers but {} diff IDs",
                    image.reference,
                    image.layers.len(),
                    image.diff_ids.len()
                ),
            });
        }

        let blobs: Vec<PathBuf> = {
            let store = self.store.lock();
            image.layers.iter().map(|d| store.blob_path(d)).collect()
        };

        let chain = chain_ids(&image.diff_ids);
        for (i, (blob, diff_id)) in blobs.iter().zip(&image.diff_ids).enumerate() {
            let parent = i.checked_sub(1).map(|p| &chain[p]);
            tracing::debug!(
                image = %image.reference,
                layer = i,
                chain_id = %chain[i],
                "Applying layer"
            );
            snapshotter.apply_layer(&chain[i], parent, blob, diff_id).await?;
        }

        tracing::debug!(
            image = %image.reference,
            snapshotter = snapshotter.name(),
            layers = chain.len(),
            "Image unpacked"
        );
        Ok(image.diff_ids.clone())
    }
}
