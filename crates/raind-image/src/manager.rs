//! Image materialization: make an image available locally and read its
//! configuration.

use std::sync::Arc;

use raind_common::fs::remove_dir_all_if_exists;
use raind_common::paths::stores;
use raind_common::{RaindError, RaindPaths, RaindResult};
use raind_oci::image::ImageConfig;
use tokio::sync::Mutex;

use crate::reference::ImageReference;
use crate::registry::ImagePuller;
use crate::store::{ImageEntry, ImageRecord, ImageStore};

/// Coordinates the image store and the registry puller.
pub struct ImageManager {
    paths: RaindPaths,
    store: ImageStore,
    puller: Arc<dyn ImagePuller>,
    pulls: Mutex<()>,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ImageManager {
    /// Create a manager using the ILM store under `paths`.
    pub fn new(paths: RaindPaths, puller: Arc<dyn ImagePuller>) -> Self {
        let store = ImageStore::new(paths.store(stores::IMAGES));
        Self {
            paths,
            store,
            puller,
            pulls: Mutex::new(()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Return the local record for `image`, pulling it first if absent.
    ///
    /// # Errors
    ///
    /// Returns pull or store errors.
    pub async fn ensure(&self, image: &ImageReference) -> RaindResult<ImageRecord> {
        let _pull = self.pulls.lock().await;
        match self.store.get(&image.repository, image.reference()) {
            Ok(record) if record.rootfs_path.exists() => return Ok(record),
            Ok(_) => tracing::warn!(image = %image, "Image record without rootfs, pulling again"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.fetch(image).await
    }

    /// Pull `image` even if it is already present.
    ///
    /// # Errors
    ///
    /// Returns pull or store errors.
    pub async fn pull(&self, image: &ImageReference) -> RaindResult<ImageRecord> {
        let _pull = self.pulls.lock().await;
        self.fetch(image).await
    }

    async fn fetch(&self, image: &ImageReference) -> RaindResult<ImageRecord> {
        let bundle = self.paths.image_bundle(&image.repository, image.reference());
        remove_dir_all_if_exists(&bundle)?;
        self.puller.pull(image, &bundle).await?;

        let record = ImageRecord::for_bundle(&bundle);
        self.store
            .put(&image.repository, image.reference(), record.clone())?;
        tracing::info!(image = %image, "Image recorded");
        Ok(record)
    }

    /// Read the image configuration of a materialized image.
    ///
    /// # Errors
    ///
    /// Returns I/O or parse errors.
    pub fn config(&self, record: &ImageRecord) -> RaindResult<ImageConfig> {
        let bytes = std::fs::read(&record.config_path).map_err(|err| {
            RaindError::internal(format!(
                "read image config {}: {err}",
                record.config_path.display()
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All local images.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<ImageEntry>> {
        self.store.list()
    }

    /// Remove an image record and its bundle directory.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown images, or I/O errors.
    pub async fn remove(&self, image: &ImageReference) -> RaindResult<()> {
        let _pull = self.pulls.lock().await;
        let record = self.store.remove(&image.repository, image.reference())?;
        remove_dir_all_if_exists(&record.bundle_path)?;
        tracing::info!(image = %image, "Image removed");
        Ok(())
    }
}

/// Test doubles for image pulls.
pub mod fake {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use raind_common::RaindResult;
    use raind_oci::image::{ExecutionConfig, ImageConfig};

    use crate::reference::ImageReference;
    use crate::registry::ImagePuller;

    /// Writes a canned image configuration and an empty rootfs.
    #[derive(Debug, Default)]
    pub struct StaticPuller {
        config: ExecutionConfig,
        pulls: AtomicUsize,
    }

    impl StaticPuller {
        /// Puller whose images carry `config`.
        #[must_use]
        pub fn new(config: ExecutionConfig) -> Self {
            Self {
                config,
                pulls: AtomicUsize::new(0),
            }
        }

        /// Number of pulls performed.
        #[must_use]
        pub fn pulls(&self) -> usize {
            self.pulls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImagePuller for StaticPuller {
        async fn pull(&self, _image: &ImageReference, bundle: &Path) -> RaindResult<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(bundle.join("rootfs"))?;
            let config = ImageConfig {
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                config: Some(self.config.clone()),
            };
            std::fs::write(bundle.join("config.json"), serde_json::to_vec(&config)?)?;
            Ok(())
        }
    }
}
