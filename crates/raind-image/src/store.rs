//! Image layer manager (ILM) store.
//!
//! Maps `(repository, reference)` to the extracted bundle on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use raind_common::{Document, JsonStore, RaindError, RaindResult};
use serde::{Deserialize, Serialize};

/// A locally materialized image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Bundle directory holding manifests, blobs, config and rootfs.
    pub bundle_path: PathBuf,
    /// Image configuration JSON.
    pub config_path: PathBuf,
    /// Extracted root filesystem.
    pub rootfs_path: PathBuf,
    /// When the pull finished.
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Record for a bundle laid out the standard way.
    #[must_use]
    pub fn for_bundle(bundle: &Path) -> Self {
        Self {
            bundle_path: bundle.to_path_buf(),
            config_path: bundle.join("config.json"),
            rootfs_path: bundle.join("rootfs"),
            created_at: Utc::now(),
        }
    }
}

/// A listed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Repository (`library/alpine`).
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
    /// Stored record.
    #[serde(flatten)]
    pub record: ImageRecord,
}

/// Persisted ILM document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDocument {
    /// Schema version.
    pub version: String,
    /// repository -> reference -> record.
    #[serde(default)]
    pub images: BTreeMap<String, BTreeMap<String, ImageRecord>>,
}

impl Default for ImageDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            images: BTreeMap::new(),
        }
    }
}

impl Document for ImageDocument {
    const VERSION: &'static str = "1";
}

/// Local image store.
#[derive(Debug)]
pub struct ImageStore {
    store: JsonStore<ImageDocument>,
}

impl ImageStore {
    /// Open the store at `path` (normally `<root>/store/ilm.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Insert or replace the record for an image.
    ///
    /// # Errors
    ///
    /// Returns store I/O errors.
    pub fn put(&self, repository: &str, reference: &str, record: ImageRecord) -> RaindResult<()> {
        self.store.update(|doc| {
            doc.images
                .entry(repository.to_string())
                .or_default()
                .insert(reference.to_string(), record);
            Ok(())
        })
    }

    /// Look up an image.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when the image is not present.
    pub fn get(&self, repository: &str, reference: &str) -> RaindResult<ImageRecord> {
        self.store.read(|doc| {
            doc.images
                .get(repository)
                .and_then(|refs| refs.get(reference))
                .cloned()
                .ok_or_else(|| RaindError::not_found("image", format!("{repository}:{reference}")))
        })
    }

    /// Whether an image is present.
    ///
    /// # Errors
    ///
    /// Returns store I/O errors.
    pub fn contains(&self, repository: &str, reference: &str) -> RaindResult<bool> {
        match self.get(repository, reference) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// All images, ordered by repository then reference.
    ///
    /// # Errors
    ///
    /// Returns store I/O errors.
    pub fn list(&self) -> RaindResult<Vec<ImageEntry>> {
        self.store.read(|doc| {
            Ok(doc
                .images
                .iter()
                .flat_map(|(repository, refs)| {
                    refs.iter().map(move |(reference, record)| ImageEntry {
                        repository: repository.clone(),
                        reference: reference.clone(),
                        record: record.clone(),
                    })
                })
                .collect())
        })
    }

    /// Remove an image record and return it. Empty repositories are pruned.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when the image is not present.
    pub fn remove(&self, repository: &str, reference: &str) -> RaindResult<ImageRecord> {
        self.store.update(|doc| {
            let refs = doc
                .images
                .get_mut(repository)
                .ok_or_else(|| RaindError::not_found("image", format!("{repository}:{reference}")))?;
            let record = refs
                .remove(reference)
                .ok_or_else(|| RaindError::not_found("image", format!("{repository}:{reference}")))?;
            if refs.is_empty() {
                doc.images.remove(repository);
            }
            Ok(record)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_list_remove() {
        let temp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(temp.path().join("ilm.json"));
        let record = ImageRecord::for_bundle(&temp.path().join("alpine/latest"));

        assert!(!store.contains("library/alpine", "latest").unwrap());
        store.put("library/alpine", "latest", record.clone()).unwrap();
        assert_eq!(store.get("library/alpine", "latest").unwrap(), record);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].repository, "library/alpine");

        store.remove("library/alpine", "latest").unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(
            store
                .remove("library/alpine", "latest")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn document_round_trips_on_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("ilm.json");
        let store = ImageStore::new(&path);
        store
            .put("a/b", "1", ImageRecord::for_bundle(Path::new("/x/b/1")))
            .unwrap();

        let raw: ImageDocument = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.images["a/b"]["1"].rootfs_path, PathBuf::from("/x/b/1/rootfs"));
    }
}
