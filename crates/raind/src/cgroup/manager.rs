//! Cgroup manager implementation.

use std::io::ErrorKind;
use std::path::PathBuf;

use raind_common::{RaindError, RaindResult};

/// Creates and removes per-container cgroup directories.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    root: PathBuf,
}

impl CgroupManager {
    /// Manage cgroups below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cgroup path of a container.
    #[must_use]
    pub fn path(&self, container_id: &str) -> PathBuf {
        self.root.join(container_id)
    }

    /// Create the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns the failing directory creation.
    pub fn create(&self, container_id: &str) -> RaindResult<PathBuf> {
        let path = self.path(container_id);

        tracing::debug!(
            container_id = %container_id,
            path = %path.display(),
            "Creating cgroup"
        );

        std::fs::create_dir_all(&path).map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                RaindError::Config {
                    message: format!("no permission to create cgroup {}", path.display()),
                }
            } else {
                RaindError::Io(e)
            }
        })?;
        Ok(path)
    }

    /// Remove the container's cgroup. A missing cgroup is not an error.
    ///
    /// Cgroup directories are removed with `rmdir`; the kernel refuses while
    /// processes remain.
    ///
    /// # Errors
    ///
    /// Returns the failing removal.
    pub fn remove(&self, container_id: &str) -> RaindResult<()> {
        let path = self.path(container_id);
        match std::fs::remove_dir(&path) {
            Ok(()) => {
                tracing::debug!(container_id = %container_id, "Removed cgroup");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
