//! Standard filesystem paths for raind.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory for raind data.
pub static RAIND_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("RAIND_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/raind"))
});

/// Default cgroup subtree owned by raind.
pub static RAIND_CGROUP_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("RAIND_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup/raind"))
});

/// The per-container subdirectories created at container creation.
pub const CONTAINER_SUBDIRS: [&str; 6] = ["diff", "work", "merged", "etc", "logs", "cert"];

/// Names of the JSON stores kept under `<root>/store`.
pub mod stores {
    /// Container state manager.
    pub const CONTAINERS: &str = "csm";
    /// IP address management.
    pub const IPAM: &str = "ipam";
    /// Image layer manager.
    pub const IMAGES: &str = "ilm";
    /// Pod state manager.
    pub const PODS: &str = "psm";
    /// Bottle state manager.
    pub const BOTTLES: &str = "bsm";
    /// Network policy manager.
    pub const POLICIES: &str = "npm";
    /// Service state manager.
    pub const SERVICES: &str = "ssm";
}

/// Standard paths used by the daemon.
#[derive(Debug, Clone)]
pub struct RaindPaths {
    /// Root data directory (default: /etc/raind).
    pub root: PathBuf,
    /// Cgroup subtree (default: /sys/fs/cgroup/raind).
    pub cgroup_root: PathBuf,
}

impl RaindPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root; the cgroup subtree moves under it too,
    /// which keeps tests away from the real cgroup filesystem.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cgroup_root = root.join("cgroup");
        Self { root, cgroup_root }
    }

    /// Directory holding all containers.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("container")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// A named subdirectory of a container (`diff`, `work`, `merged`, ...).
    #[must_use]
    pub fn container_subdir(&self, id: &str, name: &str) -> PathBuf {
        self.container(id).join(name)
    }

    /// Runtime spec written for a container.
    #[must_use]
    pub fn container_config(&self, id: &str) -> PathBuf {
        self.container(id).join("config.json")
    }

    /// TTY socket exposed by the runtime.
    #[must_use]
    pub fn container_tty_socket(&self, id: &str) -> PathBuf {
        self.container(id).join("tty.sock")
    }

    /// Container log file.
    #[must_use]
    pub fn container_log(&self, id: &str) -> PathBuf {
        self.container_subdir(id, "logs").join("console.log")
    }

    /// Container cgroup subtree.
    #[must_use]
    pub fn container_cgroup(&self, id: &str) -> PathBuf {
        self.cgroup_root.join(id)
    }

    /// Root of extracted images.
    #[must_use]
    pub fn image_layers(&self) -> PathBuf {
        self.root.join("image").join("layers")
    }

    /// Bundle directory for one image reference.
    ///
    /// Only the last path component of the repository is used and `:` in
    /// digests is replaced so the reference is a single path component.
    #[must_use]
    pub fn image_bundle(&self, repository: &str, reference: &str) -> PathBuf {
        let leaf = repository.rsplit('/').next().unwrap_or(repository);
        self.image_layers().join(leaf).join(reference.replace(':', "_"))
    }

    /// Directory of the JSON stores.
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Path of a named JSON store (see [`stores`]).
    #[must_use]
    pub fn store(&self, name: &str) -> PathBuf {
        self.store_dir().join(format!("{name}.json"))
    }

    /// Default AppArmor profile path.
    #[must_use]
    pub fn apparmor_profile(&self) -> PathBuf {
        self.root.join("lsm").join("apparmor").join("raind-default")
    }

    /// PKI material directory (client CA and server identity).
    #[must_use]
    pub fn pki(&self) -> PathBuf {
        self.root.join("pki")
    }

    /// Create the directories the daemon expects to exist.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.image_layers())?;
        std::fs::create_dir_all(self.store_dir())?;
        std::fs::create_dir_all(self.pki())?;
        Ok(())
    }
}

impl Default for RaindPaths {
    fn default() -> Self {
        Self {
            root: RAIND_ROOT.clone(),
            cgroup_root: RAIND_CGROUP_ROOT.clone(),
        }
    }
}

/// Append a suffix to a path's file name (`csm.json` -> `csm.json.lock`).
#[must_use]
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = RaindPaths::with_root("/tmp/raind-test");
        assert_eq!(
            paths.container("abc"),
            PathBuf::from("/tmp/raind-test/container/abc")
        );
        assert_eq!(
            paths.container_cgroup("abc"),
            PathBuf::from("/tmp/raind-test/cgroup/abc")
        );
        assert_eq!(
            paths.store(stores::CONTAINERS),
            PathBuf::from("/tmp/raind-test/store/csm.json")
        );
    }

    #[test]
    fn image_bundle_uses_repository_leaf() {
        let paths = RaindPaths::with_root("/r");
        assert_eq!(
            paths.image_bundle("library/nginx", "latest"),
            PathBuf::from("/r/image/layers/nginx/latest")
        );
        assert_eq!(
            paths.image_bundle("library/x", "sha256:ab"),
            PathBuf::from("/r/image/layers/x/sha256_ab")
        );
    }

    #[test]
    fn suffix_appends_to_file_name() {
        assert_eq!(
            with_suffix(Path::new("/s/npm.json"), ".running"),
            PathBuf::from("/s/npm.json.running")
        );
    }
}
