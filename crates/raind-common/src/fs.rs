//! Filesystem primitives: atomic replace and advisory locking.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;

use crate::error::RaindResult;
use crate::paths::with_suffix;

/// Replace `path` with `data` so that readers see either the old or the new
/// content, never a torn write.
///
/// The data goes to `<path>.tmp`, is fsynced, then renamed over `path`.
///
/// # Errors
///
/// Returns an error if any filesystem step fails; the previous file is left
/// untouched in that case.
pub fn atomic_write(path: &Path, data: &[u8]) -> RaindResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = with_suffix(path, ".tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and [`atomic_write`] it.
///
/// # Errors
///
/// Returns an error on serialization or I/O failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> RaindResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data)
}

/// Remove a directory tree, treating "already gone" as success.
///
/// # Errors
///
/// Returns any error other than `NotFound`.
pub fn remove_dir_all_if_exists(path: &Path) -> RaindResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Remove a file, treating "already gone" as success.
///
/// # Errors
///
/// Returns any error other than `NotFound`.
pub fn remove_file_if_exists(path: &Path) -> RaindResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// A held POSIX advisory lock on a lockfile. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lockfile cannot be opened or locked.
    pub fn exclusive(path: &Path) -> RaindResult<Self> {
        let file = Self::open(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Block until a shared lock on `path` is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lockfile cannot be opened or locked.
    pub fn shared(path: &Path) -> RaindResult<Self> {
        let file = Self::open(path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The lockfile path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> RaindResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to release file lock");
        }
    }
}
