//! Crash-consistent JSON document store.
//!
//! Every store in raind is a single JSON document guarded by a process-local
//! mutex and an advisory lock on `<path>.lock`. Mutations read the current
//! document, apply a closure and atomically replace the file, so mutations on
//! one store are totally ordered across threads and processes.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RaindResult;
use crate::fs::{FileLock, write_json_atomic};
use crate::paths::with_suffix;

/// A document persisted by a [`JsonStore`].
pub trait Document: Default + Serialize + DeserializeOwned {
    /// Schema version stamped into freshly initialized documents.
    const VERSION: &'static str;
}

/// A file-backed, lock-protected JSON document.
#[derive(Debug)]
pub struct JsonStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
    _document: PhantomData<fn() -> T>,
}

impl<T: Document> JsonStore<T> {
    /// Open a store at `path`. The file is created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = with_suffix(&path, ".lock");
        Self {
            path,
            lock_path,
            guard: Mutex::new(()),
            _document: PhantomData,
        }
    }

    /// Path of the JSON document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current document under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns lock, read or parse errors, or whatever `f` returns.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> RaindResult<R>) -> RaindResult<R> {
        let _guard = self.guard.lock();
        let _lock = FileLock::shared(&self.lock_path)?;
        let document = self.load()?;
        f(&document)
    }

    /// Run `f` against the current document under an exclusive lock and
    /// persist the result if `f` succeeds.
    ///
    /// # Errors
    ///
    /// Returns lock, read, parse or write errors, or whatever `f` returns. A
    /// failing `f` leaves the file untouched.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> RaindResult<R>) -> RaindResult<R> {
        let _guard = self.guard.lock();
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut document = self.load()?;
        let result = f(&mut document)?;
        write_json_atomic(&self.path, &document)?;
        Ok(result)
    }

    /// Run raw file operations on the store path under the exclusive lock.
    ///
    /// Used for whole-file manipulations such as backup and revert.
    ///
    /// # Errors
    ///
    /// Returns lock errors or whatever `f` returns.
    pub fn with_file_lock<R>(&self, f: impl FnOnce(&Path) -> RaindResult<R>) -> RaindResult<R> {
        let _guard = self.guard.lock();
        let _lock = FileLock::exclusive(&self.lock_path)?;
        f(&self.path)
    }

    /// Clone of the current document.
    ///
    /// # Errors
    ///
    /// Returns lock, read or parse errors.
    pub fn snapshot(&self) -> RaindResult<T>
    where
        T: Clone,
    {
        self.read(|document| Ok(document.clone()))
    }

    fn load(&self) -> RaindResult<T> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(T::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err.into()),
        }
    }
}
