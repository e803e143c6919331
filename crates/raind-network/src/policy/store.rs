//! Policy store (NPM) with backup and revert.

use std::fs;
use std::path::{Path, PathBuf};

use raind_common::fs::{atomic_write, remove_file_if_exists, write_json_atomic};
use raind_common::id::entity_id;
use raind_common::paths::with_suffix;
use raind_common::{JsonStore, RaindError, RaindResult};

use super::model::{
    Defaults, NorthSouthMode, Policy, PolicyDocument, PolicyKind, PolicyRequest, PolicyStatus,
};

/// Result of applying one policy during a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Policy id.
    pub id: String,
    /// New status.
    pub status: PolicyStatus,
    /// Reason for [`PolicyStatus::Unresolved`].
    pub reason: Option<String>,
}

/// File-backed policy store.
#[derive(Debug)]
pub struct PolicyStore {
    store: JsonStore<PolicyDocument>,
}

impl PolicyStore {
    /// Open the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Path of the committed copy.
    #[must_use]
    pub fn running_path(&self) -> PathBuf {
        with_suffix(self.store.path(), ".running")
    }

    /// Validate and add a policy in `before_commit` state.
    ///
    /// # Errors
    ///
    /// Returns validation or store errors.
    pub fn add(&self, request: PolicyRequest) -> RaindResult<Policy> {
        request.validate()?;
        let kind = request.kind;
        let policy = request.into_policy(entity_id());
        self.store.update(|doc| {
            doc.policies.list_mut(kind).push(policy.clone());
            Ok(())
        })?;
        tracing::debug!(id = %policy.id, kind = %kind, "Policy added");
        Ok(policy)
    }

    /// Remove a policy. Applied policies are marked for removal at the next
    /// commit; others are dropped at once.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn remove(&self, id: &str) -> RaindResult<()> {
        self.store.update(|doc| {
            let policy = doc
                .policies
                .find_mut(id)
                .ok_or_else(|| RaindError::not_found("policy", id))?;
            match policy.status {
                PolicyStatus::Applied | PolicyStatus::RemoveNextCommit => {
                    policy.status = PolicyStatus::RemoveNextCommit;
                }
                PolicyStatus::BeforeCommit | PolicyStatus::Unresolved => {
                    doc.policies.retain(|policy| policy.id != id);
                }
            }
            Ok(())
        })
    }

    /// Policies of one kind.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self, kind: PolicyKind) -> RaindResult<Vec<Policy>> {
        self.store.read(|doc| Ok(doc.policies.list(kind).clone()))
    }

    /// One policy and its kind.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn get(&self, id: &str) -> RaindResult<(PolicyKind, Policy)> {
        self.store.read(|doc| {
            doc.policies
                .find(id)
                .map(|(kind, policy)| (kind, policy.clone()))
                .ok_or_else(|| RaindError::not_found("policy", id))
        })
    }

    /// Current defaults.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn defaults(&self) -> RaindResult<Defaults> {
        self.store.read(|doc| Ok(doc.defaults))
    }

    /// Set the north-south mode.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn set_north_south_mode(&self, mode: NorthSouthMode) -> RaindResult<()> {
        self.store.update(|doc| {
            doc.defaults.north_south.mode = mode;
            Ok(())
        })
    }

    /// Turn NFLOG logging of the default verdicts on or off.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn set_logging(&self, east_west: bool, north_south: bool) -> RaindResult<()> {
        self.store.update(|doc| {
            doc.defaults.east_west.logging = east_west;
            doc.defaults.north_south.logging = north_south;
            Ok(())
        })
    }

    /// Clone of the whole document.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn snapshot(&self) -> RaindResult<PolicyDocument> {
        self.store.snapshot()
    }

    /// Write commit outcomes back and drop policies pending removal.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn record(&self, outcomes: &[Outcome]) -> RaindResult<()> {
        self.store.update(|doc| {
            for outcome in outcomes {
                if let Some(policy) = doc.policies.find_mut(&outcome.id) {
                    policy.status = outcome.status;
                    policy.reason.clone_from(&outcome.reason);
                }
            }
            doc.policies
                .retain(|policy| policy.status != PolicyStatus::RemoveNextCommit);
            Ok(())
        })
    }

    /// Reset pending edits of the current document, see
    /// [`PolicyDocument::restore_committed`].
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn restore_committed(&self) -> RaindResult<PolicyDocument> {
        self.store.update(|doc| {
            doc.restore_committed();
            Ok(doc.clone())
        })
    }

    /// Copy the current document to `<path>.running`.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn backup(&self) -> RaindResult<()> {
        self.store.with_file_lock(copy_to_running)
    }

    /// Swap the current document with `<path>.running`.
    ///
    /// The current file is parked as `<path>.org`, the running copy takes its
    /// place, a fresh backup is taken and `.org` is removed. An interrupted
    /// revert is finished by the next one.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when nothing was committed yet.
    pub fn revert(&self) -> RaindResult<()> {
        self.store.with_file_lock(|path| {
            let running = with_suffix(path, ".running");
            let org = with_suffix(path, ".org");

            if !path.exists() && org.exists() {
                tracing::warn!(path = %org.display(), "Restoring policy store from interrupted revert");
                fs::rename(&org, path)?;
            }
            if !running.exists() {
                return Err(RaindError::not_found(
                    "committed policy state",
                    running.display().to_string(),
                ));
            }

            if path.exists() {
                fs::rename(path, &org)?;
            }
            fs::rename(&running, path)?;
            copy_to_running(path)?;
            remove_file_if_exists(&org)?;
            tracing::info!(path = %path.display(), "Policy store reverted");
            Ok(())
        })
    }
}

fn copy_to_running(path: &Path) -> RaindResult<()> {
    let running = with_suffix(path, ".running");
    match fs::read(path) {
        Ok(bytes) => atomic_write(&running, &bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            write_json_atomic(&running, &PolicyDocument::default())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::policy::model::Endpoint;
    use crate::portmap::Protocol;

    fn store() -> (TempDir, PolicyStore) {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(dir.path().join("npm.json"));
        (dir, store)
    }

    fn request(src: &str, dst: &str) -> PolicyRequest {
        PolicyRequest {
            kind: PolicyKind::EastWest,
            source: Endpoint::container(src),
            destination: Endpoint::container(dst),
            protocol: Some(Protocol::Tcp),
            dport: None,
            comment: None,
        }
    }

    #[test]
    fn remove_depends_on_status() {
        let (_dir, store) = store();
        let pending = store.add(request("a", "b")).unwrap();
        let applied = store.add(request("c", "d")).unwrap();
        store
            .record(&[Outcome {
                id: applied.id.clone(),
                status: PolicyStatus::Applied,
                reason: None,
            }])
            .unwrap();

        store.remove(&pending.id).unwrap();
        store.remove(&applied.id).unwrap();

        let list = store.list(PolicyKind::EastWest).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, PolicyStatus::RemoveNextCommit);
        assert!(store.remove("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn record_drops_pending_removals() {
        let (_dir, store) = store();
        let policy = store.add(request("a", "b")).unwrap();
        store
            .record(&[Outcome {
                id: policy.id.clone(),
                status: PolicyStatus::RemoveNextCommit,
                reason: None,
            }])
            .unwrap();
        assert!(store.get(&policy.id).unwrap_err().is_not_found());
    }

    #[test]
    fn revert_swaps_with_running_copy() {
        let (dir, store) = store();
        let first = store.add(request("a", "b")).unwrap();
        store.backup().unwrap();
        store.add(request("c", "d")).unwrap();

        store.revert().unwrap();
        let list = store.list(PolicyKind::EastWest).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, first.id);
        assert!(store.running_path().exists());
        assert!(!dir.path().join("npm.json.org").exists());
    }

    #[test]
    fn revert_without_backup_fails() {
        let (_dir, store) = store();
        store.add(request("a", "b")).unwrap();
        assert!(store.revert().unwrap_err().is_not_found());
        assert_eq!(store.list(PolicyKind::EastWest).unwrap().len(), 1);
    }

    #[test]
    fn mode_change_persists() {
        let (_dir, store) = store();
        store.set_north_south_mode(NorthSouthMode::Enforce).unwrap();
        assert_eq!(store.defaults().unwrap().north_south.mode, NorthSouthMode::Enforce);
    }
}
