//! Container state manager (CSM).
//!
//! One JSON document keyed by container id. Names are unique among the
//! entries the store holds; an entry disappears once the container is
//! deleted, which frees its name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use raind_common::{Document, JsonStore, RaindError, RaindResult};
use raind_network::ContainerResolver;
use raind_oci::ContainerStatus;
use serde::{Deserialize, Serialize};

/// A container as recorded by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// 12-character sortable id.
    pub container_id: String,
    /// Unique name.
    pub name: String,
    /// Lifecycle state.
    pub state: ContainerStatus,
    /// Init process id, 0 when there is none.
    #[serde(default)]
    pub pid: u32,
    /// Normalized image repository.
    pub image_repository: String,
    /// Image tag or digest.
    pub image_reference: String,
    /// Effective command line.
    pub command: Vec<String>,
    /// Terminal allocated.
    #[serde(default)]
    pub tty: bool,
    /// Owning bottle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottle_id: Option<String>,
    /// Owning pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,
    /// SPIFFE id of the issued client certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spiffe_id: Option<String>,
    /// Console log.
    pub log_path: PathBuf,
    /// Create accepted.
    pub creating_at: DateTime<Utc>,
    /// Runtime environment created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Process started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Stop requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Process observed gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Short reason for the last state change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ContainerRecord {
    /// A fresh record in state `creating`.
    #[must_use]
    pub fn creating(
        container_id: impl Into<String>,
        name: impl Into<String>,
        image_repository: impl Into<String>,
        image_reference: impl Into<String>,
        command: Vec<String>,
        log_path: PathBuf,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            name: name.into(),
            state: ContainerStatus::Creating,
            pid: 0,
            image_repository: image_repository.into(),
            image_reference: image_reference.into(),
            command,
            tty: false,
            bottle_id: None,
            pod_id: None,
            spiffe_id: None,
            log_path,
            creating_at: Utc::now(),
            created_at: None,
            started_at: None,
            stopped_at: None,
            finished_at: None,
            exit_code: None,
            reason: None,
            message: None,
        }
    }

    /// Apply a validated state change and stamp the matching timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::InvalidState`] for an illegal edge.
    pub fn transition(&mut self, next: ContainerStatus, pid: Option<u32>) -> RaindResult<()> {
        self.state = self.state.transition(&self.container_id, next)?;
        let now = Utc::now();
        match next {
            ContainerStatus::Creating => {}
            ContainerStatus::Created => {
                self.created_at = Some(now);
                self.finished_at = None;
                self.exit_code = None;
            }
            ContainerStatus::Running => self.started_at = Some(now),
            ContainerStatus::Stopped => {
                self.stopped_at.get_or_insert(now);
                self.finished_at = Some(now);
                self.pid = 0;
            }
        }
        if let Some(pid) = pid {
            self.pid = pid;
        }
        Ok(())
    }
}

/// The CSM document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDocument {
    /// Schema version.
    pub version: String,
    /// Containers by id.
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerRecord>,
}

impl Default for ContainerDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            containers: BTreeMap::new(),
        }
    }
}

impl Document for ContainerDocument {
    const VERSION: &'static str = "1";
}

impl ContainerDocument {
    fn by_name(&self, name: &str) -> Option<&ContainerRecord> {
        self.containers.values().find(|record| record.name == name)
    }

    fn resolve(&self, name_or_id: &str) -> Option<&ContainerRecord> {
        self.containers
            .get(name_or_id)
            .or_else(|| self.by_name(name_or_id))
    }
}

/// File-backed container store.
#[derive(Debug)]
pub struct ContainerStore {
    store: JsonStore<ContainerDocument>,
}

impl ContainerStore {
    /// Open the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::AlreadyUsed`] when the name is taken and
    /// [`RaindError::Conflict`] when the id exists.
    pub fn insert(&self, record: ContainerRecord) -> RaindResult<()> {
        self.store.update(|doc| {
            if doc.by_name(&record.name).is_some() {
                return Err(RaindError::AlreadyUsed {
                    kind: "container",
                    name: record.name.clone(),
                });
            }
            if doc.containers.contains_key(&record.container_id) {
                return Err(RaindError::Conflict {
                    message: format!("container id {} already exists", record.container_id),
                });
            }
            tracing::debug!(container_id = %record.container_id, name = %record.name, "Container recorded");
            doc.containers.insert(record.container_id.clone(), record);
            Ok(())
        })
    }

    /// Whether a live container carries `name`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn is_name_already_used(&self, name: &str) -> RaindResult<bool> {
        self.store.read(|doc| Ok(doc.by_name(name).is_some()))
    }

    /// Record by id.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn get(&self, id: &str) -> RaindResult<ContainerRecord> {
        self.store.read(|doc| {
            doc.containers
                .get(id)
                .cloned()
                .ok_or_else(|| RaindError::not_found("container", id))
        })
    }

    /// Record by id, falling back to name.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when neither matches.
    pub fn resolve(&self, name_or_id: &str) -> RaindResult<ContainerRecord> {
        self.store.read(|doc| {
            doc.resolve(name_or_id)
                .cloned()
                .ok_or_else(|| RaindError::not_found("container", name_or_id))
        })
    }

    /// Id of the container called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown names.
    pub fn resolve_container_id(&self, name: &str) -> RaindResult<String> {
        self.store.read(|doc| {
            doc.by_name(name)
                .map(|record| record.container_id.clone())
                .ok_or_else(|| RaindError::not_found("container", name))
        })
    }

    /// All records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<ContainerRecord>> {
        self.store
            .read(|doc| Ok(doc.containers.values().cloned().collect()))
    }

    /// Records owned by `pod_id`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list_by_pod(&self, pod_id: &str) -> RaindResult<Vec<ContainerRecord>> {
        self.store.read(|doc| {
            Ok(doc
                .containers
                .values()
                .filter(|record| record.pod_id.as_deref() == Some(pod_id))
                .cloned()
                .collect())
        })
    }

    /// Mutate one record.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids or the closure's error,
    /// in which case nothing is written.
    pub fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContainerRecord) -> RaindResult<R>,
    ) -> RaindResult<R> {
        self.store.update(|doc| {
            let record = doc
                .containers
                .get_mut(id)
                .ok_or_else(|| RaindError::not_found("container", id))?;
            f(record)
        })
    }

    /// Move a container along a legal edge of its state machine.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] or [`RaindError::InvalidState`].
    pub fn transition(
        &self,
        id: &str,
        next: ContainerStatus,
        pid: Option<u32>,
    ) -> RaindResult<ContainerRecord> {
        self.update(id, |record| {
            let previous = record.state;
            record.transition(next, pid)?;
            if previous != next {
                tracing::debug!(container_id = %id, from = %previous, to = %next, pid = record.pid, "Container state changed");
            }
            Ok(record.clone())
        })
    }

    /// Drop a record, returning it when it existed.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn remove(&self, id: &str) -> RaindResult<Option<ContainerRecord>> {
        self.store.update(|doc| Ok(doc.containers.remove(id)))
    }
}

impl ContainerResolver for ContainerStore {
    fn container_id(&self, name: &str) -> RaindResult<String> {
        self.resolve_container_id(name)
    }
}
