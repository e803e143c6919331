//! Container lifecycle engine.
//!
//! Create runs a fixed pipeline. Each step that leaves host state behind sets
//! a flag in [`RollbackFlags`]; when a later step fails, exactly the flagged
//! steps are undone in reverse order.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use raind_common::fs::remove_dir_all_if_exists;
use raind_common::id::generate_unique_name;
use raind_common::paths::CONTAINER_SUBDIRS;
use raind_common::{ContainerId, RaindError, RaindResult};
use raind_image::{ImageManager, ImageReference};
use raind_network::{Forward, IpamStore, PortForwarder};
use raind_oci::ContainerStatus;
use raind_oci::runtime::Mount;
use serde::{Deserialize, Serialize};

use super::config::RuntimeConfig;
use super::events::{ContainerEvent, EventBus, now};
use super::lifecycle::OciRuntime;
use super::spec::{self, NetworkPlan, SharedNamespaces, SpecInputs};
use super::state::{ContainerRecord, ContainerStore};
use crate::cgroup::CgroupManager;

/// Poll interval while waiting for hook-driven state changes.
const STATE_POLL: Duration = Duration::from_millis(50);

/// A container create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    /// Image reference.
    pub image: String,
    /// Command overriding the image's entrypoint and cmd.
    pub command: Option<Vec<String>>,
    /// Port forwards, `host:container[:proto]`.
    pub port: Vec<String>,
    /// Bind mounts, `source:destination[:ro|rw]`.
    pub mount: Vec<String>,
    /// Bridge to attach to.
    pub network: Option<String>,
    /// Allocate a terminal.
    pub tty: bool,
    /// Extra environment, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Container name; generated when absent.
    pub name: Option<String>,
    /// Owning bottle.
    pub bottle_id: Option<String>,
    /// Owning pod.
    pub pod_id: Option<String>,
    /// Join these namespaces instead of getting a network of its own.
    #[serde(skip)]
    pub shared: Option<SharedNamespaces>,
}

impl CreateRequest {
    /// A request for `image` with everything else defaulted.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

/// Undo steps armed during create.
#[derive(Debug, Default)]
struct RollbackFlags {
    release_address: bool,
    delete_record: bool,
    remove_directory: bool,
    remove_cgroup: bool,
    remove_forwards: Option<(Ipv4Addr, Vec<Forward>)>,
}

/// Drives containers through their lifecycle.
pub struct ContainerEngine {
    config: RuntimeConfig,
    store: Arc<ContainerStore>,
    images: Arc<ImageManager>,
    ipam: Arc<IpamStore>,
    forwarder: PortForwarder,
    runtime: Arc<dyn OciRuntime>,
    cgroups: CgroupManager,
    events: EventBus,
}

impl ContainerEngine {
    /// Create an engine.
    pub fn new(
        config: RuntimeConfig,
        store: Arc<ContainerStore>,
        images: Arc<ImageManager>,
        ipam: Arc<IpamStore>,
        forwarder: PortForwarder,
        runtime: Arc<dyn OciRuntime>,
        events: EventBus,
    ) -> Self {
        let cgroups = CgroupManager::new(config.paths.cgroup_root.clone());
        Self {
            config,
            store,
            images,
            ipam,
            forwarder,
            runtime,
            cgroups,
            events,
        }
    }

    /// The container store.
    #[must_use]
    pub const fn store(&self) -> &Arc<ContainerStore> {
        &self.store
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a container.
    ///
    /// # Errors
    ///
    /// Returns validation errors before any state is touched, otherwise the
    /// failing step's error after rollback, or
    /// [`RaindError::RollbackFailed`] when undoing failed too.
    pub async fn create(&self, request: CreateRequest) -> RaindResult<ContainerRecord> {
        let id = ContainerId::generate().to_string();
        let name = self.choose_name(request.name.as_deref())?;

        let image = ImageReference::parse(&request.image)?;
        let forwards = request
            .port
            .iter()
            .map(|port| port.parse::<Forward>())
            .collect::<RaindResult<Vec<_>>>()?;
        let mounts = request
            .mount
            .iter()
            .map(|mount| mount.parse::<Mount>())
            .collect::<RaindResult<Vec<_>>>()?;
        if request.shared.is_some() && !forwards.is_empty() {
            return Err(RaindError::validation(
                "port forward",
                "containers sharing a network namespace cannot forward ports",
            ));
        }

        tracing::info!(container_id = %id, name = %name, image = %image, "Creating container");
        let image_record = self.images.ensure(&image).await?;
        let execution = self.images.config(&image_record)?.execution();
        let command = execution.command(request.command.as_deref().unwrap_or_default());
        if command.is_empty() {
            return Err(RaindError::validation(
                "command",
                format!("image {image} defines no command and none was given"),
            ));
        }

        let mut flags = RollbackFlags::default();
        let provisioned = async {
            // 5. address
            let network = match request.shared {
                Some(shared) => NetworkPlan::Shared(shared),
                None => {
                    let bridge = request
                        .network
                        .as_deref()
                        .unwrap_or(&self.config.default_bridge);
                    let assignment = self.ipam.allocate(bridge, &id)?;
                    flags.release_address = true;
                    NetworkPlan::Attached(assignment)
                }
            };

            // 6. record
            let mut record = ContainerRecord::creating(
                &id,
                &name,
                &image.repository,
                image.reference(),
                command.clone(),
                self.config.paths.container_log(&id),
            );
            record.tty = request.tty;
            record.bottle_id.clone_from(&request.bottle_id);
            record.pod_id.clone_from(&request.pod_id);
            self.store.insert(record)?;
            flags.delete_record = true;

            // 7. directory
            flags.remove_directory = true;
            self.prepare_directory(&id, &network)?;

            // 8. cgroup
            flags.remove_cgroup = true;
            self.cgroups.create(&id)?;

            // 9. runtime spec
            let inputs = SpecInputs {
                id: &id,
                name: &name,
                rootfs: &image_record.rootfs_path,
                command: command.clone(),
                env: execution.environment(&request.env),
                cwd: execution.cwd(),
                user: execution.user.clone().unwrap_or_default(),
                tty: request.tty,
                mounts,
                network: &network,
                pod_id: request.pod_id.as_deref(),
            };
            spec::write(&self.config.paths, &id, &spec::build(&self.config, &inputs))?;

            // 10. port forwards
            if let NetworkPlan::Attached(assignment) = &network {
                if !forwards.is_empty() {
                    self.forwarder
                        .install(&id, assignment.address, &forwards)
                        .await?;
                    flags.remove_forwards = Some((assignment.address, forwards.clone()));
                    self.ipam.add_forwards(&id, &forwards)?;
                }
            }

            // 11. runtime
            self.runtime.create(&id, request.tty).await
        }
        .await;

        if let Err(err) = provisioned {
            return Err(self.roll_back(&id, flags, err).await);
        }

        self.events.publish(ContainerEvent::Creating {
            id: id.clone(),
            timestamp: now(),
        });
        tracing::info!(container_id = %id, name = %name, "Container created");
        self.store.get(&id)
    }

    fn choose_name(&self, requested: Option<&str>) -> RaindResult<String> {
        match requested {
            Some(name) => {
                if name.is_empty() {
                    return Err(RaindError::validation("container name", "empty name"));
                }
                if self.store.is_name_already_used(name)? {
                    return Err(RaindError::AlreadyUsed {
                        kind: "container",
                        name: name.to_string(),
                    });
                }
                Ok(name.to_string())
            }
            None => generate_unique_name(|candidate| self.store.is_name_already_used(candidate)),
        }
    }

    fn prepare_directory(&self, id: &str, network: &NetworkPlan) -> RaindResult<()> {
        let paths = &self.config.paths;
        for subdir in CONTAINER_SUBDIRS {
            std::fs::create_dir_all(paths.container_subdir(id, subdir))?;
        }
        let gateway = match network {
            NetworkPlan::Attached(assignment) => Some(assignment.gateway),
            NetworkPlan::Shared(_) => None,
        };
        spec::seed_etc(
            &paths.container_subdir(id, "etc"),
            id,
            network.address(),
            gateway,
            &self.config.dns,
        )
    }

    async fn roll_back(&self, id: &str, flags: RollbackFlags, original: RaindError) -> RaindError {
        tracing::warn!(container_id = %id, error = %original, "Create failed, rolling back");
        let mut failures: Vec<String> = Vec::new();

        if let Some((address, forwards)) = &flags.remove_forwards {
            if let Err(err) = self.forwarder.remove(id, *address, forwards).await {
                failures.push(format!("remove port forwards: {err}"));
            }
        }
        if flags.remove_cgroup {
            if let Err(err) = self.cgroups.remove(id) {
                failures.push(format!("remove cgroup: {err}"));
            }
        }
        if flags.remove_directory {
            if let Err(err) = remove_dir_all_if_exists(&self.config.paths.container(id)) {
                failures.push(format!("remove container directory: {err}"));
            }
        }
        if flags.delete_record {
            if let Err(err) = self.store.remove(id) {
                failures.push(format!("delete container record: {err}"));
            }
        }
        if flags.release_address {
            if let Err(err) = self.ipam.release(id) {
                failures.push(format!("release address: {err}"));
            }
        }

        if failures.is_empty() {
            original
        } else {
            tracing::warn!(container_id = %id, failures = ?failures, "Rollback incomplete");
            RaindError::RollbackFailed {
                message: failures.join("; "),
                original: original.to_string(),
            }
        }
    }

    /// Start a created or stopped container.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Conflict`] when already running,
    /// [`RaindError::InvalidState`] while creating, or runtime errors.
    pub async fn start(&self, name_or_id: &str) -> RaindResult<ContainerRecord> {
        let record = self.store.resolve(name_or_id)?;
        let id = record.container_id.as_str();
        match record.state {
            ContainerStatus::Created => self.runtime.start(id).await?,
            ContainerStatus::Stopped => {
                tracing::debug!(container_id = %id, "Recreating stopped container");
                self.runtime.create(id, record.tty).await?;
                self.runtime.start(id).await?;
            }
            ContainerStatus::Running => {
                return Err(RaindError::Conflict {
                    message: format!("container {} already started", record.name),
                });
            }
            ContainerStatus::Creating => return Err(invalid_state(&record, "start")),
        }
        tracing::info!(container_id = %id, name = %record.name, "Container started");
        self.store.get(id)
    }

    /// Point a pod member at the namespaces of `shared` before it starts
    /// again. A created member that already joined stale namespaces is
    /// stopped so that the next start recreates it.
    ///
    /// # Errors
    ///
    /// Returns I/O errors rewriting the runtime spec, or runtime errors.
    pub async fn rejoin(&self, id: &str, shared: &SharedNamespaces) -> RaindResult<()> {
        let record = self.store.get(id)?;
        if record.state == ContainerStatus::Running
            || !spec::rejoin(&self.config.paths, id, shared)?
        {
            return Ok(());
        }
        tracing::info!(container_id = %id, pid = shared.pid, "Member rejoined infra namespaces");
        if record.state == ContainerStatus::Created {
            self.runtime.kill(id).await?;
            self.wait_for(id, ContainerStatus::Stopped).await?;
        }
        Ok(())
    }

    /// Stop a running container.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::InvalidState`] unless running, or runtime errors.
    pub async fn stop(&self, name_or_id: &str) -> RaindResult<ContainerRecord> {
        let record = self.store.resolve(name_or_id)?;
        if !record.state.can_stop() {
            return Err(invalid_state(&record, "stop"));
        }
        let id = record.container_id.as_str();
        self.store.update(id, |record| {
            record.stopped_at = Some(chrono::Utc::now());
            Ok(())
        })?;
        self.runtime.kill(id).await?;
        tracing::info!(container_id = %id, name = %record.name, "Container stop requested");
        self.store.get(id)
    }

    /// Delete a container that is not running, releasing everything it holds.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::InvalidState`] while running, or the failing
    /// cleanup step.
    pub async fn delete(&self, name_or_id: &str) -> RaindResult<()> {
        let record = self.store.resolve(name_or_id)?;
        if !record.state.can_delete() {
            return Err(invalid_state(&record, "delete"));
        }
        let id = record.container_id.as_str();

        if let Err(err) = self.runtime.delete(id).await {
            if record.state == ContainerStatus::Creating {
                tracing::warn!(container_id = %id, error = %err, "Runtime delete failed for container still creating");
            } else {
                return Err(err);
            }
        }

        self.remove_forwards(id).await?;
        self.ipam.release(id)?;
        remove_dir_all_if_exists(&self.config.paths.container(id))?;
        self.cgroups.remove(id)?;
        if self.store.remove(id)?.is_some() {
            self.events.publish(ContainerEvent::Deleted {
                id: id.to_string(),
                timestamp: now(),
            });
        }
        tracing::info!(container_id = %id, name = %record.name, "Container deleted");
        Ok(())
    }

    async fn remove_forwards(&self, id: &str) -> RaindResult<()> {
        let assignment = match self.ipam.lookup(id) {
            Ok(assignment) => assignment,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let forwards = self.ipam.take_forwards(id)?;
        if forwards.is_empty() {
            return Ok(());
        }
        if let Err(err) = self
            .forwarder
            .remove(id, assignment.address, &forwards)
            .await
        {
            self.ipam.add_forwards(id, &forwards)?;
            return Err(err);
        }
        Ok(())
    }

    /// Run a command in a running container.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::InvalidState`] unless running, or runtime errors.
    pub async fn exec(&self, name_or_id: &str, command: &[String], tty: bool) -> RaindResult<String> {
        let record = self.store.resolve(name_or_id)?;
        if !record.state.can_exec() {
            return Err(invalid_state(&record, "exec"));
        }
        if command.is_empty() {
            return Err(RaindError::validation("command", "empty command"));
        }
        self.runtime.exec(&record.container_id, tty, command).await
    }

    /// All containers.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<ContainerRecord>> {
        self.store.list()
    }

    /// One container by name or id.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown containers.
    pub fn get(&self, name_or_id: &str) -> RaindResult<ContainerRecord> {
        self.store.resolve(name_or_id)
    }

    /// Address of a container with its own network.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when the container holds no address.
    pub fn address(&self, id: &str) -> RaindResult<Ipv4Addr> {
        Ok(self.ipam.lookup(id)?.address)
    }

    /// Wait until the container reaches `state`; a vanished record counts as
    /// [`ContainerStatus::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Timeout`] after the configured state timeout.
    pub async fn wait_for(&self, id: &str, state: ContainerStatus) -> RaindResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.state_timeout;
        loop {
            match self.store.get(id) {
                Ok(record) if record.state == state => return Ok(()),
                Ok(_) => {}
                Err(err) if err.is_not_found() && state == ContainerStatus::Stopped => return Ok(()),
                Err(err) => return Err(err),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RaindError::Timeout {
                    operation: format!("container {id} to become {state}"),
                });
            }
            tokio::time::sleep(STATE_POLL).await;
        }
    }
}

fn invalid_state(record: &ContainerRecord, operation: &'static str) -> RaindError {
    RaindError::InvalidState {
        kind: "container",
        id: record.container_id.clone(),
        state: record.state.to_string(),
        operation,
    }
}
