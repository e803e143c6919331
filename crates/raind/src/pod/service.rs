//! Pod operations.
//!
//! A pod is an infra container holding the shared namespaces plus one member
//! container per template entry. Members are created against the infra init
//! process, so the infra container always exists before them.

use std::sync::Arc;

use chrono::Utc;
use raind_common::{RaindError, RaindResult};
use raind_oci::ContainerStatus;
use raind_oci::runtime::NamespaceType;
use serde::Serialize;

use super::model::{Manifest, Pod, PodSpec, PodState, ReplicaSet, ReplicaSetSpec};
use super::store::PodStore;
use crate::runtime::{ContainerEngine, ContainerRecord, CreateRequest, SharedNamespaces};

/// Observed state of a pod's infra container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraState {
    /// No infra container.
    Missing,
    /// Infra init process running.
    Running,
    /// Infra container exists but is not running.
    Stopped,
}

/// Result of applying a manifest.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Applied {
    /// A pod was created and started.
    Pod(Pod),
    /// A replica set was registered.
    ReplicaSet(ReplicaSet),
}

/// Pod lifecycle on top of the container engine.
pub struct PodService {
    engine: Arc<ContainerEngine>,
    store: Arc<PodStore>,
}

impl PodService {
    /// Create the service.
    pub const fn new(engine: Arc<ContainerEngine>, store: Arc<PodStore>) -> Self {
        Self { engine, store }
    }

    /// The pod store.
    #[must_use]
    pub const fn store(&self) -> &Arc<PodStore> {
        &self.store
    }

    /// Apply a decoded manifest.
    ///
    /// A pod manifest registers a template, creates the pod bound to it and
    /// starts it. A replica set manifest registers the template and the
    /// replica set; the reconciler creates the pods.
    ///
    /// # Errors
    ///
    /// Returns validation, name and container errors.
    pub async fn apply(&self, manifest: Manifest) -> RaindResult<Applied> {
        match manifest {
            Manifest::Pod(spec) => self.run(spec).await.map(Applied::Pod),
            Manifest::ReplicaSet {
                name,
                replicas,
                template,
            } => {
                let template = self.store.put_template(template)?;
                let replicaset = self.store.put_replicaset(ReplicaSetSpec {
                    name,
                    template_id: template.template_id,
                    replicas,
                });
                if replicaset.is_err() {
                    self.store.collect_templates()?;
                }
                let replicaset = replicaset?;
                tracing::info!(
                    replicaset_id = %replicaset.replicaset_id,
                    name = %replicaset.spec.name,
                    replicas = replicaset.spec.replicas,
                    "Replica set registered"
                );
                Ok(Applied::ReplicaSet(replicaset))
            }
        }
    }

    /// Record a pod in state `created`.
    ///
    /// # Errors
    ///
    /// Returns validation errors and [`RaindError::AlreadyUsed`].
    pub fn create(&self, spec: &PodSpec, template_id: Option<&str>) -> RaindResult<Pod> {
        if spec.name.is_empty() {
            return Err(RaindError::validation("pod", "name is empty"));
        }
        if let Some(template_id) = template_id {
            self.store.template(template_id)?;
        }
        let pod = self.store.create_pod(spec, template_id)?;
        tracing::info!(pod_id = %pod.pod_id, name = %pod.name, namespace = %pod.namespace, "Pod created");
        Ok(pod)
    }

    /// Record a pod from a template under a generated name.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown templates.
    pub fn create_from_template(&self, template_id: &str) -> RaindResult<Pod> {
        let template = self.store.template(template_id)?;
        let mut spec = template.spec;
        let base = spec.name.clone();
        loop {
            let candidate = format!("{base}-{}", &uuid::Uuid::new_v4().simple().to_string()[..5]);
            if !self.store.is_name_already_used(&candidate, &spec.namespace)? {
                spec.name = candidate;
                break;
            }
        }
        self.create(&spec, Some(template_id))
    }

    /// Register `spec` as a template, create a pod bound to it and start it.
    ///
    /// # Errors
    ///
    /// Returns validation, name and container errors.
    pub async fn run(&self, spec: PodSpec) -> RaindResult<Pod> {
        spec.validate()?;
        if self.store.is_name_already_used(&spec.name, &spec.namespace)? {
            return Err(RaindError::AlreadyUsed {
                kind: "pod",
                name: format!("{}/{}", spec.namespace, spec.name),
            });
        }
        let template = self.store.put_template(spec)?;
        let pod = match self.create(&template.spec, Some(&template.template_id)) {
            Ok(pod) => pod,
            Err(err) => {
                self.store.collect_templates()?;
                return Err(err);
            }
        };
        self.start(&pod.pod_id).await
    }

    /// Start a pod: infra first, then every member.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Conflict`] when the pod no longer matches its
    /// template, or the failing container operation.
    pub async fn start(&self, name_or_id: &str) -> RaindResult<Pod> {
        let pod = self.store.resolve_pod(name_or_id)?;
        let containers = match &pod.template_id {
            Some(template_id) => {
                let template = self.store.template(template_id)?;
                check_template(&pod, &template.spec)?;
                template.spec.containers
            }
            None => Vec::new(),
        };
        tracing::info!(pod_id = %pod.pod_id, name = %pod.name, "Starting pod");

        let infra = self.ensure_infra(&pod).await?;
        let engine = &self.engine;
        let shared = SharedNamespaces {
            pid: infra.pid,
            address: engine.address(&infra.container_id).ok(),
        };

        let existing = self.members(&pod.pod_id)?;
        for template in &containers {
            let name = pod.member_name(&template.name);
            if existing.iter().any(|member| member.name == name) {
                continue;
            }
            let request = CreateRequest {
                image: template.image.clone(),
                command: template.command.clone(),
                mount: template.mount.clone(),
                tty: template.tty,
                env: template.env.clone(),
                name: Some(name),
                pod_id: Some(pod.pod_id.clone()),
                shared: Some(shared),
                ..CreateRequest::default()
            };
            engine.create(request).await?;
        }

        let infra = engine.store().get(&infra.container_id)?;
        if infra.state != ContainerStatus::Running {
            engine.start(&infra.container_id).await?;
            engine
                .wait_for(&infra.container_id, ContainerStatus::Running)
                .await?;
        }
        for member in self.members(&pod.pod_id)? {
            let id = member.container_id.as_str();
            if member.state == ContainerStatus::Creating {
                engine.wait_for(id, ContainerStatus::Created).await?;
            }
            // a restarted infra container has a new pid
            engine.rejoin(id, &shared).await?;
            if engine.store().get(id)?.state != ContainerStatus::Running {
                engine.start(id).await?;
            }
        }

        let infra = engine.store().get(&infra.container_id)?;
        let shared = SharedNamespaces {
            pid: infra.pid,
            address: None,
        };
        let pod = self.store.update_pod(&pod.pod_id, |pod| {
            pod.state = PodState::Running;
            pod.stopped_by_user = false;
            pod.started_at = Some(Utc::now());
            pod.owner_pid = infra.pid;
            pod.network_ns = Some(shared.path(NamespaceType::Network));
            pod.ipc_ns = Some(shared.path(NamespaceType::Ipc));
            pod.uts_ns = Some(shared.path(NamespaceType::Uts));
            pod.user_ns = Some(shared.path(NamespaceType::User));
            Ok(pod.clone())
        })?;
        tracing::info!(pod_id = %pod.pod_id, owner_pid = pod.owner_pid, "Pod running");
        Ok(pod)
    }

    /// Infra container ready to be joined; created or restarted as needed.
    async fn ensure_infra(&self, pod: &Pod) -> RaindResult<ContainerRecord> {
        let engine = &self.engine;
        let infra = match self.infra(&pod.pod_id)? {
            Some(infra) => infra,
            None => {
                let config = engine.config();
                let request = CreateRequest {
                    image: config.infra_image.clone(),
                    command: Some(config.infra_command.clone()),
                    name: Some(format!("{}-{}", config.infra_prefix, pod.suffix())),
                    pod_id: Some(pod.pod_id.clone()),
                    ..CreateRequest::default()
                };
                let infra = engine.create(request).await?;
                tracing::debug!(pod_id = %pod.pod_id, container_id = %infra.container_id, "Infra container created");
                infra
            }
        };
        let id = infra.container_id.as_str();
        match infra.state {
            ContainerStatus::Creating => engine.wait_for(id, ContainerStatus::Created).await?,
            ContainerStatus::Stopped => {
                // a new init process means new namespaces
                engine.start(id).await?;
                engine.wait_for(id, ContainerStatus::Running).await?;
            }
            ContainerStatus::Created | ContainerStatus::Running => {}
        }
        let infra = engine.store().get(id)?;
        if infra.pid == 0 {
            return Err(RaindError::Conflict {
                message: format!("infra container {} has no process", infra.name),
            });
        }
        Ok(infra)
    }

    /// Stop every member; the infra container keeps the namespaces alive.
    ///
    /// # Errors
    ///
    /// Returns the failing container operation.
    pub async fn stop(&self, name_or_id: &str) -> RaindResult<Pod> {
        let pod = self.store.resolve_pod(name_or_id)?;
        self.stop_members(&pod).await?;
        let pod = self.store.update_pod(&pod.pod_id, |pod| {
            pod.state = PodState::Stopped;
            pod.stopped_by_user = true;
            pod.stopped_at = Some(Utc::now());
            Ok(pod.clone())
        })?;
        tracing::info!(pod_id = %pod.pod_id, name = %pod.name, "Pod stopped");
        Ok(pod)
    }

    async fn stop_members(&self, pod: &Pod) -> RaindResult<()> {
        for member in self.members(&pod.pod_id)? {
            self.stop_container(&member).await?;
        }
        Ok(())
    }

    async fn stop_container(&self, record: &ContainerRecord) -> RaindResult<()> {
        if record.state == ContainerStatus::Running {
            self.engine.stop(&record.container_id).await?;
            self.engine
                .wait_for(&record.container_id, ContainerStatus::Stopped)
                .await?;
        }
        Ok(())
    }

    async fn delete_container(&self, record: &ContainerRecord) -> RaindResult<()> {
        self.stop_container(record).await?;
        match self.engine.delete(&record.container_id).await {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(()),
        }
    }

    /// Stop and delete members, then infra, then the record.
    ///
    /// # Errors
    ///
    /// Returns the failing container operation; the pod record stays.
    pub async fn remove(&self, name_or_id: &str) -> RaindResult<()> {
        let pod = self.store.resolve_pod(name_or_id)?;
        self.teardown(&pod).await?;
        self.store.collect_templates()?;
        tracing::info!(pod_id = %pod.pod_id, name = %pod.name, "Pod removed");
        Ok(())
    }

    async fn teardown(&self, pod: &Pod) -> RaindResult<()> {
        for member in self.members(&pod.pod_id)? {
            self.delete_container(&member).await?;
        }
        if let Some(infra) = self.infra(&pod.pod_id)? {
            self.delete_container(&infra).await?;
        }
        self.store.remove_pod(&pod.pod_id)?;
        Ok(())
    }

    /// Tear a pod down and create a fresh one with the same name from its
    /// template, then start it.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Conflict`] for pods without a template, or the
    /// failing step.
    pub async fn recreate(&self, pod: &Pod) -> RaindResult<Pod> {
        let Some(template_id) = pod.template_id.as_deref() else {
            return Err(RaindError::Conflict {
                message: format!("pod {} has no template to recreate from", pod.name),
            });
        };
        let template = self.store.template(template_id)?;
        tracing::info!(pod_id = %pod.pod_id, name = %pod.name, "Recreating pod from template");
        self.teardown(pod).await?;
        let mut spec = template.spec;
        spec.name.clone_from(&pod.name);
        let fresh = self.create(&spec, Some(template_id))?;
        self.start(&fresh.pod_id).await
    }

    /// State of the infra container.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn infra_state(&self, pod_id: &str) -> RaindResult<InfraState> {
        Ok(match self.infra(pod_id)? {
            None => InfraState::Missing,
            Some(infra) if infra.state == ContainerStatus::Running => InfraState::Running,
            Some(_) => InfraState::Stopped,
        })
    }

    /// Re-derive a pod's state from its containers: a running pod with any
    /// container down becomes `degraded`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn refresh(&self, pod_id: &str) -> RaindResult<Pod> {
        let infra = self.infra_state(pod_id)?;
        let members = self.members(pod_id)?;
        let expected = match self.store.pod(pod_id)?.template_id {
            Some(template_id) => self.store.template(&template_id)?.spec.containers.len(),
            None => 0,
        };
        let healthy = infra == InfraState::Running
            && members.len() >= expected
            && members
                .iter()
                .all(|member| member.state == ContainerStatus::Running);
        self.store.update_pod(pod_id, |pod| {
            let next = match pod.state {
                PodState::Running if !healthy => PodState::Degraded,
                PodState::Degraded if healthy => PodState::Running,
                state => state,
            };
            if next != pod.state {
                tracing::info!(pod_id = %pod.pod_id, from = %pod.state, to = %next, "Pod state changed");
                pod.state = next;
            }
            Ok(pod.clone())
        })
    }

    /// All pods, or those in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self, namespace: Option<&str>) -> RaindResult<Vec<Pod>> {
        match namespace {
            Some(namespace) => self.store.pods_in(namespace),
            None => self.store.pods(),
        }
    }

    /// One pod by name or id.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown pods.
    pub fn get(&self, name_or_id: &str) -> RaindResult<Pod> {
        self.store.resolve_pod(name_or_id)
    }

    /// Containers of the pod, infra included.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn containers(&self, pod_id: &str) -> RaindResult<Vec<ContainerRecord>> {
        self.engine.store().list_by_pod(pod_id)
    }

    /// The infra container record, if any.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn infra(&self, pod_id: &str) -> RaindResult<Option<ContainerRecord>> {
        let prefix = &self.engine.config().infra_prefix;
        Ok(self
            .containers(pod_id)?
            .into_iter()
            .find(|record| record.name.starts_with(prefix.as_str())))
    }

    fn members(&self, pod_id: &str) -> RaindResult<Vec<ContainerRecord>> {
        let prefix = &self.engine.config().infra_prefix;
        Ok(self
            .containers(pod_id)?
            .into_iter()
            .filter(|record| !record.name.starts_with(prefix.as_str()))
            .collect())
    }

    /// Change a replica set's desired count.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown replica sets.
    pub fn scale(&self, name_or_id: &str, replicas: u32) -> RaindResult<ReplicaSet> {
        let replicaset = self.store.resolve_replicaset(name_or_id)?;
        let replicaset = self.store.scale(&replicaset.replicaset_id, replicas)?;
        tracing::info!(replicaset_id = %replicaset.replicaset_id, replicas, "Replica set scaled");
        Ok(replicaset)
    }

    /// Remove a replica set together with its pods.
    ///
    /// # Errors
    ///
    /// Returns the first failing pod removal.
    pub async fn remove_replicaset(&self, name_or_id: &str) -> RaindResult<()> {
        let replicaset = self.store.resolve_replicaset(name_or_id)?;
        self.store.remove_replicaset(&replicaset.replicaset_id)?;
        for pod in self.store.pods_of_template(&replicaset.spec.template_id)? {
            self.teardown(&pod).await?;
        }
        self.store.collect_templates()?;
        tracing::info!(replicaset_id = %replicaset.replicaset_id, "Replica set removed");
        Ok(())
    }
}

/// A pod bound to a template must still look like it.
fn check_template(pod: &Pod, template: &PodSpec) -> RaindResult<()> {
    let conflict = |what: &str| RaindError::Conflict {
        message: format!("pod {} does not match its template: {what} differ", pod.name),
    };
    let named_after = pod.name == template.name || pod.name.starts_with(&format!("{}-", template.name));
    if !named_after {
        return Err(conflict("names"));
    }
    if pod.namespace != template.namespace {
        return Err(conflict("namespaces"));
    }
    if pod.labels != template.labels {
        return Err(conflict("labels"));
    }
    if pod.annotations != template.annotations {
        return Err(conflict("annotations"));
    }
    if let Some(container) = template.containers.iter().find(|c| c.image.is_empty()) {
        return Err(RaindError::validation(
            "pod",
            format!("container {} has no image", container.name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::pod::model::{ContainerTemplate, DEFAULT_NAMESPACE};

    fn spec() -> PodSpec {
        PodSpec {
            name: "web".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            annotations: BTreeMap::new(),
            containers: vec![ContainerTemplate {
                name: "nginx".to_string(),
                image: "nginx".to_string(),
                ..ContainerTemplate::default()
            }],
        }
    }

    fn pod_for(spec: &PodSpec, name: &str) -> Pod {
        Pod {
            pod_id: "0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b".to_string(),
            template_id: Some("t".to_string()),
            name: name.to_string(),
            namespace: spec.namespace.clone(),
            uid: String::new(),
            state: PodState::Created,
            owner_pid: 0,
            network_ns: None,
            ipc_ns: None,
            uts_ns: None,
            user_ns: None,
            labels: spec.labels.clone(),
            annotations: spec.annotations.clone(),
            stopped_by_user: false,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    #[test]
    fn template_check_accepts_replica_names() {
        let spec = spec();
        check_template(&pod_for(&spec, "web"), &spec).unwrap();
        check_template(&pod_for(&spec, "web-1a2b3"), &spec).unwrap();
        assert!(check_template(&pod_for(&spec, "api"), &spec).is_err());
    }

    #[test]
    fn template_check_rejects_drifted_labels() {
        let spec = spec();
        let mut pod = pod_for(&spec, "web");
        pod.labels.insert("tier".to_string(), "edge".to_string());
        let err = check_template(&pod, &spec).unwrap_err();
        assert!(err.to_string().contains("labels differ"));
    }
}
