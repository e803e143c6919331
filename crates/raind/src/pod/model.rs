//! Pod, template and replica set types, and the YAML manifests they come from.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use raind_common::{RaindError, RaindResult};
use serde::{Deserialize, Serialize};

/// Namespace used when a manifest names none.
pub const DEFAULT_NAMESPACE: &str = "default";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Pod lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodState {
    /// Recorded, never started.
    Created,
    /// Infra and every member running.
    Running,
    /// Members stopped.
    Stopped,
    /// Infra running, some member not.
    Degraded,
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// One container of a pod template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerTemplate {
    /// Base name; members are called `<name>-<pod suffix>`.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Extra environment.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Bind mounts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mount: Vec<String>,
    /// Allocate a terminal.
    pub tty: bool,
}

/// Pod specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Pod name.
    pub name: String,
    /// Namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Labels matched by service selectors.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Member containers.
    #[serde(default)]
    pub containers: Vec<ContainerTemplate>,
}

impl PodSpec {
    /// Check names and images.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first problem.
    pub fn validate(&self) -> RaindResult<()> {
        if self.name.is_empty() {
            return Err(RaindError::validation("pod", "name is empty"));
        }
        if self.namespace.is_empty() {
            return Err(RaindError::validation("pod", "namespace is empty"));
        }
        if self.containers.is_empty() {
            return Err(RaindError::validation(
                "pod",
                format!("pod {} declares no containers", self.name),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for container in &self.containers {
            if container.name.is_empty() {
                return Err(RaindError::validation("pod", "container name is empty"));
            }
            if container.image.is_empty() {
                return Err(RaindError::validation(
                    "pod",
                    format!("container {} has no image", container.name),
                ));
            }
            if !seen.insert(container.name.as_str()) {
                return Err(RaindError::validation(
                    "pod",
                    format!("container {} declared twice", container.name),
                ));
            }
        }
        Ok(())
    }
}

/// A reusable pod specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    /// Template id.
    pub template_id: String,
    /// Specification.
    pub spec: PodSpec,
    /// Registered.
    pub created_at: DateTime<Utc>,
}

/// Replica set specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    /// Replica set name.
    pub name: String,
    /// Template the replicas are created from.
    pub template_id: String,
    /// Desired pod count.
    pub replicas: u32,
}

/// Desired replica count for a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    /// Replica set id.
    pub replicaset_id: String,
    /// Specification.
    pub spec: ReplicaSetSpec,
    /// Registered.
    pub created_at: DateTime<Utc>,
}

/// A pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// Pod id.
    pub pod_id: String,
    /// Template the pod was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Name, unique within the namespace.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Random uid.
    pub uid: String,
    /// Lifecycle state.
    pub state: PodState,
    /// Init process of the infra container.
    #[serde(default)]
    pub owner_pid: u32,
    /// Shared network namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_ns: Option<PathBuf>,
    /// Shared IPC namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_ns: Option<PathBuf>,
    /// Shared UTS namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uts_ns: Option<PathBuf>,
    /// Shared user namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ns: Option<PathBuf>,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Set by an explicit stop; the reconciler leaves such pods alone.
    #[serde(default)]
    pub stopped_by_user: bool,
    /// Recorded.
    pub created_at: DateTime<Utc>,
    /// Last start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Last stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Pod {
    /// Suffix appended to member container names.
    #[must_use]
    pub fn suffix(&self) -> String {
        let compact: String = self.pod_id.chars().filter(|c| *c != '-').collect();
        let start = compact.len().saturating_sub(8);
        compact[start..].to_string()
    }

    /// Name of the member created from `base`.
    #[must_use]
    pub fn member_name(&self, base: &str) -> String {
        format!("{base}-{}", self.suffix())
    }
}

/// A YAML manifest posted to `/v1/pods`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// A single pod.
    Pod(PodSpec),
    /// A template with a replica count.
    ReplicaSet {
        /// Replica set name.
        name: String,
        /// Desired count.
        replicas: u32,
        /// Pod template.
        template: PodSpec,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    kind: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    spec: serde_yaml::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodBody {
    #[serde(default)]
    containers: Vec<ContainerTemplate>,
}

#[derive(Debug, Deserialize)]
struct ReplicaSetBody {
    #[serde(default = "one")]
    replicas: u32,
    template: TemplateBody,
}

const fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct TemplateBody {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    spec: PodBody,
}

fn pod_spec(metadata: Metadata, body: PodBody) -> PodSpec {
    PodSpec {
        name: metadata.name,
        namespace: if metadata.namespace.is_empty() {
            default_namespace()
        } else {
            metadata.namespace
        },
        labels: metadata.labels,
        annotations: metadata.annotations,
        containers: body.containers,
    }
}

impl Manifest {
    /// Decode a `kind: Pod` or `kind: ReplicaSet` manifest.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed YAML, other kinds and invalid
    /// pod specs.
    pub fn from_yaml(text: &str) -> RaindResult<Self> {
        let raw: RawManifest = serde_yaml::from_str(text)
            .map_err(|e| RaindError::validation("manifest", e.to_string()))?;
        let decode = |e: serde_yaml::Error| RaindError::validation("manifest", e.to_string());
        let manifest = match raw.kind.as_str() {
            "Pod" => {
                let body: PodBody = serde_yaml::from_value(raw.spec).map_err(decode)?;
                Self::Pod(pod_spec(raw.metadata, body))
            }
            "ReplicaSet" => {
                let body: ReplicaSetBody = serde_yaml::from_value(raw.spec).map_err(decode)?;
                let mut template_meta = body.template.metadata;
                if template_meta.name.is_empty() {
                    template_meta.name.clone_from(&raw.metadata.name);
                }
                Self::ReplicaSet {
                    name: raw.metadata.name,
                    replicas: body.replicas,
                    template: pod_spec(template_meta, body.template.spec),
                }
            }
            other => {
                return Err(RaindError::validation(
                    "manifest",
                    format!("unsupported kind {other:?}"),
                ));
            }
        };
        match &manifest {
            Self::Pod(spec) => spec.validate()?,
            Self::ReplicaSet { name, template, .. } => {
                if name.is_empty() {
                    return Err(RaindError::validation("manifest", "replica set name is empty"));
                }
                template.validate()?;
            }
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_manifest() {
        let manifest = Manifest::from_yaml(
            r"
kind: Pod
metadata:
  name: web
  labels:
    app: web
spec:
  containers:
    - name: nginx
      image: nginx:1.27
",
        )
        .unwrap();
        let Manifest::Pod(spec) = manifest else {
            panic!("expected a pod");
        };
        assert_eq!(spec.namespace, "default");
        assert_eq!(spec.labels["app"], "web");
        assert_eq!(spec.containers[0].image, "nginx:1.27");
    }

    #[test]
    fn replicaset_manifest() {
        let manifest = Manifest::from_yaml(
            r"
kind: ReplicaSet
metadata:
  name: web
spec:
  replicas: 3
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: nginx
          image: nginx
",
        )
        .unwrap();
        let Manifest::ReplicaSet { name, replicas, template } = manifest else {
            panic!("expected a replica set");
        };
        assert_eq!(name, "web");
        assert_eq!(replicas, 3);
        assert_eq!(template.name, "web");
        assert_eq!(template.labels["app"], "web");
    }

    #[test]
    fn unsupported_kind() {
        let err = Manifest::from_yaml("kind: Deployment\nmetadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, RaindError::Validation { .. }));
    }

    #[test]
    fn container_without_image() {
        let err = Manifest::from_yaml(
            "kind: Pod\nmetadata:\n  name: x\nspec:\n  containers:\n    - name: a\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no image"));
    }

    #[test]
    fn member_names_use_pod_suffix() {
        let pod = Pod {
            pod_id: "0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b".to_string(),
            template_id: None,
            name: "web".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            uid: String::new(),
            state: PodState::Created,
            owner_pid: 0,
            network_ns: None,
            ipc_ns: None,
            uts_ns: None,
            user_ns: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            stopped_by_user: false,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        };
        assert_eq!(pod.suffix(), "2e3f4a5b");
        assert_eq!(pod.member_name("nginx"), "nginx-2e3f4a5b");
    }
}
