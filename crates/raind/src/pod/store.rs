//! Pod state manager (PSM): pods, templates and replica sets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use raind_common::id::entity_id;
use raind_common::{Document, JsonStore, RaindError, RaindResult};
use serde::{Deserialize, Serialize};

use super::model::{Pod, PodSpec, PodState, PodTemplate, ReplicaSet, ReplicaSetSpec};

/// The PSM document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDocument {
    /// Schema version.
    pub version: String,
    /// Pods by id.
    #[serde(default)]
    pub pods: BTreeMap<String, Pod>,
    /// Templates by id.
    #[serde(default)]
    pub templates: BTreeMap<String, PodTemplate>,
    /// Replica sets by id.
    #[serde(default)]
    pub replicasets: BTreeMap<String, ReplicaSet>,
}

impl Default for PodDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            pods: BTreeMap::new(),
            templates: BTreeMap::new(),
            replicasets: BTreeMap::new(),
        }
    }
}

impl Document for PodDocument {
    const VERSION: &'static str = "1";
}

impl PodDocument {
    fn pod_named(&self, name: &str, namespace: &str) -> Option<&Pod> {
        self.pods
            .values()
            .find(|pod| pod.name == name && pod.namespace == namespace)
    }
}

/// File-backed pod store.
#[derive(Debug)]
pub struct PodStore {
    store: JsonStore<PodDocument>,
}

impl PodStore {
    /// Open the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Record a new pod in state `created`.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::AlreadyUsed`] when `(name, namespace)` is taken.
    pub fn create_pod(&self, spec: &PodSpec, template_id: Option<&str>) -> RaindResult<Pod> {
        let pod = Pod {
            pod_id: entity_id(),
            template_id: template_id.map(str::to_string),
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
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
        };
        self.store.update(|doc| {
            if doc.pod_named(&pod.name, &pod.namespace).is_some() {
                return Err(RaindError::AlreadyUsed {
                    kind: "pod",
                    name: format!("{}/{}", pod.namespace, pod.name),
                });
            }
            doc.pods.insert(pod.pod_id.clone(), pod.clone());
            Ok(())
        })?;
        tracing::debug!(pod_id = %pod.pod_id, name = %pod.name, namespace = %pod.namespace, "Pod recorded");
        Ok(pod)
    }

    /// Whether `(name, namespace)` is taken.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn is_name_already_used(&self, name: &str, namespace: &str) -> RaindResult<bool> {
        self.store
            .read(|doc| Ok(doc.pod_named(name, namespace).is_some()))
    }

    /// Pod by id, falling back to name in any namespace.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when nothing matches.
    pub fn resolve_pod(&self, name_or_id: &str) -> RaindResult<Pod> {
        self.store.read(|doc| {
            doc.pods
                .get(name_or_id)
                .or_else(|| doc.pods.values().find(|pod| pod.name == name_or_id))
                .cloned()
                .ok_or_else(|| RaindError::not_found("pod", name_or_id))
        })
    }

    /// Pod by id.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn pod(&self, pod_id: &str) -> RaindResult<Pod> {
        self.store.read(|doc| {
            doc.pods
                .get(pod_id)
                .cloned()
                .ok_or_else(|| RaindError::not_found("pod", pod_id))
        })
    }

    /// All pods.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn pods(&self) -> RaindResult<Vec<Pod>> {
        self.store.read(|doc| Ok(doc.pods.values().cloned().collect()))
    }

    /// Pods in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn pods_in(&self, namespace: &str) -> RaindResult<Vec<Pod>> {
        self.store.read(|doc| {
            Ok(doc
                .pods
                .values()
                .filter(|pod| pod.namespace == namespace)
                .cloned()
                .collect())
        })
    }

    /// Pods bound to `template_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn pods_of_template(&self, template_id: &str) -> RaindResult<Vec<Pod>> {
        self.store.read(|doc| {
            let mut pods: Vec<Pod> = doc
                .pods
                .values()
                .filter(|pod| pod.template_id.as_deref() == Some(template_id))
                .cloned()
                .collect();
            pods.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.pod_id.cmp(&b.pod_id)));
            Ok(pods)
        })
    }

    /// Mutate one pod.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] or the closure's error.
    pub fn update_pod<R>(&self, pod_id: &str, f: impl FnOnce(&mut Pod) -> RaindResult<R>) -> RaindResult<R> {
        self.store.update(|doc| {
            let pod = doc
                .pods
                .get_mut(pod_id)
                .ok_or_else(|| RaindError::not_found("pod", pod_id))?;
            f(pod)
        })
    }

    /// Drop a pod record.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn remove_pod(&self, pod_id: &str) -> RaindResult<Option<Pod>> {
        self.store.update(|doc| Ok(doc.pods.remove(pod_id)))
    }

    /// Register a template.
    ///
    /// # Errors
    ///
    /// Returns validation errors for invalid specs.
    pub fn put_template(&self, spec: PodSpec) -> RaindResult<PodTemplate> {
        spec.validate()?;
        let template = PodTemplate {
            template_id: entity_id(),
            spec,
            created_at: Utc::now(),
        };
        self.store.update(|doc| {
            doc.templates
                .insert(template.template_id.clone(), template.clone());
            Ok(())
        })?;
        tracing::debug!(template_id = %template.template_id, name = %template.spec.name, "Pod template registered");
        Ok(template)
    }

    /// Template by id.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn template(&self, template_id: &str) -> RaindResult<PodTemplate> {
        self.store.read(|doc| {
            doc.templates
                .get(template_id)
                .cloned()
                .ok_or_else(|| RaindError::not_found("pod template", template_id))
        })
    }

    /// All templates.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn templates(&self) -> RaindResult<Vec<PodTemplate>> {
        self.store
            .read(|doc| Ok(doc.templates.values().cloned().collect()))
    }

    /// Remove templates no pod or replica set refers to; returns their ids.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn collect_templates(&self) -> RaindResult<Vec<String>> {
        self.store.update(|doc| {
            let referenced: std::collections::BTreeSet<&str> = doc
                .pods
                .values()
                .filter_map(|pod| pod.template_id.as_deref())
                .chain(doc.replicasets.values().map(|rs| rs.spec.template_id.as_str()))
                .collect();
            let unreferenced: Vec<String> = doc
                .templates
                .keys()
                .filter(|id| !referenced.contains(id.as_str()))
                .cloned()
                .collect();
            for id in &unreferenced {
                doc.templates.remove(id);
                tracing::debug!(template_id = %id, "Pod template collected");
            }
            Ok(unreferenced)
        })
    }

    /// Register a replica set.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::AlreadyUsed`] for duplicate names and
    /// [`RaindError::NotFound`] for unknown templates.
    pub fn put_replicaset(&self, spec: ReplicaSetSpec) -> RaindResult<ReplicaSet> {
        let replicaset = ReplicaSet {
            replicaset_id: entity_id(),
            spec,
            created_at: Utc::now(),
        };
        self.store.update(|doc| {
            if !doc.templates.contains_key(&replicaset.spec.template_id) {
                return Err(RaindError::not_found(
                    "pod template",
                    replicaset.spec.template_id.clone(),
                ));
            }
            if doc
                .replicasets
                .values()
                .any(|rs| rs.spec.name == replicaset.spec.name)
            {
                return Err(RaindError::AlreadyUsed {
                    kind: "replica set",
                    name: replicaset.spec.name.clone(),
                });
            }
            doc.replicasets
                .insert(replicaset.replicaset_id.clone(), replicaset.clone());
            Ok(())
        })?;
        Ok(replicaset)
    }

    /// All replica sets.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn replicasets(&self) -> RaindResult<Vec<ReplicaSet>> {
        self.store
            .read(|doc| Ok(doc.replicasets.values().cloned().collect()))
    }

    /// Replica set by id or name.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when nothing matches.
    pub fn resolve_replicaset(&self, name_or_id: &str) -> RaindResult<ReplicaSet> {
        self.store.read(|doc| {
            doc.replicasets
                .get(name_or_id)
                .or_else(|| doc.replicasets.values().find(|rs| rs.spec.name == name_or_id))
                .cloned()
                .ok_or_else(|| RaindError::not_found("replica set", name_or_id))
        })
    }

    /// Change the desired count.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn scale(&self, replicaset_id: &str, replicas: u32) -> RaindResult<ReplicaSet> {
        self.store.update(|doc| {
            let rs = doc
                .replicasets
                .get_mut(replicaset_id)
                .ok_or_else(|| RaindError::not_found("replica set", replicaset_id))?;
            rs.spec.replicas = replicas;
            Ok(rs.clone())
        })
    }

    /// Drop a replica set.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn remove_replicaset(&self, replicaset_id: &str) -> RaindResult<ReplicaSet> {
        self.store.update(|doc| {
            doc.replicasets
                .remove(replicaset_id)
                .ok_or_else(|| RaindError::not_found("replica set", replicaset_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::pod::model::{ContainerTemplate, DEFAULT_NAMESPACE};

    fn spec(name: &str) -> PodSpec {
        PodSpec {
            name: name.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            containers: vec![ContainerTemplate {
                name: "app".to_string(),
                image: "alpine".to_string(),
                ..ContainerTemplate::default()
            }],
        }
    }

    fn store() -> (TempDir, PodStore) {
        let dir = TempDir::new().unwrap();
        let store = PodStore::new(dir.path().join("psm.json"));
        (dir, store)
    }

    #[test]
    fn pod_names_unique_per_namespace() {
        let (_dir, store) = store();
        store.create_pod(&spec("web"), None).unwrap();
        assert!(matches!(
            store.create_pod(&spec("web"), None).unwrap_err(),
            RaindError::AlreadyUsed { .. }
        ));

        let mut other = spec("web");
        other.namespace = "staging".to_string();
        store.create_pod(&other, None).unwrap();
        assert_eq!(store.pods().unwrap().len(), 2);
        assert_eq!(store.pods_in("staging").unwrap().len(), 1);
    }

    #[test]
    fn unreferenced_templates_are_collected() {
        let (_dir, store) = store();
        let kept = store.put_template(spec("a")).unwrap();
        let dropped = store.put_template(spec("b")).unwrap();
        let rs_template = store.put_template(spec("c")).unwrap();
        store.create_pod(&spec("a"), Some(&kept.template_id)).unwrap();
        store
            .put_replicaset(ReplicaSetSpec {
                name: "c".to_string(),
                template_id: rs_template.template_id.clone(),
                replicas: 0,
            })
            .unwrap();

        assert_eq!(store.collect_templates().unwrap(), vec![dropped.template_id.clone()]);
        assert!(store.template(&dropped.template_id).unwrap_err().is_not_found());
        assert!(store.template(&kept.template_id).is_ok());
    }

    #[test]
    fn replicaset_needs_template() {
        let (_dir, store) = store();
        let err = store
            .put_replicaset(ReplicaSetSpec {
                name: "web".to_string(),
                template_id: "missing".to_string(),
                replicas: 1,
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
