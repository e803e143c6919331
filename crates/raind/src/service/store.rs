//! Service state manager (SSM).

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use raind_common::id::random_id;
use raind_common::{Document, JsonStore, RaindError, RaindResult};
use serde::{Deserialize, Serialize};

use super::model::{L4Service, ServiceSpec};

/// The SSM document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDocument {
    /// Schema version.
    pub version: String,
    /// Services by id.
    #[serde(default)]
    pub services: BTreeMap<String, L4Service>,
}

impl Default for ServiceDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            services: BTreeMap::new(),
        }
    }
}

impl Document for ServiceDocument {
    const VERSION: &'static str = "1";
}

/// File-backed service store.
#[derive(Debug)]
pub struct ServiceStore {
    store: JsonStore<ServiceDocument>,
}

impl ServiceStore {
    /// Open the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Record a service.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::AlreadyUsed`] when `(name, namespace)` is taken.
    pub fn create(&self, spec: ServiceSpec) -> RaindResult<L4Service> {
        let mut service = L4Service {
            service_id: random_id(),
            spec,
            created_at: Utc::now(),
        };
        self.store.update(|doc| {
            // chains are named by the first eight hex digits
            while doc
                .services
                .keys()
                .any(|id| id.get(..8) == service.service_id.get(..8))
            {
                service.service_id = random_id();
            }
            let taken = doc.services.values().any(|existing| {
                existing.spec.name == service.spec.name
                    && existing.spec.namespace == service.spec.namespace
            });
            if taken {
                return Err(RaindError::AlreadyUsed {
                    kind: "service",
                    name: format!("{}/{}", service.spec.namespace, service.spec.name),
                });
            }
            doc.services
                .insert(service.service_id.clone(), service.clone());
            Ok(())
        })?;
        Ok(service)
    }

    /// Service by id, falling back to name.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when nothing matches.
    pub fn resolve(&self, name_or_id: &str) -> RaindResult<L4Service> {
        self.store.read(|doc| {
            doc.services
                .get(name_or_id)
                .or_else(|| doc.services.values().find(|s| s.spec.name == name_or_id))
                .cloned()
                .ok_or_else(|| RaindError::not_found("service", name_or_id))
        })
    }

    /// All services.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<L4Service>> {
        self.store
            .read(|doc| Ok(doc.services.values().cloned().collect()))
    }

    /// Drop a service.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown ids.
    pub fn remove(&self, service_id: &str) -> RaindResult<L4Service> {
        self.store.update(|doc| {
            doc.services
                .remove(service_id)
                .ok_or_else(|| RaindError::not_found("service", service_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::service::model::ServicePort;

    fn spec(namespace: &str) -> ServiceSpec {
        ServiceSpec {
            name: "web".to_string(),
            namespace: namespace.to_string(),
            selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            ports: vec![ServicePort {
                port: 80,
                target_port: 80,
                protocol: raind_network::Protocol::Tcp,
            }],
        }
    }

    #[test]
    fn names_unique_per_namespace() {
        let dir = TempDir::new().unwrap();
        let store = ServiceStore::new(dir.path().join("ssm.json"));
        let web = store.create(spec("default")).unwrap();
        assert!(matches!(
            store.create(spec("default")).unwrap_err(),
            RaindError::AlreadyUsed { .. }
        ));
        store.create(spec("staging")).unwrap();

        assert_eq!(store.resolve(&web.service_id).unwrap(), web);
        store.remove(&web.service_id).unwrap();
        assert!(store.remove(&web.service_id).unwrap_err().is_not_found());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn service_ids_have_distinct_prefixes() {
        let dir = TempDir::new().unwrap();
        let store = ServiceStore::new(dir.path().join("ssm.json"));
        for n in 0..32 {
            store.create(spec(&format!("ns{n}"))).unwrap();
        }
        let prefixes: std::collections::BTreeSet<String> = store
            .list()
            .unwrap()
            .iter()
            .map(|service| service.service_id[..8].to_string())
            .collect();
        assert_eq!(prefixes.len(), 32);
        let chain = crate::service::chain_name(&store.list().unwrap()[0].service_id, 80);
        assert!(chain.starts_with("RAIND-SVC-") && chain.len() == "RAIND-SVC-".len() + 11);
    }
}
