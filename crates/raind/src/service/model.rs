//! L4 service types and their YAML form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use raind_common::{RaindError, RaindResult};
use raind_network::Protocol;
use serde::{Deserialize, Serialize};

use crate::pod::DEFAULT_NAMESPACE;

/// One exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port clients connect to.
    pub port: u16,
    /// Port the endpoints listen on; defaults to `port`.
    #[serde(default, alias = "targetPort")]
    pub target_port: u16,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// Service specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Name, unique within the namespace.
    pub name: String,
    /// Namespace whose pods are selected.
    pub namespace: String,
    /// Labels a pod must carry to be an endpoint.
    pub selector: BTreeMap<String, String>,
    /// Exposed ports.
    pub ports: Vec<ServicePort>,
}

/// A stored L4 service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4Service {
    /// Service id.
    pub service_id: String,
    /// Specification.
    #[serde(flatten)]
    pub spec: ServiceSpec,
    /// Registered.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    spec: RawSpec,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    #[serde(default)]
    selector: BTreeMap<String, String>,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

impl ServiceSpec {
    /// Decode a `kind: Service` manifest.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed YAML, other kinds, a missing
    /// name, no ports, port 0 or ICMP.
    pub fn from_yaml(text: &str) -> RaindResult<Self> {
        let raw: RawService = serde_yaml::from_str(text)
            .map_err(|e| RaindError::validation("service", e.to_string()))?;
        if let Some(kind) = raw.kind.as_deref() {
            if kind != "Service" {
                return Err(RaindError::validation(
                    "service",
                    format!("unsupported kind {kind:?}"),
                ));
            }
        }
        let mut spec = Self {
            name: raw.metadata.name,
            namespace: raw
                .metadata
                .namespace
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            selector: raw.spec.selector,
            ports: raw.spec.ports,
        };
        spec.normalize()?;
        Ok(spec)
    }

    /// Fill default target ports and reject unusable specs.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the problem.
    pub fn normalize(&mut self) -> RaindResult<()> {
        if self.name.is_empty() {
            return Err(RaindError::validation("service", "name is empty"));
        }
        if self.ports.is_empty() {
            return Err(RaindError::validation(
                "service",
                format!("service {} exposes no ports", self.name),
            ));
        }
        for port in &mut self.ports {
            if port.port == 0 {
                return Err(RaindError::validation("service", "port 0"));
            }
            if !port.protocol.has_ports() {
                return Err(RaindError::validation(
                    "service",
                    format!("protocol {} has no ports", port.protocol),
                ));
            }
            if port.target_port == 0 {
                port.target_port = port.port;
            }
        }
        Ok(())
    }

    /// Whether `labels` carry every selector entry. An empty selector
    /// matches nothing.
    #[must_use]
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }
}
