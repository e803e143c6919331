//! Bottle specification parsing.

use std::collections::BTreeMap;

use raind_common::{RaindError, RaindResult};
use raind_network::Protocol;
use raind_network::policy::PolicyKind;
use serde::{Deserialize, Serialize};

/// Bottle specification (`bottle.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleSpec {
    /// Bottle metadata.
    pub bottle: BottleMeta,

    /// Services by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,

    /// Network policies, applied in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicySpec>,
}

/// Bottle metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleMeta {
    /// Bottle name, unique across bottles.
    #[serde(default)]
    pub name: String,
}

/// Service specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Image to use.
    pub image: String,

    /// Command override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Environment, `KEY=VALUE`. Values naming a dependency (`db`,
    /// `db:5432`, `$db`) are replaced by its address.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Port forwards, `host:container[:proto]`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    /// Bind mounts, `source:destination[:ro|rw]`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,

    /// Bridge to attach to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Allocate a terminal.
    pub tty: bool,

    /// Services that must start first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// A network policy declared by a bottle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Policy list.
    #[serde(rename = "type")]
    pub kind: PolicyKind,
    /// Source service or container.
    pub source: String,
    /// Destination service or container (east-west), IP or CIDR (north-south).
    pub destination: String,
    /// Protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Destination port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
}

impl BottleSpec {
    /// Parse and validate YAML.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Validation`] for malformed YAML, an empty name,
    /// no services or a service without an image.
    pub fn from_yaml(yaml: &str) -> RaindResult<Self> {
        let spec: Self =
            serde_yaml::from_str(yaml).map_err(|e| RaindError::validation("bottle", e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check the name and the services.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Validation`] naming the first problem.
    pub fn validate(&self) -> RaindResult<()> {
        if self.bottle.name.trim().is_empty() {
            return Err(RaindError::validation("bottle", "bottle.name is empty"));
        }
        if self.services.is_empty() {
            return Err(RaindError::validation(
                "bottle",
                format!("bottle {} declares no services", self.bottle.name),
            ));
        }
        if let Some((name, _)) = self.services.iter().find(|(_, s)| s.image.is_empty()) {
            return Err(RaindError::validation(
                "bottle",
                format!("service {name} has no image"),
            ));
        }
        Ok(())
    }

    /// Container name of `service`.
    #[must_use]
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{service}", self.bottle.name)
    }

    /// A policy endpoint: services of this bottle map to their containers,
    /// anything else is taken as a container name.
    #[must_use]
    pub fn endpoint_name(&self, name: &str) -> String {
        if self.services.contains_key(name) {
            self.container_name(name)
        } else {
            name.to_string()
        }
    }
}
