//! Network policy document.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use raind_common::{Document, RaindError, RaindResult};
use serde::{Deserialize, Serialize};

use crate::ipam::Cidr;
use crate::portmap::Protocol;

/// Which list a policy lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Container to container.
    EastWest,
    /// Container to outside, observe chain.
    NorthSouthObserve,
    /// Container to outside, enforce chain.
    NorthSouthEnforce,
}

impl PolicyKind {
    /// Every kind, in chain order.
    pub const ALL: [Self; 3] = [Self::EastWest, Self::NorthSouthObserve, Self::NorthSouthEnforce];

    /// Name used in the document and on the API.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EastWest => "east_west",
            Self::NorthSouthObserve => "north_south_observe",
            Self::NorthSouthEnforce => "north_south_enforce",
        }
    }

    /// Whether the policy is north-south.
    #[must_use]
    pub const fn is_north_south(&self) -> bool {
        !matches!(self, Self::EastWest)
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "east_west" | "ew" => Ok(Self::EastWest),
            "north_south_observe" | "ns_observe" => Ok(Self::NorthSouthObserve),
            "north_south_enforce" | "ns_enforce" => Ok(Self::NorthSouthEnforce),
            other => Err(RaindError::validation("policy type", other.to_string())),
        }
    }
}

/// Two-phase lifecycle of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    /// Added, not yet committed.
    BeforeCommit,
    /// Rule installed by the last commit.
    Applied,
    /// An endpoint could not be resolved; retried on the next commit.
    Unresolved,
    /// Removed by the user; dropped by the next commit.
    RemoveNextCommit,
}

/// One side of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Container name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// IPv4 address or CIDR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Endpoint {
    /// An endpoint naming a container.
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container_name: Some(name.into()),
            address: None,
        }
    }

    /// An endpoint naming an address.
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            container_name: None,
            address: Some(address.into()),
        }
    }
}

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy id.
    pub id: String,
    /// Lifecycle status.
    pub status: PolicyStatus,
    /// Why the policy is unresolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Source endpoint.
    pub source: Endpoint,
    /// Destination endpoint.
    pub destination: Endpoint,
    /// Protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Destination port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    /// Free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Policy {
    /// Whether the next commit should install this policy.
    #[must_use]
    pub const fn is_pending_apply(&self) -> bool {
        !matches!(self.status, PolicyStatus::RemoveNextCommit)
    }
}

/// A request to add a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRequest {
    /// Target list.
    #[serde(rename = "type")]
    pub kind: PolicyKind,
    /// Source endpoint.
    pub source: Endpoint,
    /// Destination endpoint.
    pub destination: Endpoint,
    /// Protocol.
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Destination port.
    #[serde(default)]
    pub dport: Option<u16>,
    /// Free-form comment.
    #[serde(default)]
    pub comment: Option<String>,
}

fn parse_destination(value: &str) -> RaindResult<()> {
    if value.parse::<Ipv4Addr>().is_ok() || value.parse::<Cidr>().is_ok() {
        Ok(())
    } else {
        Err(RaindError::validation(
            "policy destination",
            format!("{value} is not an IPv4 address or CIDR"),
        ))
    }
}

fn require_name<'a>(endpoint: &'a Endpoint, side: &str) -> RaindResult<&'a str> {
    match endpoint.container_name.as_deref() {
        Some(name) if !name.trim().is_empty() => Ok(name),
        _ => Err(RaindError::validation(
            "policy endpoint",
            format!("{side} must name a container"),
        )),
    }
}

impl PolicyRequest {
    /// Check the request shape for its kind.
    ///
    /// East-west policies name containers on both sides. North-south
    /// policies name a source container and a literal destination address.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Validation`] describing the first problem.
    pub fn validate(&self) -> RaindResult<()> {
        require_name(&self.source, "source")?;
        match self.kind {
            PolicyKind::EastWest => {
                require_name(&self.destination, "destination")?;
                if self.source.address.is_some() || self.destination.address.is_some() {
                    return Err(RaindError::validation(
                        "policy endpoint",
                        "east-west policies take container names, not addresses",
                    ));
                }
            }
            PolicyKind::NorthSouthObserve | PolicyKind::NorthSouthEnforce => {
                let destination = self.destination.address.as_deref().ok_or_else(|| {
                    RaindError::validation(
                        "policy destination",
                        "north-south policies require an IP or CIDR destination",
                    )
                })?;
                parse_destination(destination)?;
            }
        }
        if self.dport.is_some() && !self.protocol.is_some_and(|proto| proto.has_ports()) {
            return Err(RaindError::validation(
                "policy port",
                "dport requires protocol tcp or udp",
            ));
        }
        Ok(())
    }

    /// The stored form of this request.
    #[must_use]
    pub fn into_policy(self, id: String) -> Policy {
        Policy {
            id,
            status: PolicyStatus::BeforeCommit,
            reason: None,
            source: self.source,
            destination: self.destination,
            protocol: self.protocol,
            dport: self.dport,
            comment: self.comment,
        }
    }
}

/// Default east-west verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EastWestMode {
    /// Drop container-to-container traffic unless a policy allows it.
    #[default]
    Deny,
    /// Let container-to-container traffic through.
    Allow,
}

/// North-south mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NorthSouthMode {
    /// Permit and log.
    #[default]
    Observe,
    /// Deny unless allowed.
    Enforce,
}

impl FromStr for NorthSouthMode {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observe" => Ok(Self::Observe),
            "enforce" => Ok(Self::Enforce),
            other => Err(RaindError::validation("north-south mode", other.to_string())),
        }
    }
}

/// East-west defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EastWestDefaults {
    /// Verdict for traffic no policy matches.
    #[serde(default)]
    pub mode: EastWestMode,
    /// Log new connections hitting the default verdict.
    #[serde(default)]
    pub logging: bool,
}

/// North-south defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NorthSouthDefaults {
    /// Which chain the root dispatches to.
    #[serde(default)]
    pub mode: NorthSouthMode,
    /// Log new outbound connections.
    #[serde(default)]
    pub logging: bool,
}

/// Defaults section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Defaults {
    /// East-west defaults.
    #[serde(default)]
    pub east_west: EastWestDefaults,
    /// North-south defaults.
    #[serde(default)]
    pub north_south: NorthSouthDefaults,
}

/// Policy lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policies {
    /// East-west policies.
    #[serde(default)]
    pub east_west: Vec<Policy>,
    /// North-south observe policies.
    #[serde(default)]
    pub north_south_observe: Vec<Policy>,
    /// North-south enforce policies.
    #[serde(default)]
    pub north_south_enforce: Vec<Policy>,
}

impl Policies {
    /// The list for `kind`.
    #[must_use]
    pub const fn list(&self, kind: PolicyKind) -> &Vec<Policy> {
        match kind {
            PolicyKind::EastWest => &self.east_west,
            PolicyKind::NorthSouthObserve => &self.north_south_observe,
            PolicyKind::NorthSouthEnforce => &self.north_south_enforce,
        }
    }

    /// The mutable list for `kind`.
    pub const fn list_mut(&mut self, kind: PolicyKind) -> &mut Vec<Policy> {
        match kind {
            PolicyKind::EastWest => &mut self.east_west,
            PolicyKind::NorthSouthObserve => &mut self.north_south_observe,
            PolicyKind::NorthSouthEnforce => &mut self.north_south_enforce,
        }
    }

    /// Every policy with its kind.
    pub fn iter(&self) -> impl Iterator<Item = (PolicyKind, &Policy)> {
        PolicyKind::ALL
            .into_iter()
            .flat_map(move |kind| self.list(kind).iter().map(move |policy| (kind, policy)))
    }

    /// Find a policy by id.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<(PolicyKind, &Policy)> {
        self.iter().find(|(_, policy)| policy.id == id)
    }

    /// Find a policy by id, mutably.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut Policy> {
        self.east_west
            .iter_mut()
            .chain(self.north_south_observe.iter_mut())
            .chain(self.north_south_enforce.iter_mut())
            .find(|policy| policy.id == id)
    }

    /// Keep only the policies `keep` accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(&Policy) -> bool) {
        for kind in PolicyKind::ALL {
            self.list_mut(kind).retain(|policy| keep(policy));
        }
    }
}

/// Persisted policy state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Schema version.
    pub version: String,
    /// Defaults.
    #[serde(default)]
    pub defaults: Defaults,
    /// Policies.
    #[serde(default)]
    pub policies: Policies,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            defaults: Defaults::default(),
            policies: Policies::default(),
        }
    }
}

impl Document for PolicyDocument {
    const VERSION: &'static str = "1";
}

impl PolicyDocument {
    /// Turn a pre-commit document back into the committed state it
    /// describes: pending removals are restored, pending additions dropped.
    pub fn restore_committed(&mut self) {
        self.policies
            .retain(|policy| policy.status != PolicyStatus::BeforeCommit);
        for kind in PolicyKind::ALL {
            for policy in self.policies.list_mut(kind) {
                if policy.status == PolicyStatus::RemoveNextCommit {
                    policy.status = PolicyStatus::Applied;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn east_west(src: &str, dst: &str) -> PolicyRequest {
        PolicyRequest {
            kind: PolicyKind::EastWest,
            source: Endpoint::container(src),
            destination: Endpoint::container(dst),
            protocol: Some(Protocol::Tcp),
            dport: Some(80),
            comment: None,
        }
    }

    #[test]
    fn east_west_requires_names() {
        assert!(east_west("a", "b").validate().is_ok());

        let mut request = east_west("a", "b");
        request.destination = Endpoint::address("10.0.0.1");
        assert!(request.validate().is_err());

        let mut request = east_west("a", "b");
        request.protocol = None;
        assert!(request.validate().is_err());
    }

    #[test]
    fn north_south_requires_literal_destination() {
        let mut request = east_west("a", "b");
        request.kind = PolicyKind::NorthSouthEnforce;
        assert!(request.validate().is_err());

        request.destination = Endpoint::address("8.8.8.0/24");
        assert!(request.validate().is_ok());
        request.destination = Endpoint::address("example.com");
        assert!(request.validate().is_err());
    }

    #[test]
    fn kinds_parse() {
        assert_eq!("east_west".parse::<PolicyKind>().unwrap(), PolicyKind::EastWest);
        assert_eq!(
            "ns_enforce".parse::<PolicyKind>().unwrap(),
            PolicyKind::NorthSouthEnforce
        );
        assert!("sideways".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn document_serializes_with_snake_case() {
        let mut document = PolicyDocument::default();
        document
            .policies
            .east_west
            .push(east_west("a", "b").into_policy("p1".into()));
        let json = serde_json::to_value(&document).unwrap();
        assert_eq!(json["policies"]["east_west"][0]["status"], "before_commit");
        assert_eq!(json["defaults"]["north_south"]["mode"], "observe");
        assert_eq!(json["defaults"]["east_west"]["mode"], "deny");
    }

    #[test]
    fn restore_committed_undoes_pending_edits() {
        let mut document = PolicyDocument::default();
        let mut kept = east_west("a", "b").into_policy("kept".into());
        kept.status = PolicyStatus::RemoveNextCommit;
        let added = east_west("c", "d").into_policy("added".into());
        document.policies.east_west = vec![kept, added];

        document.restore_committed();
        assert_eq!(document.policies.east_west.len(), 1);
        assert_eq!(document.policies.east_west[0].status, PolicyStatus::Applied);
    }
}
