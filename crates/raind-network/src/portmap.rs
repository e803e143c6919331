//! Host-to-container port forwarding.
//!
//! Each forward installs three NAT rules tagged with `raind-<container-id>`:
//! a PREROUTING DNAT for external traffic, an OUTPUT DNAT for locally
//! originated traffic and a POSTROUTING MASQUERADE for the return path.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use raind_common::{RaindError, RaindResult};
use serde::{Deserialize, Serialize};

use crate::netfilter::{Match, Netfilter, Position, Rule, Target};

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
    /// ICMP; carries no ports.
    Icmp,
}

impl Protocol {
    /// Get the protocol string for iptables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    /// Whether the protocol has ports.
    #[must_use]
    pub const fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            _ => Err(RaindError::validation("protocol", s.to_string())),
        }
    }
}

/// A recorded port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl FromStr for Forward {
    type Err = RaindError;

    /// Parse `host:container[:proto]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RaindError::validation("port forward", s.to_string());
        let mut parts = s.split(':');
        let host_port: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let container_port: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let protocol = match parts.next() {
            Some(proto) => proto.parse::<Protocol>().map_err(|_| invalid())?,
            None => Protocol::Tcp,
        };
        if parts.next().is_some() || host_port == 0 || container_port == 0 || !protocol.has_ports() {
            return Err(invalid());
        }
        Ok(Self {
            host_port,
            container_port,
            protocol,
        })
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host_port, self.container_port, self.protocol)
    }
}

/// Installs and removes port-forward rules.
#[derive(Clone)]
pub struct PortForwarder {
    netfilter: Arc<dyn Netfilter>,
}

impl PortForwarder {
    /// Create a forwarder over a packet-filter backend.
    pub fn new(netfilter: Arc<dyn Netfilter>) -> Self {
        Self { netfilter }
    }

    /// The NAT rules backing one forward.
    #[must_use]
    pub fn rules(container_id: &str, address: Ipv4Addr, forward: &Forward) -> [Rule; 3] {
        let comment = format!("raind-{container_id}");
        let destination = format!("{address}:{}", forward.container_port);
        let prerouting = Rule::nat("PREROUTING", Target::Dnat(destination.clone()))
            .with(Match::Protocol(forward.protocol))
            .with(Match::DestinationPort(forward.host_port))
            .comment(comment.clone());
        let output = Rule::nat("OUTPUT", Target::Dnat(destination))
            .with(Match::Destination("127.0.0.1".to_string()))
            .with(Match::Protocol(forward.protocol))
            .with(Match::DestinationPort(forward.host_port))
            .comment(comment.clone());
        let masquerade = Rule::nat("POSTROUTING", Target::Masquerade)
            .with(Match::Destination(address.to_string()))
            .with(Match::Protocol(forward.protocol))
            .with(Match::DestinationPort(forward.container_port))
            .comment(comment);
        [prerouting, output, masquerade]
    }

    /// Install the rules for `forwards`. On failure, rules installed by this
    /// call are removed again.
    ///
    /// # Errors
    ///
    /// Returns the backend error that stopped installation.
    pub async fn install(&self, container_id: &str, address: Ipv4Addr, forwards: &[Forward]) -> RaindResult<()> {
        let mut installed: Vec<Rule> = Vec::new();
        for forward in forwards {
            tracing::debug!(container_id, forward = %forward, "Adding port forward");
            for rule in Self::rules(container_id, address, forward) {
                if let Err(err) = self.netfilter.ensure_rule(&rule, Position::Append).await {
                    for rule in installed.iter().rev() {
                        if let Err(undo) = self.netfilter.remove_rule(rule).await {
                            tracing::warn!(container_id, error = %undo, "Failed to undo port forward rule");
                        }
                    }
                    return Err(err);
                }
                installed.push(rule);
            }
        }
        Ok(())
    }

    /// Remove the rules for `forwards`. Every rule is attempted; the first
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first backend error.
    pub async fn remove(&self, container_id: &str, address: Ipv4Addr, forwards: &[Forward]) -> RaindResult<()> {
        let mut first_error = None;
        for forward in forwards {
            tracing::debug!(container_id, forward = %forward, "Removing port forward");
            for rule in Self::rules(container_id, address, forward) {
                if let Err(err) = self.netfilter.remove_rule(&rule).await {
                    tracing::warn!(container_id, error = %err, "Failed to remove port forward rule");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::{MemoryNetfilter, Table};

    #[test]
    fn forward_parsing() {
        let forward: Forward = "8080:80".parse().unwrap();
        assert_eq!(forward.protocol, Protocol::Tcp);
        let forward: Forward = "5353:53:udp".parse().unwrap();
        assert_eq!(forward.protocol, Protocol::Udp);
        assert_eq!(forward.to_string(), "5353:53:udp");

        for bad in ["80", "a:b", "0:80", "1:2:icmp", "1:2:tcp:x", "70000:1"] {
            assert!(bad.parse::<Forward>().is_err(), "{bad}");
        }
    }

    #[test]
    fn protocol_display() {
        assert_eq!(format!("{}", Protocol::Tcp), "tcp");
        assert_eq!(format!("{}", Protocol::Udp), "udp");
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
    }

    #[tokio::test]
    async fn install_and_remove() {
        let nf = Arc::new(MemoryNetfilter::new());
        let forwarder = PortForwarder::new(nf.clone());
        let address: Ipv4Addr = "10.166.0.2".parse().unwrap();
        let forwards = ["8080:80".parse::<Forward>().unwrap()];

        forwarder.install("abc", address, &forwards).await.unwrap();
        assert_eq!(nf.rules(Table::Nat, "PREROUTING").len(), 1);
        assert_eq!(nf.rules(Table::Nat, "OUTPUT").len(), 1);
        assert_eq!(nf.rules(Table::Nat, "POSTROUTING").len(), 1);
        assert!(nf.rules(Table::Nat, "PREROUTING")[0]
            .to_string()
            .contains("--to-destination 10.166.0.2:80"));

        forwarder.remove("abc", address, &forwards).await.unwrap();
        assert!(nf.rules(Table::Nat, "PREROUTING").is_empty());
        assert!(nf.rules(Table::Nat, "POSTROUTING").is_empty());
    }
}
