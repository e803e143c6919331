//! # raind-network
//!
//! Networking for raind containers.
//!
//! This crate provides:
//! - Per-bridge IPv4 address pools (IPAM)
//! - A declarative packet-filter rule model with `iptables` and in-memory backends
//! - Host port forwarding
//! - Bridge management
//! - The network policy store and compiler

#![warn(missing_docs)]

pub mod bridge;
pub mod ipam;
pub mod netfilter;
pub mod policy;
pub mod portmap;

pub use bridge::{BridgeInfo, BridgeManager, NetworkService};
pub use ipam::{Assignment, Cidr, IpamStore, veth_name};
pub use netfilter::{IptablesBackend, MemoryNetfilter, Netfilter};
pub use policy::{ContainerResolver, PolicyCompiler, PolicyStore};
pub use portmap::{Forward, PortForwarder, Protocol};
