//! IPv4 address management.
//!
//! One pool per host bridge. Addresses are handed out lowest-first from the
//! pool subnet, skipping the network, gateway and broadcast addresses. Each
//! container holds at most one allocation across all pools; port-forward
//! records hang off that allocation.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use raind_common::{Document, JsonStore, RaindError, RaindResult};
use serde::{Deserialize, Serialize};

use crate::portmap::Forward;

/// Default bridge interface.
pub const DEFAULT_BRIDGE: &str = "raind0";

/// Gateway address of the default bridge.
pub const DEFAULT_BRIDGE_ADDRESS: &str = "10.166.0.254/24";

/// Prefix of every container-side veth name.
pub const VETH_PREFIX: &str = "rd_";

/// Linux interface names are limited to 15 bytes.
pub const MAX_INTERFACE_NAME: usize = 15;

/// Host veth name for a container: `rd_` + id, truncated to 15 characters.
#[must_use]
pub fn veth_name(container_id: &str) -> String {
    format!("{VETH_PREFIX}{container_id}")
        .chars()
        .take(MAX_INTERFACE_NAME)
        .collect()
}

/// An IPv4 address with a prefix length, e.g. `10.166.0.254/24`.
///
/// The address part is kept as written, so the same type describes both a
/// subnet (`10.166.0.0/24`) and an interface address inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Build from parts.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `prefix > 32`.
    pub fn new(address: Ipv4Addr, prefix: u8) -> RaindResult<Self> {
        if prefix > 32 {
            return Err(RaindError::validation("cidr", format!("{address}/{prefix}")));
        }
        Ok(Self { address, prefix })
    }

    /// The address as written.
    #[must_use]
    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    const fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// Network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    /// Broadcast address.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !self.mask())
    }

    /// The subnet this address belongs to.
    #[must_use]
    pub fn subnet(&self) -> Self {
        Self {
            address: self.network(),
            prefix: self.prefix,
        }
    }

    /// Whether `ip` lies inside the subnet.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }

    /// Whether two subnets share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RaindError::validation("cidr", s.to_string());
        let (address, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(address, prefix).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Cidr {
    type Error = RaindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

/// One address handed to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Owning container.
    pub container_id: String,
    /// Host side veth name.
    pub veth_name: String,
    /// Port forwards installed for the container.
    #[serde(default)]
    pub forwards: Vec<Forward>,
    /// When the address was assigned.
    pub assigned_at: DateTime<Utc>,
}

/// An address pool bound to one bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Bridge interface name.
    pub interface: String,
    /// Pool subnet.
    pub subnet: Cidr,
    /// Gateway address configured on the bridge.
    pub address: Cidr,
    /// Allocations keyed by address.
    #[serde(default)]
    pub allocations: BTreeMap<Ipv4Addr, Allocation>,
}

impl Pool {
    /// A pool whose bridge carries `address`.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the address is the network or
    /// broadcast address of its own subnet, or the subnet has no host room.
    pub fn new(interface: impl Into<String>, address: Cidr) -> RaindResult<Self> {
        let interface = interface.into();
        if interface.is_empty() || interface.len() > MAX_INTERFACE_NAME {
            return Err(RaindError::validation("bridge name", interface));
        }
        if address.prefix() > 30 {
            return Err(RaindError::validation("bridge address", format!("{address}: subnet too small")));
        }
        let ip = address.address();
        if ip == address.network() || ip == address.broadcast() {
            return Err(RaindError::validation(
                "bridge address",
                format!("{address}: gateway must be a host address"),
            ));
        }
        Ok(Self {
            interface,
            subnet: address.subnet(),
            address,
            allocations: BTreeMap::new(),
        })
    }

    /// Gateway address.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.address.address()
    }

    /// Whether `ip` is one of the never-allocated addresses.
    #[must_use]
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.subnet.network() || ip == self.subnet.broadcast() || ip == self.gateway()
    }

    /// Lowest free host address.
    #[must_use]
    pub fn next_free(&self) -> Option<Ipv4Addr> {
        let first = u32::from(self.subnet.network()).checked_add(1)?;
        let last = u32::from(self.subnet.broadcast());
        (first..last)
            .map(Ipv4Addr::from)
            .find(|ip| !self.is_reserved(*ip) && !self.allocations.contains_key(ip))
    }

    fn allocation_of(&self, container_id: &str) -> Option<(Ipv4Addr, &Allocation)> {
        self.allocations
            .iter()
            .find(|(_, allocation)| allocation.container_id == container_id)
            .map(|(ip, allocation)| (*ip, allocation))
    }
}

/// Persisted IPAM state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpamDocument {
    /// Schema version.
    pub version: String,
    /// Pools keyed by bridge interface.
    #[serde(default)]
    pub pools: BTreeMap<String, Pool>,
}

impl Default for IpamDocument {
    fn default() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            pools: BTreeMap::new(),
        }
    }
}

impl Document for IpamDocument {
    const VERSION: &'static str = "1";
}

impl IpamDocument {
    fn find(&self, container_id: &str) -> Option<(&Pool, Ipv4Addr, &Allocation)> {
        self.pools.values().find_map(|pool| {
            pool.allocation_of(container_id)
                .map(|(ip, allocation)| (pool, ip, allocation))
        })
    }

    fn find_mut(&mut self, container_id: &str) -> Option<&mut Allocation> {
        self.pools.values_mut().find_map(|pool| {
            pool.allocations
                .values_mut()
                .find(|allocation| allocation.container_id == container_id)
        })
    }
}

/// What a container needs to configure its interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Bridge the veth is attached to.
    pub bridge: String,
    /// Container address.
    pub address: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix: u8,
    /// Gateway address.
    pub gateway: Ipv4Addr,
    /// Host side veth name.
    pub veth_name: String,
}

impl Assignment {
    /// `address/prefix`.
    #[must_use]
    pub fn address_cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix)
    }
}

/// File-backed IPAM store.
#[derive(Debug)]
pub struct IpamStore {
    store: JsonStore<IpamDocument>,
}

impl IpamStore {
    /// Open the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Ensure the default pool exists.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn bootstrap(&self) -> RaindResult<()> {
        let address: Cidr = DEFAULT_BRIDGE_ADDRESS.parse()?;
        self.store.update(|doc| {
            if !doc.pools.contains_key(DEFAULT_BRIDGE) {
                tracing::info!(bridge = DEFAULT_BRIDGE, %address, "Initializing default address pool");
                doc.pools
                    .insert(DEFAULT_BRIDGE.to_string(), Pool::new(DEFAULT_BRIDGE, address)?);
            }
            Ok(())
        })
    }

    /// Register a pool for a new bridge.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Conflict`] when the bridge exists or the subnet
    /// overlaps another pool.
    pub fn add_pool(&self, interface: &str, address: Cidr) -> RaindResult<Pool> {
        let pool = Pool::new(interface, address)?;
        self.store.update(|doc| {
            if doc.pools.contains_key(interface) {
                return Err(RaindError::Conflict {
                    message: format!("bridge {interface} already exists"),
                });
            }
            if let Some(other) = doc.pools.values().find(|p| p.subnet.overlaps(&pool.subnet)) {
                return Err(RaindError::Conflict {
                    message: format!(
                        "subnet {} overlaps {} of bridge {}",
                        pool.subnet, other.subnet, other.interface
                    ),
                });
            }
            doc.pools.insert(interface.to_string(), pool.clone());
            Ok(pool)
        })
    }

    /// Unregister a pool.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bridges and
    /// [`RaindError::Conflict`] when addresses are still allocated.
    pub fn remove_pool(&self, interface: &str) -> RaindResult<Pool> {
        self.store.update(|doc| {
            let pool = doc
                .pools
                .get(interface)
                .ok_or_else(|| RaindError::not_found("bridge", interface))?;
            if !pool.allocations.is_empty() {
                return Err(RaindError::Conflict {
                    message: format!(
                        "bridge {interface} still has {} allocated addresses",
                        pool.allocations.len()
                    ),
                });
            }
            doc.pools
                .remove(interface)
                .ok_or_else(|| RaindError::not_found("bridge", interface))
        })
    }

    /// All pools.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn pools(&self) -> RaindResult<Vec<Pool>> {
        self.store.read(|doc| Ok(doc.pools.values().cloned().collect()))
    }

    /// One pool.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bridges.
    pub fn pool(&self, interface: &str) -> RaindResult<Pool> {
        self.store.read(|doc| {
            doc.pools
                .get(interface)
                .cloned()
                .ok_or_else(|| RaindError::not_found("bridge", interface))
        })
    }

    /// Names of all bridges with a pool.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn bridges(&self) -> RaindResult<Vec<String>> {
        self.store.read(|doc| Ok(doc.pools.keys().cloned().collect()))
    }

    /// Allocate the lowest free address of `interface` to `container_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bridges,
    /// [`RaindError::Conflict`] when the container already holds an address and
    /// [`RaindError::Exhausted`] when the pool is full.
    pub fn allocate(&self, interface: &str, container_id: &str) -> RaindResult<Assignment> {
        self.store.update(|doc| {
            if let Some((pool, ip, _)) = doc.find(container_id) {
                return Err(RaindError::Conflict {
                    message: format!(
                        "container {container_id} already holds {ip} on {}",
                        pool.interface
                    ),
                });
            }
            let pool = doc
                .pools
                .get_mut(interface)
                .ok_or_else(|| RaindError::not_found("bridge", interface))?;
            let address = pool.next_free().ok_or_else(|| RaindError::Exhausted {
                message: format!("no free address in {} ({})", pool.subnet, pool.interface),
            })?;
            let veth = veth_name(container_id);
            pool.allocations.insert(
                address,
                Allocation {
                    container_id: container_id.to_string(),
                    veth_name: veth.clone(),
                    forwards: Vec::new(),
                    assigned_at: Utc::now(),
                },
            );
            tracing::debug!(container_id, %address, bridge = interface, "Allocated address");
            Ok(Assignment {
                bridge: pool.interface.clone(),
                address,
                prefix: pool.subnet.prefix(),
                gateway: pool.gateway(),
                veth_name: veth,
            })
        })
    }

    /// Release the address held by `container_id`, returning the allocation
    /// that was dropped.
    ///
    /// # Errors
    ///
    /// Returns store errors. Releasing a container without an address is not
    /// an error.
    pub fn release(&self, container_id: &str) -> RaindResult<Option<(Ipv4Addr, Allocation)>> {
        self.store.update(|doc| {
            for pool in doc.pools.values_mut() {
                let held = pool.allocation_of(container_id).map(|(ip, _)| ip);
                if let Some(ip) = held {
                    tracing::debug!(container_id, %ip, bridge = %pool.interface, "Released address");
                    return Ok(pool.allocations.remove(&ip).map(|allocation| (ip, allocation)));
                }
            }
            Ok(None)
        })
    }

    /// Where `container_id` is attached.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when the container holds no address.
    pub fn lookup(&self, container_id: &str) -> RaindResult<Assignment> {
        self.store.read(|doc| {
            doc.find(container_id)
                .map(|(pool, address, allocation)| Assignment {
                    bridge: pool.interface.clone(),
                    address,
                    prefix: pool.subnet.prefix(),
                    gateway: pool.gateway(),
                    veth_name: allocation.veth_name.clone(),
                })
                .ok_or_else(|| RaindError::not_found("address of container", container_id))
        })
    }

    /// Append port-forward records to the container's allocation.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] when the container holds no address.
    pub fn add_forwards(&self, container_id: &str, forwards: &[Forward]) -> RaindResult<()> {
        self.store.update(|doc| {
            let allocation = doc
                .find_mut(container_id)
                .ok_or_else(|| RaindError::not_found("address of container", container_id))?;
            allocation.forwards.extend_from_slice(forwards);
            Ok(())
        })
    }

    /// Remove and return the container's port-forward records.
    ///
    /// # Errors
    ///
    /// Returns store errors; a container without an address has no forwards.
    pub fn take_forwards(&self, container_id: &str) -> RaindResult<Vec<Forward>> {
        self.store.update(|doc| {
            Ok(doc
                .find_mut(container_id)
                .map(|allocation| std::mem::take(&mut allocation.forwards))
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, IpamStore) {
        let dir = TempDir::new().unwrap();
        let store = IpamStore::new(dir.path().join("ipam.json"));
        store.bootstrap().unwrap();
        (dir, store)
    }

    #[test]
    fn cidr_arithmetic() {
        let cidr: Cidr = "10.166.0.254/24".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 166, 0, 0));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(10, 166, 0, 255));
        assert_eq!(cidr.subnet().to_string(), "10.166.0.0/24");
        assert!(cidr.contains(Ipv4Addr::new(10, 166, 0, 7)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 167, 0, 7)));
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0".parse::<Cidr>().is_err());
    }

    #[test]
    fn bootstrap_creates_default_pool_once() {
        let (_dir, store) = store();
        store.bootstrap().unwrap();
        let pools = store.pools().unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].interface, "raind0");
        assert_eq!(pools[0].subnet.to_string(), "10.166.0.0/24");
        assert_eq!(pools[0].gateway(), Ipv4Addr::new(10, 166, 0, 254));
    }

    #[test]
    fn allocates_lowest_free_address() {
        let (_dir, store) = store();
        let a = store.allocate("raind0", "aaaaaaaaaaaa").unwrap();
        let b = store.allocate("raind0", "bbbbbbbbbbbb").unwrap();
        assert_eq!(a.address, Ipv4Addr::new(10, 166, 0, 1));
        assert_eq!(b.address, Ipv4Addr::new(10, 166, 0, 2));
        assert_eq!(a.gateway, Ipv4Addr::new(10, 166, 0, 254));
        assert_eq!(a.veth_name, "rd_aaaaaaaaaaaa");
        assert_eq!(a.address_cidr(), "10.166.0.1/24");

        store.release("aaaaaaaaaaaa").unwrap();
        let c = store.allocate("raind0", "cccccccccccc").unwrap();
        assert_eq!(c.address, Ipv4Addr::new(10, 166, 0, 1));
    }

    #[test]
    fn one_allocation_per_container() {
        let (_dir, store) = store();
        store.add_pool("raind1", "10.167.0.1/24".parse().unwrap()).unwrap();
        store.allocate("raind0", "abc").unwrap();
        let err = store.allocate("raind1", "abc").unwrap_err();
        assert!(matches!(err, RaindError::Conflict { .. }));
    }

    #[test]
    fn exhausted_pool() {
        let (_dir, store) = store();
        // /30: network .0, hosts .1 .2, broadcast .3; gateway takes .1
        store.add_pool("tiny", "192.168.9.1/30".parse().unwrap()).unwrap();
        assert_eq!(
            store.allocate("tiny", "one").unwrap().address,
            Ipv4Addr::new(192, 168, 9, 2)
        );
        let err = store.allocate("tiny", "two").unwrap_err();
        assert!(matches!(err, RaindError::Exhausted { .. }));
    }

    #[test]
    fn forwards_follow_the_allocation() {
        let (_dir, store) = store();
        store.allocate("raind0", "abc").unwrap();
        store
            .add_forwards("abc", &["8080:80".parse().unwrap(), "5353:53:udp".parse().unwrap()])
            .unwrap();
        assert_eq!(store.take_forwards("abc").unwrap().len(), 2);
        assert!(store.take_forwards("abc").unwrap().is_empty());
        assert!(store.add_forwards("nobody", &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn pool_removal_requires_no_allocations() {
        let (_dir, store) = store();
        store.add_pool("raind1", "10.167.0.1/24".parse().unwrap()).unwrap();
        store.allocate("raind1", "abc").unwrap();
        assert!(matches!(
            store.remove_pool("raind1").unwrap_err(),
            RaindError::Conflict { .. }
        ));
        store.release("abc").unwrap();
        store.remove_pool("raind1").unwrap();
        assert!(store.pool("raind1").unwrap_err().is_not_found());
    }

    #[test]
    fn overlapping_pools_are_rejected() {
        let (_dir, store) = store();
        let err = store
            .add_pool("raind1", "10.166.0.1/16".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, RaindError::Conflict { .. }));
        assert!(store.add_pool("raind0", "10.170.0.1/24".parse().unwrap()).is_err());
    }

    #[test]
    fn lookup_reports_attachment() {
        let (_dir, store) = store();
        store.allocate("raind0", "abc").unwrap();
        let found = store.lookup("abc").unwrap();
        assert_eq!(found.bridge, "raind0");
        assert_eq!(found.veth_name, "rd_abc");
        assert!(store.lookup("zzz").unwrap_err().is_not_found());
    }

    proptest! {
        #[test]
        fn veth_names_fit_interface_limit(id in "[a-z0-9]{1,64}") {
            let name = veth_name(&id);
            prop_assert!(name.len() <= MAX_INTERFACE_NAME);
            prop_assert!(name.starts_with(VETH_PREFIX));
        }

        #[test]
        fn allocations_avoid_reserved_addresses(gateway_host in 1u8..15, count in 1usize..14) {
            let dir = TempDir::new().unwrap();
            let store = IpamStore::new(dir.path().join("ipam.json"));
            let address = Cidr::new(Ipv4Addr::new(172, 30, 0, gateway_host), 28).unwrap();
            let pool = store.add_pool("p0", address).unwrap();

            let mut seen = HashSet::new();
            for n in 0..count {
                let assigned = store.allocate("p0", &format!("c{n}")).unwrap();
                prop_assert!(pool.subnet.contains(assigned.address));
                prop_assert!(!pool.is_reserved(assigned.address));
                prop_assert!(seen.insert(assigned.address));
            }
        }
    }
}
