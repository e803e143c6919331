//! Linux bridge management.
//!
//! [`BridgeManager`] drives `ip` for the host side; [`NetworkService`] pairs it
//! with the IPAM store so a bridge and its address pool come and go together.

use std::sync::Arc;

use raind_common::exec::argv;
use raind_common::{CommandRunner, RaindResult};
use serde::Serialize;

use crate::ipam::{Cidr, IpamStore, Pool};

/// Bridge manager for container networking.
#[derive(Clone)]
pub struct BridgeManager {
    runner: Arc<dyn CommandRunner>,
}

impl BridgeManager {
    /// Create a manager over a command runner.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Check if a bridge exists.
    ///
    /// # Errors
    ///
    /// Returns an error when `ip` cannot be spawned.
    pub async fn exists(&self, name: &str) -> RaindResult<bool> {
        Ok(self
            .runner
            .output("ip", &argv(&["link", "show", name]))
            .await?
            .success)
    }

    /// Create the bridge if missing, assign `address` and bring it up.
    ///
    /// # Errors
    ///
    /// Returns the failing `ip` invocation.
    pub async fn ensure(&self, name: &str, address: &Cidr) -> RaindResult<()> {
        if self.exists(name).await? {
            tracing::debug!(name, "Bridge already present");
        } else {
            tracing::debug!(name, "Creating bridge");
            self.runner
                .run("ip", &argv(&["link", "add", "name", name, "type", "bridge"]))
                .await?;
        }

        let address = address.to_string();
        let assigned = self
            .runner
            .output("ip", &argv(&["addr", "add", &address, "dev", name]))
            .await?;
        if !assigned.success {
            // "File exists" when the address is already configured
            tracing::debug!(name, %address, output = %assigned.output.trim(), "Address not added");
        }

        self.runner
            .run("ip", &argv(&["link", "set", name, "up"]))
            .await?;
        tracing::info!(name, %address, "Bridge ready");
        Ok(())
    }

    /// Delete the bridge. A missing bridge is not an error.
    ///
    /// # Errors
    ///
    /// Returns the failing `ip` invocation.
    pub async fn delete(&self, name: &str) -> RaindResult<()> {
        if !self.exists(name).await? {
            tracing::debug!(name, "Bridge already gone");
            return Ok(());
        }
        self.runner
            .run("ip", &argv(&["link", "delete", name, "type", "bridge"]))
            .await?;
        tracing::info!(name, "Bridge deleted");
        Ok(())
    }
}

/// Summary of a bridge and its pool.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeInfo {
    /// Interface name.
    pub interface: String,
    /// Subnet.
    pub subnet: String,
    /// Gateway address with prefix.
    pub address: String,
    /// Number of allocated addresses.
    pub allocated: usize,
}

impl From<&Pool> for BridgeInfo {
    fn from(pool: &Pool) -> Self {
        Self {
            interface: pool.interface.clone(),
            subnet: pool.subnet.to_string(),
            address: pool.address.to_string(),
            allocated: pool.allocations.len(),
        }
    }
}

/// Bridge CRUD with IPAM bookkeeping.
#[derive(Clone)]
pub struct NetworkService {
    ipam: Arc<IpamStore>,
    bridges: BridgeManager,
}

impl NetworkService {
    /// Create the service.
    pub fn new(ipam: Arc<IpamStore>, bridges: BridgeManager) -> Self {
        Self { ipam, bridges }
    }

    /// Bring up the host bridge of every registered pool, creating the
    /// default pool first.
    ///
    /// # Errors
    ///
    /// Returns store or `ip` errors.
    pub async fn bootstrap(&self) -> RaindResult<()> {
        self.ipam.bootstrap()?;
        for pool in self.ipam.pools()? {
            self.bridges.ensure(&pool.interface, &pool.address).await?;
        }
        Ok(())
    }

    /// Register a pool and create its bridge. The pool is dropped again when
    /// the bridge cannot be created.
    ///
    /// # Errors
    ///
    /// Returns validation, conflict or `ip` errors.
    pub async fn create(&self, interface: &str, address: &str) -> RaindResult<BridgeInfo> {
        let address: Cidr = address.parse()?;
        let pool = self.ipam.add_pool(interface, address)?;
        if let Err(err) = self.bridges.ensure(interface, &address).await {
            if let Err(undo) = self.ipam.remove_pool(interface) {
                tracing::warn!(interface, error = %undo, "Failed to drop pool after bridge error");
            }
            return Err(err);
        }
        Ok(BridgeInfo::from(&pool))
    }

    /// Delete a bridge whose pool has no allocations.
    ///
    /// # Errors
    ///
    /// Returns not-found, conflict or `ip` errors.
    pub async fn delete(&self, interface: &str) -> RaindResult<()> {
        self.ipam.remove_pool(interface)?;
        self.bridges.delete(interface).await
    }

    /// All bridges.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<BridgeInfo>> {
        Ok(self.ipam.pools()?.iter().map(BridgeInfo::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use raind_common::{CommandOutput, RaindError, RecordingRunner};
    use tempfile::TempDir;

    use super::*;

    fn service() -> (TempDir, Arc<RecordingRunner>, NetworkService) {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ipam = Arc::new(IpamStore::new(dir.path().join("ipam.json")));
        let service = NetworkService::new(ipam, BridgeManager::new(runner.clone()));
        (dir, runner, service)
    }

    #[tokio::test]
    async fn creates_missing_bridge() {
        let (_dir, runner, service) = service();
        runner.respond("link show br1", CommandOutput::failed(1, "Device does not exist"));

        let info = service.create("br1", "10.170.0.1/24").await.unwrap();
        assert_eq!(info.subnet, "10.170.0.0/24");

        let lines = runner.command_lines();
        assert!(lines.contains(&"ip link add name br1 type bridge".to_string()));
        assert!(lines.contains(&"ip addr add 10.170.0.1/24 dev br1".to_string()));
        assert!(lines.contains(&"ip link set br1 up".to_string()));
    }

    #[tokio::test]
    async fn failed_bridge_drops_pool() {
        let (_dir, runner, service) = service();
        runner.fail_on("link set br1 up");

        assert!(service.create("br1", "10.170.0.1/24").await.is_err());
        assert!(service.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_refuses_busy_pool() {
        let (dir, _runner, service) = service();
        service.bootstrap().await.unwrap();
        let ipam = IpamStore::new(dir.path().join("ipam.json"));
        ipam.allocate("raind0", "abc").unwrap();

        let err = service.delete("raind0").await.unwrap_err();
        assert!(matches!(err, RaindError::Conflict { .. }));
    }
}
