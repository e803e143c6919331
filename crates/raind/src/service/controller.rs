//! Service endpoint controller.
//!
//! Resolves each service's selector to the infra containers of matching
//! pods and renders one NAT chain per service port. A chain spreads new
//! connections over the endpoints with a ladder of `statistic` rules: rule
//! `i` of `n` matches with probability `1 / (n - i)`, the last rule always,
//! so every endpoint receives `1 / n` of the traffic.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use raind_common::RaindResult;
use raind_network::netfilter::{Match, Position, Rule, Table, Target};
use raind_network::{IpamStore, Netfilter, Protocol};
use tokio_util::sync::CancellationToken;

use super::model::{L4Service, ServicePort, ServiceSpec};
use super::store::ServiceStore;
use crate::pod::PodStore;
use crate::runtime::ContainerStore;

/// Built-in NAT chains that jump into service chains.
const JUMP_CHAINS: [&str; 2] = ["PREROUTING", "OUTPUT"];

/// Selection probabilities for `n` endpoints; the last endpoint takes the
/// remainder unconditionally and has no entry.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn probabilities(n: usize) -> Vec<f64> {
    (0..n.saturating_sub(1))
        .map(|i| 1.0 / (n - i) as f64)
        .collect()
}

/// Chain of one service port, `RAIND-SVC-<first 8 of the service id>-<port>`.
/// Service ids are UUIDv4 and the store keeps their prefixes distinct.
#[must_use]
pub fn chain_name(service_id: &str, port: u16) -> String {
    let prefix: String = service_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("RAIND-SVC-{prefix}-{port}")
}

/// A selected pod's infra container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    /// Address on the bridge.
    pub address: Ipv4Addr,
    /// Bridge the infra container is attached to.
    pub bridge: String,
    /// Pod the endpoint belongs to.
    pub pod_id: String,
}

/// What is installed for one service.
#[derive(Debug, Clone, Default)]
struct Installed {
    key: String,
    chains: Vec<(String, Protocol, u16)>,
    forwards: Vec<Rule>,
}

/// Keeps service chains in line with pod endpoints.
pub struct ServiceController {
    services: Arc<ServiceStore>,
    pods: Arc<PodStore>,
    containers: Arc<ContainerStore>,
    ipam: Arc<IpamStore>,
    netfilter: Arc<dyn Netfilter>,
    infra_prefix: String,
    interval: Duration,
    installed: DashMap<String, Installed>,
}

impl ServiceController {
    /// Create a controller.
    pub fn new(
        services: Arc<ServiceStore>,
        pods: Arc<PodStore>,
        containers: Arc<ContainerStore>,
        ipam: Arc<IpamStore>,
        netfilter: Arc<dyn Netfilter>,
        infra_prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            services,
            pods,
            containers,
            ipam,
            netfilter,
            infra_prefix: infra_prefix.into(),
            interval,
            installed: DashMap::new(),
        }
    }

    /// Register a service; rules follow on the next tick.
    ///
    /// # Errors
    ///
    /// Returns validation errors and [`raind_common::RaindError::AlreadyUsed`].
    pub fn create(&self, mut spec: ServiceSpec) -> RaindResult<L4Service> {
        spec.normalize()?;
        let service = self.services.create(spec)?;
        tracing::info!(service_id = %service.service_id, name = %service.spec.name, "Service created");
        Ok(service)
    }

    /// All services.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<L4Service>> {
        self.services.list()
    }

    /// One service by name or id.
    ///
    /// # Errors
    ///
    /// Returns [`raind_common::RaindError::NotFound`] for unknown services.
    pub fn get(&self, name_or_id: &str) -> RaindResult<L4Service> {
        self.services.resolve(name_or_id)
    }

    /// Remove a service and its rules.
    ///
    /// # Errors
    ///
    /// Returns [`raind_common::RaindError::NotFound`] or packet-filter errors.
    pub async fn delete(&self, name_or_id: &str) -> RaindResult<()> {
        let service = self.services.resolve(name_or_id)?;
        self.services.remove(&service.service_id)?;
        self.collect().await?;
        tracing::info!(service_id = %service.service_id, name = %service.spec.name, "Service deleted");
        Ok(())
    }

    /// Current endpoints of `service`, sorted by address.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn endpoints(&self, service: &ServiceSpec) -> RaindResult<Vec<Endpoint>> {
        let mut endpoints = Vec::new();
        for pod in self.pods.pods_in(&service.namespace)? {
            if !service.selects(&pod.labels) {
                continue;
            }
            let infra = self
                .containers
                .list_by_pod(&pod.pod_id)?
                .into_iter()
                .find(|record| record.name.starts_with(self.infra_prefix.as_str()));
            let Some(infra) = infra else {
                continue;
            };
            match self.ipam.lookup(&infra.container_id) {
                Ok(assignment) => endpoints.push(Endpoint {
                    address: assignment.address,
                    bridge: assignment.bridge,
                    pod_id: pod.pod_id,
                }),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        endpoints.sort();
        endpoints.dedup_by(|a, b| a.address == b.address);
        Ok(endpoints)
    }

    /// Reconcile every service once; returns the ids whose rules changed.
    ///
    /// # Errors
    ///
    /// Returns store errors; a service whose rules fail to install is logged
    /// and retried next tick.
    pub async fn tick(&self) -> RaindResult<Vec<String>> {
        let mut changed = Vec::new();
        for service in self.services.list()? {
            let endpoints = self.endpoints(&service.spec)?;
            let key = change_key(&service.spec.ports, &endpoints);
            let unchanged = self
                .installed
                .get(&service.service_id)
                .is_some_and(|installed| installed.key == key);
            if unchanged {
                continue;
            }
            match self.install(&service, &endpoints, key).await {
                Ok(()) => changed.push(service.service_id),
                Err(err) => {
                    tracing::warn!(service_id = %service.service_id, error = %err, "Installing service rules failed");
                }
            }
        }
        self.collect().await?;
        Ok(changed)
    }

    async fn install(&self, service: &L4Service, endpoints: &[Endpoint], key: String) -> RaindResult<()> {
        let previous = self
            .installed
            .get(&service.service_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let mut installed = Installed {
            key,
            ..Installed::default()
        };

        match self.render(service, endpoints, &previous, &mut installed).await {
            Ok(()) => {
                tracing::info!(
                    service_id = %service.service_id,
                    name = %service.spec.name,
                    endpoints = endpoints.len(),
                    "Service rules installed"
                );
                self.installed.insert(service.service_id.clone(), installed);
                Ok(())
            }
            Err(err) => {
                // Track the union with an empty key so the next tick retries
                // and clears whatever made it in.
                let mut tracked = previous;
                tracked.key.clear();
                for chain in installed.chains {
                    if !tracked.chains.contains(&chain) {
                        tracked.chains.push(chain);
                    }
                }
                for rule in installed.forwards {
                    if !tracked.forwards.contains(&rule) {
                        tracked.forwards.push(rule);
                    }
                }
                self.installed.insert(service.service_id.clone(), tracked);
                Err(err)
            }
        }
    }

    async fn render(
        &self,
        service: &L4Service,
        endpoints: &[Endpoint],
        previous: &Installed,
        installed: &mut Installed,
    ) -> RaindResult<()> {
        for port in &service.spec.ports {
            let chain = chain_name(&service.service_id, port.port);
            installed.chains.push((chain.clone(), port.protocol, port.port));
            self.netfilter.reset_chain(Table::Nat, &chain).await?;
            for jump_chain in JUMP_CHAINS {
                self.netfilter
                    .ensure_rule(&jump(jump_chain, &chain, port.protocol, port.port), Position::Insert(1))
                    .await?;
            }

            let ladder = probabilities(endpoints.len());
            for (index, endpoint) in endpoints.iter().enumerate() {
                let rule = Rule::nat(&chain, Target::Dnat(format!("{}:{}", endpoint.address, port.target_port)))
                    .with(Match::Protocol(port.protocol))
                    .with_opt(ladder.get(index).copied().map(Match::RandomProbability));
                self.netfilter.add_rule(&rule, Position::Append).await?;
                installed
                    .forwards
                    .extend(forward_rules(&service.service_id, endpoint.address, port));
            }
            tracing::debug!(chain = %chain, endpoints = endpoints.len(), "Service chain rendered");
        }

        for rule in &installed.forwards {
            self.netfilter.ensure_rule(rule, Position::Append).await?;
        }
        for rule in previous.forwards.iter().filter(|rule| !installed.forwards.contains(rule)) {
            self.netfilter.remove_rule(rule).await?;
        }
        for stale in previous
            .chains
            .iter()
            .filter(|chain| !installed.chains.contains(chain))
        {
            self.remove_chain(stale).await?;
        }
        Ok(())
    }

    /// Remove the rules of services that no longer exist.
    async fn collect(&self) -> RaindResult<()> {
        let live: BTreeSet<String> = self
            .services
            .list()?
            .into_iter()
            .map(|service| service.service_id)
            .collect();
        let gone: Vec<String> = self
            .installed
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !live.contains(id))
            .collect();
        for service_id in gone {
            let Some(installed) = self
                .installed
                .get(&service_id)
                .map(|entry| entry.value().clone())
            else {
                continue;
            };
            for chain in &installed.chains {
                self.remove_chain(chain).await?;
            }
            for rule in &installed.forwards {
                self.netfilter.remove_rule(rule).await?;
            }
            self.installed.remove(&service_id);
            tracing::info!(service_id = %service_id, "Service rules removed");
        }
        Ok(())
    }

    async fn remove_chain(&self, (chain, protocol, port): &(String, Protocol, u16)) -> RaindResult<()> {
        for jump_chain in JUMP_CHAINS {
            self.netfilter
                .remove_rule(&jump(jump_chain, chain, *protocol, *port))
                .await?;
        }
        self.netfilter.delete_chain(Table::Nat, chain).await
    }

    /// Reconcile at the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(interval = ?self.interval, "Service controller started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "Service controller tick failed");
                    }
                }
            }
        }
        tracing::debug!("Service controller stopped");
    }
}

fn jump(from: &str, chain: &str, protocol: Protocol, port: u16) -> Rule {
    Rule::nat(from, Target::Jump(chain.to_string()))
        .with(Match::Protocol(protocol))
        .with(Match::DestinationPort(port))
}

/// Forward rules for one endpoint, tagged with the owning service so that
/// services sharing an endpoint and port keep separate rules.
fn forward_rules(service_id: &str, address: Ipv4Addr, port: &ServicePort) -> [Rule; 2] {
    let tag = format!("raind-svc {service_id}");
    [
        Rule::filter("FORWARD", Target::Accept)
            .with(Match::Destination(address.to_string()))
            .with(Match::Protocol(port.protocol))
            .with(Match::DestinationPort(port.target_port))
            .comment(tag.clone()),
        Rule::filter("FORWARD", Target::Accept)
            .with(Match::Source(address.to_string()))
            .with(Match::Protocol(port.protocol))
            .with(Match::SourcePort(port.target_port))
            .comment(tag),
    ]
}

fn change_key(ports: &[ServicePort], endpoints: &[Endpoint]) -> String {
    let mut parts: Vec<String> = ports
        .iter()
        .map(|p| format!("{}:{}/{}", p.port, p.target_port, p.protocol))
        .collect();
    parts.sort();
    parts.extend(endpoints.iter().map(|e| e.address.to_string()));
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ladder_for_three() {
        let ladder = probabilities(3);
        assert_eq!(ladder.len(), 2);
        assert!((ladder[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((ladder[1] - 0.5).abs() < 1e-12);
        assert!(probabilities(1).is_empty());
        assert!(probabilities(0).is_empty());
    }

    #[test]
    fn chain_names_use_id_prefix() {
        assert_eq!(
            chain_name("9f1c2a7e-c3d4-4e5f-8a9b-0c1d2e3f4a5b", 80),
            "RAIND-SVC-9f1c2a7e-80"
        );
    }

    proptest! {
        #[test]
        fn ladder_is_uniform(n in 1usize..64) {
            let ladder = probabilities(n);
            let mut remaining = 1.0f64;
            #[allow(clippy::cast_precision_loss)]
            let share = 1.0 / n as f64;
            for p in &ladder {
                prop_assert!((remaining * p - share).abs() < 1e-9);
                remaining *= 1.0 - p;
            }
            // the unconditional last rule takes what is left
            prop_assert!((remaining - share).abs() < 1e-9);
        }
    }
}
