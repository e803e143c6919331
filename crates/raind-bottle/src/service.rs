//! Bottle lifecycle over the container engine and the policy compiler.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use raind::runtime::{ContainerEngine, CreateRequest};
use raind_common::id::entity_id;
use raind_common::{RaindError, RaindResult};
use raind_network::PolicyCompiler;
use raind_network::policy::{Endpoint, PolicyRequest};
use raind_oci::ContainerStatus;

use crate::env;
use crate::order::start_order;
use crate::spec::{BottleSpec, PolicySpec};
use crate::store::{Bottle, BottlePolicy, BottleStore};

/// Creates, starts, stops and deletes bottles.
pub struct BottleService {
    engine: Arc<ContainerEngine>,
    policies: Arc<PolicyCompiler>,
    store: Arc<BottleStore>,
}

impl BottleService {
    /// Create the service.
    pub const fn new(
        engine: Arc<ContainerEngine>,
        policies: Arc<PolicyCompiler>,
        store: Arc<BottleStore>,
    ) -> Self {
        Self {
            engine,
            policies,
            store,
        }
    }

    /// The bottle store.
    #[must_use]
    pub const fn store(&self) -> &Arc<BottleStore> {
        &self.store
    }

    /// Create a bottle from YAML: order its services, install its policies,
    /// record it and create one container per service.
    ///
    /// # Errors
    ///
    /// Returns validation errors for a bad spec, [`RaindError::Conflict`] on
    /// dependency cycles, [`RaindError::AlreadyUsed`] for a taken name, or
    /// the first failing policy or container operation. Policies and
    /// containers created before the failure are removed again.
    pub async fn create(&self, yaml: &str) -> RaindResult<Bottle> {
        let spec = BottleSpec::from_yaml(yaml)?;
        let order = start_order(&spec.services)?;
        let name = spec.bottle.name.clone();
        if self.store.is_name_already_used(&name)? {
            return Err(RaindError::AlreadyUsed {
                kind: "bottle",
                name,
            });
        }

        let policies = self.apply_policies(&spec).await?;
        let mut bottle = Bottle {
            bottle_id: entity_id(),
            bottle_name: name,
            services: spec.services.clone(),
            start_order: order,
            containers: BTreeMap::new(),
            policies,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert(bottle.clone()) {
            self.withdraw_policies(&bottle.policies).await;
            return Err(err);
        }

        match self.create_containers(&spec, &bottle).await {
            Ok(containers) => {
                self.store.set_containers(&bottle.bottle_id, containers.clone())?;
                bottle.containers = containers;
            }
            Err(err) => {
                self.store.set_containers(&bottle.bottle_id, BTreeMap::new())?;
                return Err(err);
            }
        }

        if !bottle.policies.is_empty() {
            let report = self.policies.commit().await?;
            tracing::debug!(bottle = %bottle.bottle_name, ?report, "Bottle policies committed");
        }
        tracing::info!(
            bottle_id = %bottle.bottle_id,
            bottle = %bottle.bottle_name,
            order = ?bottle.start_order,
            "Bottle created"
        );
        Ok(bottle)
    }

    async fn apply_policies(&self, spec: &BottleSpec) -> RaindResult<Vec<BottlePolicy>> {
        let mut applied = Vec::with_capacity(spec.policies.len());
        for policy in &spec.policies {
            let request = policy_request(spec, policy);
            match self.policies.add(request).await {
                Ok(stored) => applied.push(BottlePolicy {
                    id: stored.id,
                    kind: policy.kind,
                }),
                Err(err) => {
                    tracing::warn!(bottle = %spec.bottle.name, error = %err, "Bottle policy rejected, rolling back");
                    self.withdraw_policies(&applied).await;
                    return Err(err);
                }
            }
        }
        Ok(applied)
    }

    async fn withdraw_policies(&self, policies: &[BottlePolicy]) {
        for policy in policies {
            if let Err(err) = self.policies.remove(&policy.id).await {
                tracing::warn!(policy_id = %policy.id, error = %err, "Failed to withdraw bottle policy");
            }
        }
    }

    async fn create_containers(
        &self,
        spec: &BottleSpec,
        bottle: &Bottle,
    ) -> RaindResult<BTreeMap<String, String>> {
        let mut created: BTreeMap<String, String> = BTreeMap::new();
        for service in &bottle.start_order {
            match self.create_container(spec, bottle, service, &created).await {
                Ok(id) => {
                    created.insert(service.clone(), id);
                }
                Err(err) => {
                    tracing::warn!(bottle = %bottle.bottle_name, service = %service, error = %err, "Bottle container failed, rolling back");
                    for id in created.values() {
                        if let Err(cleanup) = self.engine.delete(id).await {
                            tracing::warn!(container_id = %id, error = %cleanup, "Failed to delete bottle container");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(created)
    }

    async fn create_container(
        &self,
        spec: &BottleSpec,
        bottle: &Bottle,
        service: &str,
        created: &BTreeMap<String, String>,
    ) -> RaindResult<String> {
        let definition = &spec.services[service];
        let mut addresses: BTreeMap<String, Ipv4Addr> = BTreeMap::new();
        for dep in &definition.depends_on {
            if let Some(id) = created.get(dep) {
                addresses.insert(dep.clone(), self.engine.address(id)?);
            }
        }

        let mut request = CreateRequest::new(definition.image.clone());
        request.name = Some(spec.container_name(service));
        request.command.clone_from(&definition.command);
        request.port.clone_from(&definition.ports);
        request.mount.clone_from(&definition.mounts);
        request.network.clone_from(&definition.network);
        request.tty = definition.tty;
        request.env = env::rewrite(&definition.env, &addresses);
        request.bottle_id = Some(bottle.bottle_id.clone());

        let record = self.engine.create(request).await?;
        Ok(record.container_id)
    }

    /// Start every container in dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bottles or the first
    /// failing start.
    pub async fn start(&self, name_or_id: &str) -> RaindResult<Bottle> {
        let bottle = self.store.resolve(name_or_id)?;
        for service in &bottle.start_order {
            let Some(id) = bottle.containers.get(service) else {
                continue;
            };
            let record = self.engine.get(id)?;
            if matches!(record.state, ContainerStatus::Created | ContainerStatus::Stopped) {
                self.engine.start(id).await?;
                self.engine.wait_for(id, ContainerStatus::Running).await?;
            }
        }
        tracing::info!(bottle = %bottle.bottle_name, "Bottle started");
        Ok(bottle)
    }

    /// Stop running containers in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bottles or the first
    /// failing stop.
    pub async fn stop(&self, name_or_id: &str) -> RaindResult<Bottle> {
        let bottle = self.store.resolve(name_or_id)?;
        for service in bottle.start_order.iter().rev() {
            let Some(id) = bottle.containers.get(service) else {
                continue;
            };
            self.stop_container(id).await?;
        }
        tracing::info!(bottle = %bottle.bottle_name, "Bottle stopped");
        Ok(bottle)
    }

    async fn stop_container(&self, id: &str) -> RaindResult<()> {
        let record = match self.engine.get(id) {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        if record.state == ContainerStatus::Running {
            self.engine.stop(id).await?;
            self.engine.wait_for(id, ContainerStatus::Stopped).await?;
        }
        Ok(())
    }

    /// Delete containers in reverse dependency order, then the bottle's
    /// policies and its record.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bottles or the first
    /// failing step.
    pub async fn delete(&self, name_or_id: &str) -> RaindResult<()> {
        let bottle = self.store.resolve(name_or_id)?;
        for service in bottle.start_order.iter().rev() {
            let Some(id) = bottle.containers.get(service) else {
                continue;
            };
            self.stop_container(id).await?;
            match self.engine.delete(id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        if !bottle.policies.is_empty() {
            for policy in &bottle.policies {
                match self.policies.remove(&policy.id).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
            self.policies.commit().await?;
        }
        self.store.remove(&bottle.bottle_id)?;
        tracing::info!(bottle_id = %bottle.bottle_id, bottle = %bottle.bottle_name, "Bottle deleted");
        Ok(())
    }

    /// All bottles.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn list(&self) -> RaindResult<Vec<Bottle>> {
        self.store.list()
    }

    /// One bottle by name or id.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::NotFound`] for unknown bottles.
    pub fn get(&self, name_or_id: &str) -> RaindResult<Bottle> {
        self.store.resolve(name_or_id)
    }
}

fn policy_request(spec: &BottleSpec, policy: &PolicySpec) -> PolicyRequest {
    let destination = if policy.kind.is_north_south() {
        Endpoint::address(policy.destination.clone())
    } else {
        Endpoint::container(spec.endpoint_name(&policy.destination))
    };
    PolicyRequest {
        kind: policy.kind,
        source: Endpoint::container(spec.endpoint_name(&policy.source)),
        destination,
        protocol: policy.protocol,
        dport: policy.dport,
        comment: Some(format!("bottle {}", spec.bottle.name)),
    }
}

#[cfg(test)]
mod tests {
    use raind_network::policy::PolicyKind;

    use super::*;

    #[test]
    fn policy_endpoints_map_to_containers() {
        let spec = BottleSpec::from_yaml(
            r"
bottle: {name: shop}
services:
  db: {image: postgres}
  web: {image: nginx}
",
        )
        .unwrap();

        let east_west = PolicySpec {
            kind: PolicyKind::EastWest,
            source: "web".to_string(),
            destination: "db".to_string(),
            protocol: None,
            dport: Some(5432),
        };
        let request = policy_request(&spec, &east_west);
        assert_eq!(request.source, Endpoint::container("shop-web"));
        assert_eq!(request.destination, Endpoint::container("shop-db"));

        let north_south = PolicySpec {
            kind: PolicyKind::NorthSouthEnforce,
            destination: "1.1.1.1".to_string(),
            ..east_west
        };
        let request = policy_request(&spec, &north_south);
        assert_eq!(request.destination, Endpoint::address("1.1.1.1"));
    }
}
