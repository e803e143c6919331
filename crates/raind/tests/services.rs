//! L4 service chains over pod endpoints.

mod common;

use raind::pod::{Applied, Manifest};
use raind::service::{ServiceSpec, chain_name};
use raind_network::netfilter::{Match, Rule, Table, Target};
use test_log::test;

use common::{Harness, harness};

const REPLICASET: &str = r"
kind: ReplicaSet
metadata:
  name: web
spec:
  replicas: 2
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: nginx
          image: nginx
";

const SERVICE: &str = r"
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 80
      targetPort: 8080
";

async fn replicas(h: &Harness, yaml: &str) {
    let manifest = Manifest::from_yaml(yaml).unwrap();
    let Applied::ReplicaSet(_) = h.platform.pods.apply(manifest).await.unwrap() else {
        panic!("expected a replica set");
    };
    h.platform.reconciler().tick().await.unwrap();
}

#[test(tokio::test)]
async fn service_balances_over_selected_pods() {
    let h = harness().await;
    replicas(&h, REPLICASET).await;
    let controller = &h.platform.services;
    let service = controller.create(ServiceSpec::from_yaml(SERVICE).unwrap()).unwrap();

    let endpoints = controller.endpoints(&service.spec).unwrap();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints[0].address < endpoints[1].address);

    assert_eq!(controller.tick().await.unwrap(), vec![service.service_id.clone()]);
    let chain = chain_name(&service.service_id, 80);
    let rules = h.netfilter.rules(Table::Nat, &chain);
    assert_eq!(rules.len(), 2);
    assert_eq!(
        rules[0].target,
        Target::Dnat(format!("{}:8080", endpoints[0].address))
    );
    assert!(rules[0].matches.contains(&Match::RandomProbability(0.5)));
    assert!(
        !rules[1]
            .matches
            .iter()
            .any(|m| matches!(m, Match::RandomProbability(_)))
    );
    for jump_chain in ["PREROUTING", "OUTPUT"] {
        let jumps = h.netfilter.rules(Table::Nat, jump_chain);
        assert!(jumps.iter().any(|rule| rule.target == Target::Jump(chain.clone())));
    }
    let forwards = h.netfilter.rules(Table::Filter, "FORWARD");
    assert!(forwards.iter().any(|rule| rule.matches.contains(&Match::SourcePort(8080))));

    // unchanged endpoints are skipped
    assert!(controller.tick().await.unwrap().is_empty());
}

#[test(tokio::test)]
async fn endpoint_changes_rerender_chain() {
    let h = harness().await;
    replicas(&h, REPLICASET).await;
    let controller = &h.platform.services;
    let service = controller.create(ServiceSpec::from_yaml(SERVICE).unwrap()).unwrap();
    controller.tick().await.unwrap();

    h.platform.pods.scale("web", 3).unwrap();
    h.platform.reconciler().tick().await.unwrap();
    assert_eq!(controller.tick().await.unwrap().len(), 1);
    let chain = chain_name(&service.service_id, 80);
    assert_eq!(h.netfilter.rules(Table::Nat, &chain).len(), 3);
}

#[test(tokio::test)]
async fn deleted_service_is_collected() {
    let h = harness().await;
    replicas(&h, REPLICASET).await;
    let controller = &h.platform.services;
    let service = controller.create(ServiceSpec::from_yaml(SERVICE).unwrap()).unwrap();
    controller.tick().await.unwrap();
    let chain = chain_name(&service.service_id, 80);
    assert!(h.netfilter.has_chain(Table::Nat, &chain));

    controller.delete("web").await.unwrap();
    assert!(!h.netfilter.has_chain(Table::Nat, &chain));
    for jump_chain in ["PREROUTING", "OUTPUT"] {
        assert!(h.netfilter.rules(Table::Nat, jump_chain).is_empty());
    }
    let forwards = h.netfilter.rules(Table::Filter, "FORWARD");
    assert!(!forwards.iter().any(|rule| rule.target == Target::Accept));
    assert!(controller.get("web").unwrap_err().is_not_found());
}

#[test(tokio::test)]
async fn service_without_matches_renders_empty_chain() {
    let h = harness().await;
    let controller = &h.platform.services;
    let service = controller.create(ServiceSpec::from_yaml(SERVICE).unwrap()).unwrap();
    controller.tick().await.unwrap();
    let chain = chain_name(&service.service_id, 80);
    assert!(h.netfilter.has_chain(Table::Nat, &chain));
    assert!(h.netfilter.rules(Table::Nat, &chain).is_empty());
}

fn service(name: &str, ports: &[(u16, u16)]) -> ServiceSpec {
    let ports: String = ports
        .iter()
        .map(|(port, target)| format!("    - port: {port}\n      targetPort: {target}\n"))
        .collect();
    let yaml = format!(
        "kind: Service\nmetadata:\n  name: {name}\nspec:\n  selector:\n    app: web\n  ports:\n{ports}"
    );
    ServiceSpec::from_yaml(&yaml).unwrap()
}

fn tagged_forwards(h: &Harness, service_id: &str) -> Vec<Rule> {
    let tag = format!("raind-svc {service_id}");
    h.netfilter
        .rules(Table::Filter, "FORWARD")
        .into_iter()
        .filter(|rule| rule.comment.as_deref() == Some(tag.as_str()))
        .collect()
}

#[test(tokio::test)]
async fn services_sharing_endpoints_keep_their_forwards() {
    let h = harness().await;
    replicas(&h, REPLICASET).await;
    let controller = &h.platform.services;
    let a = controller.create(service("a", &[(80, 8080)])).unwrap();
    let b = controller.create(service("b", &[(80, 8080)])).unwrap();
    assert_eq!(controller.tick().await.unwrap().len(), 2);
    assert_eq!(tagged_forwards(&h, &a.service_id).len(), 4);
    assert_eq!(tagged_forwards(&h, &b.service_id).len(), 4);

    controller.delete("a").await.unwrap();
    assert!(tagged_forwards(&h, &a.service_id).is_empty());
    assert_eq!(tagged_forwards(&h, &b.service_id).len(), 4);

    // still in place after another pass
    controller.tick().await.unwrap();
    assert_eq!(tagged_forwards(&h, &b.service_id).len(), 4);
    assert!(h.netfilter.has_chain(Table::Nat, &chain_name(&b.service_id, 80)));
}

#[test(tokio::test)]
async fn failed_install_is_cleaned_up_on_retry() {
    let h = harness().await;
    replicas(&h, REPLICASET).await;
    let controller = &h.platform.services;
    let svc = controller.create(service("web", &[(80, 8080), (81, 8081)])).unwrap();
    let before = controller.endpoints(&svc.spec).unwrap();
    controller.tick().await.unwrap();
    assert_eq!(tagged_forwards(&h, &svc.service_id).len(), 8);

    h.platform.pods.scale("web", 1).unwrap();
    h.platform.reconciler().tick().await.unwrap();
    let after = controller.endpoints(&svc.spec).unwrap();
    assert_eq!(after.len(), 1);
    let gone: Vec<String> = before
        .iter()
        .filter(|endpoint| !after.contains(endpoint))
        .map(|endpoint| endpoint.address.to_string())
        .collect();
    assert_eq!(gone.len(), 1);

    let broken = chain_name(&svc.service_id, 81);
    h.netfilter.break_chain(broken.clone());
    assert!(controller.tick().await.unwrap().is_empty());

    h.netfilter.repair(&broken);
    assert_eq!(controller.tick().await.unwrap(), vec![svc.service_id.clone()]);
    let forwards = tagged_forwards(&h, &svc.service_id);
    assert_eq!(forwards.len(), 4);
    assert!(!forwards.iter().any(|rule| {
        rule.matches.contains(&Match::Destination(gone[0].clone()))
            || rule.matches.contains(&Match::Source(gone[0].clone()))
    }));
    assert_eq!(h.netfilter.rules(Table::Nat, &broken).len(), 1);
    assert_eq!(h.netfilter.rules(Table::Nat, &chain_name(&svc.service_id, 80)).len(), 1);

    // nothing left behind once the service is gone
    controller.delete("web").await.unwrap();
    assert!(tagged_forwards(&h, &svc.service_id).is_empty());
    assert!(!h.netfilter.has_chain(Table::Nat, &broken));
}
