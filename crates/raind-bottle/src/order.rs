//! Service start order.

use std::collections::{BTreeMap, BTreeSet};

use raind_common::{RaindError, RaindResult};

use crate::spec::ServiceSpec;

/// Topological start order of `services` (Kahn's algorithm).
///
/// Ties are broken by name, so the order is stable for a given spec.
///
/// # Errors
///
/// Returns [`RaindError::Validation`] when a service depends on an unknown
/// one and [`RaindError::Conflict`] on a dependency cycle.
pub fn start_order(services: &BTreeMap<String, ServiceSpec>) -> RaindResult<Vec<String>> {
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for name in services.keys() {
        dependents.insert(name, Vec::new());
        in_degree.insert(name, 0);
    }

    for (name, spec) in services {
        let deps: BTreeSet<&str> = spec.depends_on.iter().map(String::as_str).collect();
        for dep in deps {
            let Some(edges) = dependents.get_mut(dep) else {
                return Err(RaindError::validation(
                    "bottle",
                    format!("service {name} depends on unknown service {dep}"),
                ));
            };
            edges.push(name);
            if let Some(degree) = in_degree.get_mut(name.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(services.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for &next in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() != services.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(RaindError::Conflict {
            message: format!("dependency cycle between services: {}", stuck.join(", ")),
        });
    }

    Ok(order)
}
