//! Resource graph — dependency ordering for declarative resources.
//!
//! Kahn's algorithm over the `depends_on` edges. Resources whose
//! dependencies are all satisfied are released in ascending name order, so
//! the same input always yields the same apply order.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;
use crate::types::ResourceDescriptor;

/// Order `resources` so every resource follows everything it depends on.
pub fn topological_order(
    resources: &[ResourceDescriptor],
) -> Result<Vec<ResourceDescriptor>, GraphError> {
    let mut by_name: BTreeMap<&str, &ResourceDescriptor> = BTreeMap::new();
    for resource in resources {
        if resource.name.trim().is_empty() {
            return Err(GraphError::EmptyName);
        }
        if by_name.insert(resource.name.as_str(), resource).is_some() {
            return Err(GraphError::DuplicateResource(resource.name.clone()));
        }
    }

    // Remaining unsatisfied dependency count per resource, and the reverse
    // edges used to release dependents.
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for resource in by_name.values() {
        for dep in &resource.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    resource: resource.name.clone(),
                    missing: dep.clone(),
                });
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(resource.name.as_str());
        }
        pending.insert(resource.name.as_str(), resource.depends_on.len());
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut ordered = Vec::with_capacity(by_name.len());

    while let Some(name) = ready.pop_first() {
        ordered.push(by_name[name].clone());
        pending.remove(name);
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if !pending.is_empty() {
        let stuck = pending.keys().map(|name| name.to_string()).collect();
        return Err(GraphError::CyclicDependency(stuck));
    }

    Ok(ordered)
}
