//! Dependency graph over service specs.
//!
//! Built and validated before any process is spawned: duplicate names,
//! unknown dependencies, and cycles are all configuration errors that must
//! fail the whole bring-up up front.

use crate::config::ServiceSpec;
use crate::errors::SupervisorError;
use std::collections::{HashMap, HashSet};

/// Index into the service list.
pub type ServiceIndex = usize;

/// A validated directed acyclic graph of services.
#[derive(Debug)]
pub struct ServiceGraph {
    services: Vec<ServiceSpec>,
    index_map: HashMap<String, ServiceIndex>,
    /// index -> services that depend on it
    dependents: Vec<Vec<ServiceIndex>>,
    /// index -> services it depends on
    dependencies: Vec<Vec<ServiceIndex>>,
    /// Kahn order computed at build time.
    topo_order: Vec<ServiceIndex>,
}

impl ServiceGraph {
    pub fn build(services: Vec<ServiceSpec>) -> Result<Self, SupervisorError> {
        let mut index_map = HashMap::new();
        for (i, service) in services.iter().enumerate() {
            if index_map.insert(service.name.clone(), i).is_some() {
                return Err(SupervisorError::DuplicateService(service.name.clone()));
            }
        }

        let mut dependents: Vec<Vec<ServiceIndex>> = vec![Vec::new(); services.len()];
        let mut dependencies: Vec<Vec<ServiceIndex>> = vec![Vec::new(); services.len()];

        for (to, service) in services.iter().enumerate() {
            for dep in &service.depends_on {
                let from = *index_map.get(dep).ok_or_else(|| {
                    SupervisorError::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                dependents[from].push(to);
                dependencies[to].push(from);
            }
        }

        let topo_order = Self::topological_order(&services, &dependents, &dependencies)?;

        Ok(Self {
            services,
            index_map,
            dependents,
            dependencies,
            topo_order,
        })
    }

    /// Kahn's algorithm. A leftover node means a cycle; name the services
    /// involved so the config error is actionable.
    fn topological_order(
        services: &[ServiceSpec],
        dependents: &[Vec<ServiceIndex>],
        dependencies: &[Vec<ServiceIndex>],
    ) -> Result<Vec<ServiceIndex>, SupervisorError> {
        let mut in_degree: Vec<usize> = dependencies.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<ServiceIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        // Deterministic order among roots: config order.
        queue.sort_unstable();
        queue.reverse();

        let mut order = Vec::with_capacity(services.len());

        while let Some(node) = queue.pop() {
            order.push(node);
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                    queue.sort_unstable();
                    queue.reverse();
                }
            }
        }

        if order.len() != services.len() {
            let cycle: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| services[i].name.clone())
                .collect();
            return Err(SupervisorError::CyclicDependency { services: cycle });
        }

        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, index: ServiceIndex) -> &ServiceSpec {
        &self.services[index]
    }

    pub fn index_of(&self, name: &str) -> Option<ServiceIndex> {
        self.index_map.get(name).copied()
    }

    /// Startup order: every service appears after all of its dependencies.
    pub fn startup_order(&self) -> &[ServiceIndex] {
        &self.topo_order
    }

    /// Shutdown order: dependents stop before their dependencies.
    pub fn shutdown_order(&self) -> Vec<ServiceIndex> {
        self.topo_order.iter().rev().copied().collect()
    }

    pub fn dependencies_of(&self, index: ServiceIndex) -> &[ServiceIndex] {
        &self.dependencies[index]
    }

    pub fn dependents_of(&self, index: ServiceIndex) -> &[ServiceIndex] {
        &self.dependents[index]
    }

    /// All services transitively depending on `index`, in no particular
    /// order. Used for cascade-skip when an optional service fails.
    pub fn transitive_dependents(&self, index: ServiceIndex) -> HashSet<ServiceIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ServiceIndex> = self.dependents[index].to_vec();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.dependents[node].iter().copied());
            }
        }
        seen
    }
}
