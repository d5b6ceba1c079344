use std::collections::{BTreeMap, BTreeSet};

use keel_domain::{ComponentName, DependencyDecl, DependencyKind, StartWhen};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::error::SchedulerError;

/// The component dependency DAG. Forward edges (dependent → dependency)
/// carry the edge attributes; dependents are kept as name back-references
/// only, so ownership stays with the scheduler's component map.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: BTreeSet<ComponentName>,
    /// dependent → (dependency → edge attributes)
    edges: BTreeMap<ComponentName, BTreeMap<ComponentName, DependencyDecl>>,
    /// dependency → dependents (reverse index)
    dependents: BTreeMap<ComponentName, BTreeSet<ComponentName>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_component(&mut self, name: ComponentName) {
        self.nodes.insert(name);
    }

    pub fn contains(&self, name: &ComponentName) -> bool {
        self.nodes.contains(name)
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentName> {
        self.nodes.iter()
    }

    /// Add or update one edge. Fails without modifying the graph when the
    /// edge would close a cycle.
    pub fn add_or_update_edge(
        &mut self,
        dependent: &ComponentName,
        dependency: &ComponentName,
        decl: DependencyDecl,
    ) -> Result<(), SchedulerError> {
        let previous = self
            .edges
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone(), decl);

        if self.is_cyclic() {
            // roll the tentative edge back
            let deps = self.edges.entry(dependent.clone()).or_default();
            match previous {
                Some(prev) => {
                    deps.insert(dependency.clone(), prev);
                }
                None => {
                    deps.remove(dependency);
                }
            }
            return Err(SchedulerError::CycleDetected {
                dependent: dependent.clone(),
                dependency: dependency.clone(),
            });
        }

        self.nodes.insert(dependent.clone());
        self.nodes.insert(dependency.clone());
        self.dependents
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        Ok(())
    }

    /// Replace every edge of `dependent` in one step (deployment merges
    /// rewrite the whole dependency list). Fails without modification when
    /// the new set would close a cycle.
    pub fn set_dependencies(
        &mut self,
        dependent: &ComponentName,
        deps: BTreeMap<ComponentName, DependencyDecl>,
    ) -> Result<(), SchedulerError> {
        let previous = self.edges.insert(dependent.clone(), deps.clone());
        if self.is_cyclic() {
            match previous {
                Some(prev) => {
                    self.edges.insert(dependent.clone(), prev);
                }
                None => {
                    self.edges.remove(dependent);
                }
            }
            let dependency = deps
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| dependent.clone());
            return Err(SchedulerError::CycleDetected {
                dependent: dependent.clone(),
                dependency,
            });
        }

        // rebuild the reverse index for this dependent
        for back in self.dependents.values_mut() {
            back.remove(dependent);
        }
        self.nodes.insert(dependent.clone());
        for dependency in deps.keys() {
            self.nodes.insert(dependency.clone());
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(dependent.clone());
        }
        Ok(())
    }

    pub fn remove_component(&mut self, name: &ComponentName) {
        self.nodes.remove(name);
        self.edges.remove(name);
        self.dependents.remove(name);
        for deps in self.edges.values_mut() {
            deps.remove(name);
        }
        for back in self.dependents.values_mut() {
            back.remove(name);
        }
    }

    /// The declared dependencies of one component.
    pub fn dependencies_of(
        &self,
        name: &ComponentName,
    ) -> impl Iterator<Item = (&ComponentName, &DependencyDecl)> {
        self.edges.get(name).into_iter().flatten()
    }

    /// HARD dependencies only, with their start-when requirement.
    pub fn hard_dependencies_of(
        &self,
        name: &ComponentName,
    ) -> Vec<(ComponentName, StartWhen)> {
        self.dependencies_of(name)
            .filter(|(_, decl)| decl.kind == DependencyKind::Hard)
            .map(|(dep, decl)| (dep.clone(), decl.start_when))
            .collect()
    }

    /// Components that declared `name` as a dependency (back-references).
    pub fn dependents_of(&self, name: &ComponentName) -> BTreeSet<ComponentName> {
        self.dependents.get(name).cloned().unwrap_or_default()
    }

    /// Transitive dependency closure including the component itself.
    pub fn dependency_closure(&self, name: &ComponentName) -> BTreeSet<ComponentName> {
        let mut closure = BTreeSet::new();
        let mut stack = vec![name.clone()];
        while let Some(current) = stack.pop() {
            if !closure.insert(current.clone()) {
                continue;
            }
            for (dep, _) in self.dependencies_of(&current) {
                stack.push(dep.clone());
            }
        }
        closure
    }

    /// Deterministic topological order, dependencies before dependents.
    /// Peers tie-break on component name (Kahn's algorithm with an ordered
    /// frontier; petgraph's toposort does not tie-break).
    pub fn ordered_dependencies(&self) -> Vec<ComponentName> {
        let mut remaining: BTreeMap<ComponentName, BTreeSet<ComponentName>> = self
            .nodes
            .iter()
            .map(|n| {
                let deps = self
                    .dependencies_of(n)
                    .map(|(d, _)| d.clone())
                    .filter(|d| self.nodes.contains(d))
                    .collect();
                (n.clone(), deps)
            })
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        let mut frontier: BTreeSet<ComponentName> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(n, _)| n.clone())
            .collect();

        while let Some(next) = frontier.iter().next().cloned() {
            frontier.remove(&next);
            remaining.remove(&next);
            order.push(next.clone());
            for (node, deps) in remaining.iter_mut() {
                if deps.remove(&next) && deps.is_empty() {
                    frontier.insert(node.clone());
                }
            }
        }
        // a cycle can't appear here (insertions are guarded), but any
        // leftover nodes are appended to keep the order total
        order.extend(remaining.into_keys());
        order
    }

    fn is_cyclic(&self) -> bool {
        let names: BTreeSet<&ComponentName> = self
            .nodes
            .iter()
            .chain(self.edges.keys())
            .chain(self.edges.values().flat_map(|m| m.keys()))
            .collect();
        let mut graph: DiGraph<&ComponentName, ()> = DiGraph::new();
        let indices: BTreeMap<&ComponentName, _> =
            names.into_iter().map(|n| (n, graph.add_node(n))).collect();
        for (dependent, deps) in &self.edges {
            for dependency in deps.keys() {
                graph.add_edge(indices[dependent], indices[dependency], ());
            }
        }
        is_cyclic_directed(&graph)
    }
}
