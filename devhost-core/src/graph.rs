//! Dependency graph over the resource model.
//!
//! Derived once at startup from effective parent links and read-only
//! thereafter. Construction fails on a cycle — the graph determines event
//! propagation order, so there is no valid startup order to fall back to.

use crate::types::{AppModel, Resource, ResourceName};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<ResourceName> },
    #[error("resource `{child}` declares parent `{parent}`, which is not in the application model")]
    UnknownParent {
        child: ResourceName,
        parent: ResourceName,
    },
}

/// Effective parent of a resource: the direct parent capability wins;
/// otherwise the last `ParentRelationship` annotation declared.
pub fn effective_parent(resource: &Resource) -> Option<&ResourceName> {
    resource
        .parent
        .as_ref()
        .or_else(|| resource.last_parent_relationship())
}

/// Resolved parent→children forest plus a topological ordering in which
/// every parent appears before its descendants.
#[derive(Debug)]
pub struct DependencyGraph {
    parents: BTreeMap<ResourceName, ResourceName>,
    children: BTreeMap<ResourceName, Vec<ResourceName>>,
    topo: Vec<ResourceName>,
}

impl DependencyGraph {
    pub fn build(model: &AppModel) -> Result<Self, GraphError> {
        let mut parents: BTreeMap<ResourceName, ResourceName> = BTreeMap::new();
        let mut children: BTreeMap<ResourceName, Vec<ResourceName>> = BTreeMap::new();

        for resource in model.resources() {
            if let Some(parent) = effective_parent(resource) {
                if !model.contains(parent) {
                    return Err(GraphError::UnknownParent {
                        child: resource.name.clone(),
                        parent: parent.clone(),
                    });
                }
                parents.insert(resource.name.clone(), parent.clone());
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(resource.name.clone());
            }
        }

        // Topological ordering via petgraph; the cycle path itself is
        // recovered by walking parent chains (find_cycle) since toposort
        // only reports one offending node.
        let mut graph = DiGraph::<&str, ()>::new();
        let mut node_index_map: HashMap<&str, NodeIndex> = HashMap::new();
        for resource in model.resources() {
            let idx = graph.add_node(resource.name.as_str());
            node_index_map.insert(resource.name.as_str(), idx);
        }
        for (child, parent) in &parents {
            graph.add_edge(
                node_index_map[parent.as_str()],
                node_index_map[child.as_str()],
                (),
            );
        }

        let topo = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|ix| graph[ix].to_string()).collect(),
            Err(_) => {
                return Err(GraphError::CircularDependency {
                    cycle: find_cycle(&parents),
                })
            }
        };

        Ok(Self {
            parents,
            children,
            topo,
        })
    }

    /// Resolved effective parent of `name`, if any.
    pub fn parent_of(&self, name: &str) -> Option<&ResourceName> {
        self.parents.get(name)
    }

    /// Direct children of `name` in declaration order.
    pub fn children_of(&self, name: &str) -> &[ResourceName] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All descendants of `name`, pre-order: each resource appears before
    /// its own descendants.
    pub fn descendants_of(&self, name: &str) -> Vec<ResourceName> {
        let mut out = Vec::new();
        let mut stack: Vec<&ResourceName> = self.children_of(name).iter().rev().collect();
        while let Some(current) = stack.pop() {
            out.push(current.clone());
            stack.extend(self.children_of(current).iter().rev());
        }
        out
    }

    /// Every resource in the model, parents before descendants.
    pub fn topological(&self) -> &[ResourceName] {
        &self.topo
    }
}

/// Walk child→parent chains to name the offending cycle. Each resource has
/// at most one effective parent, so the chain from any node inside the
/// cycle leads straight back around it.
fn find_cycle(parents: &BTreeMap<ResourceName, ResourceName>) -> Vec<ResourceName> {
    let mut done: HashSet<&str> = HashSet::new();
    for start in parents.keys() {
        if done.contains(start.as_str()) {
            continue;
        }
        let mut chain: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if let Some(pos) = chain.iter().position(|n| *n == current) {
                let mut cycle: Vec<ResourceName> =
                    chain[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            chain.push(current);
            match parents.get(current) {
                Some(parent) => current = parent.as_str(),
                None => break,
            }
        }
        done.extend(chain);
    }
    Vec::new()
}
