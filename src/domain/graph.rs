//! Dependency graph for issues
//!
//! Cycle detection and ready/blocked computation over the readiness-affecting
//! subset of dependency edges. Uses petgraph for graph operations.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

use super::id::IssueId;
use super::issue::{Dependency, DependencyKind, Status};

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Adding dependency would create a cycle: {0} -> {1}")]
    CycleDetected(IssueId, IssueId),

    #[error("Issue not found: {0}")]
    IssueNotFound(IssueId),

    #[error("Self-dependency not allowed: {0}")]
    SelfDependency(IssueId),
}

/// A dependency graph restricted to readiness-affecting edges
#[derive(Debug, Default)]
pub struct DepGraph {
    graph: DiGraph<IssueId, ()>,
    node_map: HashMap<IssueId, NodeIndex>,
}

impl DepGraph {
    /// Creates an empty graph
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_map: HashMap::new(),
        }
    }

    /// Builds a graph from issue IDs and dependency edges
    ///
    /// Only edges whose kind is in `ready_kinds` become graph edges; other
    /// kinds are informational and never gate readiness.
    pub fn build(
        ids: impl IntoIterator<Item = IssueId>,
        deps: &[Dependency],
        ready_kinds: &[DependencyKind],
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for id in ids {
            graph.add_issue(id);
        }
        for dep in deps {
            if ready_kinds.contains(&dep.kind) {
                graph.add_edge(&dep.issue_id, &dep.depends_on_id)?;
            }
        }
        Ok(graph)
    }

    /// Adds an issue node to the graph
    pub fn add_issue(&mut self, id: IssueId) {
        if !self.node_map.contains_key(&id) {
            let idx = self.graph.add_node(id.clone());
            self.node_map.insert(id, idx);
        }
    }

    /// Adds an edge: `issue` depends on `depends_on`
    ///
    /// The edge direction is depends_on -> issue, meaning "depends_on must
    /// close before issue". Rejects the edge if it would create a cycle.
    pub fn add_edge(&mut self, issue: &IssueId, depends_on: &IssueId) -> Result<(), GraphError> {
        if issue == depends_on {
            return Err(GraphError::SelfDependency(issue.clone()));
        }

        let issue_idx = self
            .node_map
            .get(issue)
            .ok_or_else(|| GraphError::IssueNotFound(issue.clone()))?;

        let dep_idx = self
            .node_map
            .get(depends_on)
            .ok_or_else(|| GraphError::IssueNotFound(depends_on.clone()))?;

        self.graph.add_edge(*dep_idx, *issue_idx, ());

        if is_cyclic_directed(&self.graph) {
            if let Some(edge) = self.graph.find_edge(*dep_idx, *issue_idx) {
                self.graph.remove_edge(edge);
            }
            return Err(GraphError::CycleDetected(
                issue.clone(),
                depends_on.clone(),
            ));
        }

        Ok(())
    }

    /// Returns the direct dependencies of an issue
    pub fn dependencies(&self, id: &IssueId) -> Vec<IssueId> {
        let idx = match self.node_map.get(id) {
            Some(idx) => *idx,
            None => return vec![],
        };

        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect()
    }

    /// Returns the direct dependents of an issue
    pub fn dependents(&self, id: &IssueId) -> Vec<IssueId> {
        let idx = match self.node_map.get(id) {
            Some(idx) => *idx,
            None => return vec![],
        };

        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect()
    }

    /// Returns issues that are ready (open with no open dependencies)
    pub fn ready_issues(&self, statuses: &HashMap<IssueId, Status>) -> Vec<IssueId> {
        let mut ready: Vec<IssueId> = self
            .node_map
            .keys()
            .filter(|id| {
                let status = statuses.get(*id).cloned().unwrap_or_default();
                if status.is_closed() || status.is_tombstone() {
                    return false;
                }
                self.dependencies(id).iter().all(|dep_id| {
                    statuses
                        .get(dep_id)
                        .map(|s| s.is_closed() || s.is_tombstone())
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();
        ready.sort();
        ready
    }

    /// Returns issues blocked by at least one open dependency
    pub fn blocked_issues(&self, statuses: &HashMap<IssueId, Status>) -> Vec<IssueId> {
        let mut blocked: Vec<IssueId> = self
            .node_map
            .keys()
            .filter(|id| {
                let status = statuses.get(*id).cloned().unwrap_or_default();
                if status.is_closed() || status.is_tombstone() {
                    return false;
                }
                self.dependencies(id).iter().any(|dep_id| {
                    statuses
                        .get(dep_id)
                        .map(|s| !s.is_closed() && !s.is_tombstone())
                        .unwrap_or(true)
                })
            })
            .cloned()
            .collect();
        blocked.sort();
        blocked
    }

    /// Returns all issues in topological order (dependencies first)
    pub fn topological_order(&self) -> Result<Vec<IssueId>, GraphError> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .filter_map(|idx| self.graph.node_weight(idx).cloned())
                .collect()),
            Err(cycle) => {
                let id = self
                    .graph
                    .node_weight(cycle.node_id())
                    .cloned()
                    .unwrap_or_else(|| IssueId::new("br", "cycle", chrono::Utc::now()));
                Err(GraphError::CycleDetected(id.clone(), id))
            }
        }
    }

    /// Returns true if the graph contains the issue
    pub fn contains(&self, id: &IssueId) -> bool {
        self.node_map.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.node_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_id(title: &str) -> IssueId {
        IssueId::new("br", title, Utc::now())
    }

    #[test]
    fn empty_graph() {
        let graph = DepGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
    }

    #[test]
    fn add_edge_and_query() {
        let mut graph = DepGraph::new();
        let id1 = make_id("one");
        let id2 = make_id("two");

        graph.add_issue(id1.clone());
        graph.add_issue(id2.clone());
        graph.add_edge(&id2, &id1).unwrap();

        assert_eq!(graph.dependencies(&id2), vec![id1.clone()]);
        assert_eq!(graph.dependents(&id1), vec![id2]);
    }

    #[test]
    fn cycle_detection() {
        let mut graph = DepGraph::new();
        let id1 = make_id("one");
        let id2 = make_id("two");
        let id3 = make_id("three");

        graph.add_issue(id1.clone());
        graph.add_issue(id2.clone());
        graph.add_issue(id3.clone());

        graph.add_edge(&id2, &id1).unwrap();
        graph.add_edge(&id3, &id2).unwrap();
        let result = graph.add_edge(&id1, &id3);

        assert!(matches!(result, Err(GraphError::CycleDetected(_, _))));
        // The rejected edge must not linger
        assert!(graph.dependencies(&id1).is_empty());
    }

    #[test]
    fn self_dependency_rejected() {
        let mut graph = DepGraph::new();
        let id1 = make_id("one");
        graph.add_issue(id1.clone());

        let result = graph.add_edge(&id1, &id1);
        assert!(matches!(result, Err(GraphError::SelfDependency(_))));
    }

    #[test]
    fn unknown_issue_rejected() {
        let mut graph = DepGraph::new();
        let id1 = make_id("one");
        let id2 = make_id("two");
        graph.add_issue(id1.clone());

        let result = graph.add_edge(&id1, &id2);
        assert!(matches!(result, Err(GraphError::IssueNotFound(_))));
    }

    #[test]
    fn ready_and_blocked() {
        let mut graph = DepGraph::new();
        let id1 = make_id("one");
        let id2 = make_id("two");
        let id3 = make_id("three");

        graph.add_issue(id1.clone());
        graph.add_issue(id2.clone());
        graph.add_issue(id3.clone());
        graph.add_edge(&id2, &id1).unwrap();

        let mut statuses = HashMap::new();
        statuses.insert(id1.clone(), Status::Open);
        statuses.insert(id2.clone(), Status::Open);
        statuses.insert(id3.clone(), Status::Open);

        let ready = graph.ready_issues(&statuses);
        assert!(ready.contains(&id1));
        assert!(ready.contains(&id3));
        assert!(!ready.contains(&id2));
        assert_eq!(graph.blocked_issues(&statuses), vec![id2.clone()]);

        // Closing the dependency unblocks the dependent
        statuses.insert(id1.clone(), Status::Closed);
        let ready = graph.ready_issues(&statuses);
        assert!(!ready.contains(&id1));
        assert!(ready.contains(&id2));
    }

    #[test]
    fn informational_kinds_do_not_block() {
        let id1 = make_id("one");
        let id2 = make_id("two");

        let deps = vec![Dependency::new(
            id2.clone(),
            id1.clone(),
            DependencyKind::RelatesTo,
        )];

        let graph = DepGraph::build(
            [id1.clone(), id2.clone()],
            &deps,
            &DependencyKind::default_ready_kinds(),
        )
        .unwrap();

        let mut statuses = HashMap::new();
        statuses.insert(id1.clone(), Status::Open);
        statuses.insert(id2.clone(), Status::Open);

        let ready = graph.ready_issues(&statuses);
        assert!(ready.contains(&id2));
    }

    #[test]
    fn topological_order() {
        let mut graph = DepGraph::new();
        let id1 = make_id("one");
        let id2 = make_id("two");
        let id3 = make_id("three");

        graph.add_issue(id1.clone());
        graph.add_issue(id2.clone());
        graph.add_issue(id3.clone());

        graph.add_edge(&id1, &id2).unwrap();
        graph.add_edge(&id2, &id3).unwrap();

        let order = graph.topological_order().unwrap();
        let pos3 = order.iter().position(|id| id == &id3).unwrap();
        let pos2 = order.iter().position(|id| id == &id2).unwrap();
        let pos1 = order.iter().position(|id| id == &id1).unwrap();

        assert!(pos3 < pos2);
        assert!(pos2 < pos1);
    }
}
