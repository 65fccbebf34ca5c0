// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::record::RunRecord;
use crate::errors::GraphError;
use crate::task::TaskId;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct requirements: tasks that must succeed before this one can run.
    /// May name tasks that have not been added yet.
    deps: Vec<TaskId>,
    /// Direct dependents: tasks that require this one.
    dependents: Vec<TaskId>,
}

/// Dependency graph of one flow, keyed by task identity.
///
/// Edges are derived from each task's `requires` set. Cycles are rejected
/// as soon as the closing edge is added; requirements pointing at tasks not
/// yet added are tolerated until [`DagGraph::validate`].
#[derive(Debug, Clone, Default)]
pub struct DagGraph {
    nodes: BTreeMap<TaskId, DagNode>,
}

/// Snapshot of per-task records that readiness is computed from.
pub type RecordSnapshot = BTreeMap<TaskId, RunRecord>;

impl DagGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node and derive its edges.
    ///
    /// Fails with `DuplicateIdentity` if the id is taken, or `CycleDetected`
    /// if the new edges close a cycle; the graph is unchanged on failure.
    pub fn add_task(&mut self, id: &TaskId, requires: &BTreeSet<TaskId>) -> Result<(), GraphError> {
        if self.nodes.contains_key(id) {
            return Err(GraphError::DuplicateIdentity(id.clone()));
        }

        // Tasks added earlier that already name this id as a requirement.
        let waiting: Vec<TaskId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.deps.contains(id))
            .map(|(name, _)| name.clone())
            .collect();

        self.nodes.insert(
            id.clone(),
            DagNode {
                deps: requires.iter().cloned().collect(),
                dependents: waiting,
            },
        );

        for dep in requires {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.dependents.push(id.clone());
            }
        }

        if let Some(cycle) = self.find_cycle() {
            self.remove_task(id);
            return Err(GraphError::CycleDetected { cycle });
        }

        Ok(())
    }

    fn remove_task(&mut self, id: &TaskId) {
        if let Some(node) = self.nodes.remove(id) {
            for dep in node.deps {
                if let Some(dep_node) = self.nodes.get_mut(&dep) {
                    dep_node.dependents.retain(|d| d != id);
                }
            }
        }
    }

    /// Full check: every requirement resolves inside the graph and the graph
    /// is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (name, node) in &self.nodes {
            for dep in &node.deps {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::DanglingDependency {
                        task: name.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        match self.find_cycle() {
            Some(cycle) => Err(GraphError::CycleDetected { cycle }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All task ids, in key order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskId> {
        self.nodes.keys()
    }

    /// Immediate requirements of a task.
    pub fn dependencies_of(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a task.
    pub fn dependents_of(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every direct and transitive dependent of `id` (excluding `id`).
    pub fn downstream_of(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&TaskId> = self.dependents_of(id).iter().collect();

        while let Some(name) = stack.pop() {
            if seen.insert(name.clone()) {
                stack.extend(self.dependents_of(name));
            }
        }

        seen
    }

    /// Tasks ordered so that every task comes after all its requirements.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let graph = self.to_petgraph();
        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(TaskId::from).collect()),
            Err(_) => Err(GraphError::CycleDetected {
                cycle: self.find_cycle().unwrap_or_default(),
            }),
        }
    }

    /// Tasks whose own status is PENDING/BLOCKED and whose every requirement
    /// counts as success in `snapshot`.
    ///
    /// Pure function of the snapshot; a requirement without a record is
    /// never satisfied.
    pub fn ready_set(&self, snapshot: &RecordSnapshot) -> Vec<TaskId> {
        self.waiting_in(snapshot)
            .filter(|id| {
                self.dependencies_of(id).iter().all(|dep| {
                    snapshot
                        .get(dep)
                        .is_some_and(RunRecord::counts_as_success)
                })
            })
            .cloned()
            .collect()
    }

    /// Tasks whose own status is PENDING/BLOCKED and which can never become
    /// ready because some requirement is terminal without success.
    pub fn doomed_set(&self, snapshot: &RecordSnapshot) -> Vec<TaskId> {
        self.waiting_in(snapshot)
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .any(|dep| snapshot.get(dep).is_some_and(RunRecord::is_dead))
            })
            .cloned()
            .collect()
    }

    fn waiting_in<'a>(&'a self, snapshot: &'a RecordSnapshot) -> impl Iterator<Item = &'a TaskId> {
        use crate::dag::TaskStatus;

        self.nodes.keys().filter(move |id| {
            snapshot.get(*id).is_some_and(|r| {
                matches!(r.status, TaskStatus::Pending | TaskStatus::Blocked)
            })
        })
    }

    /// Edge direction: requirement -> dependent. Dangling requirements are
    /// left out; they cannot take part in a cycle.
    fn to_petgraph(&self) -> DiGraphMap<&str, ()> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

        for name in self.nodes.keys() {
            graph.add_node(name.as_str());
        }
        for (name, node) in &self.nodes {
            for dep in &node.deps {
                if self.nodes.contains_key(dep) {
                    graph.add_edge(dep.as_str(), name.as_str(), ());
                }
            }
        }

        graph
    }

    /// Returns one cycle as a closed path (`a -> b -> a`), if any exists.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let graph = self.to_petgraph();
        let hint = match toposort(&graph, None) {
            Ok(_) => return None,
            Err(cycle) => TaskId::from(cycle.node_id()),
        };

        // Start from the node petgraph reported, then fall back to the rest.
        std::iter::once(&hint)
            .chain(self.nodes.keys())
            .find_map(|start| self.trace_cycle(start))
    }

    fn trace_cycle(&self, start: &TaskId) -> Option<Vec<TaskId>> {
        let mut path = vec![start.clone()];
        let mut visited = HashSet::new();
        if self.walk_back_to(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn walk_back_to<'a>(
        &'a self,
        node: &'a TaskId,
        start: &TaskId,
        path: &mut Vec<TaskId>,
        visited: &mut HashSet<&'a TaskId>,
    ) -> bool {
        for next in self.dependents_of(node) {
            if next == start {
                path.push(start.clone());
                return true;
            }
            if visited.insert(next) {
                path.push(next.clone());
                if self.walk_back_to(next, start, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{SkipReason, TaskStatus};
    use chrono::Utc;

    fn ids(names: &[&str]) -> BTreeSet<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    fn diamond() -> DagGraph {
        let mut g = DagGraph::new();
        g.add_task(&"a".into(), &ids(&[])).unwrap();
        g.add_task(&"b".into(), &ids(&["a"])).unwrap();
        g.add_task(&"c".into(), &ids(&["a"])).unwrap();
        g.add_task(&"d".into(), &ids(&["b", "c"])).unwrap();
        g
    }

    fn record(status: TaskStatus) -> RunRecord {
        RunRecord {
            status,
            ..RunRecord::pending()
        }
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut g = diamond();
        let err = g.add_task(&"a".into(), &ids(&[])).unwrap_err();
        assert_eq!(err, GraphError::DuplicateIdentity("a".into()));
    }

    #[test]
    fn two_node_cycle_is_named() {
        let mut g = DagGraph::new();
        g.add_task(&"a".into(), &ids(&["b"])).unwrap();
        let err = g.add_task(&"b".into(), &ids(&["a"])).unwrap_err();

        match err {
            GraphError::CycleDetected { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".into()) && cycle.contains(&"b".into()));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }

        // Rolled back: b is gone, a still waits on it.
        assert!(!g.contains(&"b".into()));
        assert!(g.contains(&"a".into()));
        assert!(g.dependents_of(&"a".into()).is_empty());
    }

    #[test]
    fn self_requirement_is_a_cycle() {
        let mut g = DagGraph::new();
        let err = g.add_task(&"a".into(), &ids(&["a"])).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn dangling_dependency_surfaces_on_validate() {
        let mut g = DagGraph::new();
        g.add_task(&"a".into(), &ids(&["ghost"])).unwrap();
        assert_eq!(
            g.validate().unwrap_err(),
            GraphError::DanglingDependency {
                task: "a".into(),
                missing: "ghost".into()
            }
        );
    }

    #[test]
    fn forward_references_are_wired_when_target_arrives() {
        let mut g = DagGraph::new();
        g.add_task(&"b".into(), &ids(&["a"])).unwrap();
        g.add_task(&"a".into(), &ids(&[])).unwrap();
        assert_eq!(g.dependents_of(&"a".into()), &[TaskId::from("b")]);
        g.validate().unwrap();
    }

    #[test]
    fn topological_order_respects_requirements() {
        let order = diamond().topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|t| t.as_str() == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn downstream_is_transitive() {
        let g = diamond();
        assert_eq!(g.downstream_of(&"a".into()), ids(&["b", "c", "d"]));
        assert_eq!(g.downstream_of(&"b".into()), ids(&["d"]));
        assert!(g.downstream_of(&"d".into()).is_empty());
    }

    #[test]
    fn ready_set_tracks_snapshot() {
        let g = diamond();
        let mut snap: RecordSnapshot = g
            .tasks()
            .map(|t| (t.clone(), record(TaskStatus::Pending)))
            .collect();
        assert_eq!(g.ready_set(&snap), vec![TaskId::from("a")]);

        snap.insert("a".into(), record(TaskStatus::Succeeded));
        snap.insert("b".into(), record(TaskStatus::Blocked));
        snap.insert("c".into(), record(TaskStatus::Blocked));
        assert_eq!(g.ready_set(&snap), vec![TaskId::from("b"), TaskId::from("c")]);

        // Running tasks are never part of the ready set.
        snap.insert("b".into(), record(TaskStatus::Running));
        assert_eq!(g.ready_set(&snap), vec![TaskId::from("c")]);
    }

    #[test]
    fn skipped_as_satisfied_unblocks_dependents() {
        let g = diamond();
        let mut snap: RecordSnapshot = g
            .tasks()
            .map(|t| (t.clone(), record(TaskStatus::Blocked)))
            .collect();
        let mut a = RunRecord::pending();
        a.skip(SkipReason::Satisfied, Utc::now()).unwrap();
        snap.insert("a".into(), a);

        assert_eq!(g.ready_set(&snap), vec![TaskId::from("b"), TaskId::from("c")]);
        assert!(g.doomed_set(&snap).is_empty());
    }

    #[test]
    fn doomed_set_follows_dead_requirements() {
        let g = diamond();
        let mut snap: RecordSnapshot = g
            .tasks()
            .map(|t| (t.clone(), record(TaskStatus::Blocked)))
            .collect();
        snap.insert("a".into(), record(TaskStatus::Succeeded));
        snap.insert("b".into(), record(TaskStatus::Failed));

        assert_eq!(g.doomed_set(&snap), vec![TaskId::from("d")]);
        assert_eq!(g.ready_set(&snap), vec![TaskId::from("c")]);
    }
}
