// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use tracing::debug;

use crate::errors::StructuralError;
use crate::types::{DependencyKind, StepId};

/// Internal node structure: stores declared deps (with their kind) and
/// the dependents known so far.
#[derive(Debug, Clone)]
struct DagNode {
    /// Declared dependencies, in declaration order.
    deps: Vec<StepId>,
    kinds: HashMap<StepId, DependencyKind>,
    /// Nodes that declare this one as a dependency.
    dependents: Vec<StepId>,
}

/// In-memory dependency graph keyed by step id.
///
/// Nodes are registered with [`DependencyGraph::add_node`] and friends; a
/// dependency may be declared before the node it points at is registered.
/// Structural problems (unknown dependencies, cycles) are reported by
/// [`DependencyGraph::validate`] rather than on insertion, except for
/// duplicate ids which are rejected immediately.
///
/// Edge direction follows execution order: for `B` depending on `A` the edge
/// is `A -> B`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<StepId, DagNode>,
    /// Registration order; used to keep every derived ordering deterministic.
    order: Vec<StepId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node whose dependencies are all hard.
    pub fn add_node<I, S>(&mut self, id: impl Into<StepId>, dependencies: I) -> Result<(), StructuralError>
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.add_node_with_type(id, dependencies, DependencyKind::Hard)
    }

    /// Register a node whose dependencies all share the given kind.
    pub fn add_node_with_type<I, S>(
        &mut self,
        id: impl Into<StepId>,
        dependencies: I,
        kind: DependencyKind,
    ) -> Result<(), StructuralError>
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        let edges = dependencies.into_iter().map(|d| (d.into(), kind)).collect();
        self.add_node_with_edges(id, edges)
    }

    /// Register a node with an explicit kind per dependency.
    ///
    /// If the same dependency is listed twice the first kind wins.
    pub fn add_node_with_edges(
        &mut self,
        id: impl Into<StepId>,
        edges: Vec<(StepId, DependencyKind)>,
    ) -> Result<(), StructuralError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(StructuralError::DuplicateNode(id));
        }

        let mut deps = Vec::with_capacity(edges.len());
        let mut kinds = HashMap::with_capacity(edges.len());
        for (dep, kind) in edges {
            if kinds.contains_key(&dep) {
                continue;
            }
            kinds.insert(dep.clone(), kind);
            deps.push(dep);
        }

        // Link to dependencies that already exist.
        for dep in &deps {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.dependents.push(id.clone());
            }
        }

        // Pick up nodes registered earlier that already point at us.
        let dependents = self
            .order
            .iter()
            .filter(|other| {
                self.nodes
                    .get(*other)
                    .is_some_and(|n| n.kinds.contains_key(&id))
            })
            .cloned()
            .collect();

        debug!(node = %id, deps = ?deps, "graph: registered node");

        self.nodes.insert(
            id.clone(),
            DagNode {
                deps,
                kinds,
                dependents,
            },
        );
        self.order.push(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All node ids in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Declared dependencies of a node (including unknown ones).
    pub fn dependencies_of(&self, id: &str) -> &[StepId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Registered nodes that declare `id` as a dependency.
    pub fn dependents_of(&self, id: &str) -> &[StepId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Kind of the edge `dependency -> node`, if declared.
    pub fn dependency_kind(&self, node: &str, dependency: &str) -> Option<DependencyKind> {
        self.nodes.get(node)?.kinds.get(dependency).copied()
    }

    /// Hard dependencies of a node, in declaration order.
    pub fn hard_dependencies_of(&self, id: &str) -> Vec<&str> {
        self.nodes
            .get(id)
            .map(|n| {
                n.deps
                    .iter()
                    .filter(|d| n.kinds.get(*d) == Some(&DependencyKind::Hard))
                    .map(|d| d.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes without declared dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes()
            .filter(|id| self.dependencies_of(id).is_empty())
            .collect()
    }

    /// Every node `id` transitively depends on.
    pub fn ancestors(&self, id: &str) -> HashSet<StepId> {
        let (graph, index) = self.to_petgraph();
        let Some(&start) = index.get(id) else {
            return HashSet::new();
        };

        let reversed = Reversed(&graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut out = HashSet::new();
        while let Some(nx) = dfs.next(reversed) {
            if nx != start {
                out.insert(graph[nx].clone());
            }
        }
        out
    }

    /// Every node that transitively depends on `id`.
    pub fn descendants(&self, id: &str) -> HashSet<StepId> {
        let (graph, index) = self.to_petgraph();
        let Some(&start) = index.get(id) else {
            return HashSet::new();
        };

        let mut dfs = Dfs::new(&graph, start);
        let mut out = HashSet::new();
        while let Some(nx) = dfs.next(&graph) {
            if nx != start {
                out.insert(graph[nx].clone());
            }
        }
        out
    }

    /// Return every structural problem in the graph.
    ///
    /// Unknown dependencies are reported first (in registration order),
    /// followed by each distinct cycle found by a depth-first search.
    pub fn validate(&self) -> Vec<StructuralError> {
        let mut errors = Vec::new();

        for id in &self.order {
            for dep in self.dependencies_of(id) {
                if !self.nodes.contains_key(dep) {
                    errors.push(StructuralError::MissingDependency {
                        node: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        errors.extend(
            self.find_cycles()
                .into_iter()
                .map(|path| StructuralError::CircularDependency { path }),
        );

        errors
    }

    /// Like [`validate`](Self::validate) but fails on the first problem.
    pub fn check(&self) -> Result<(), StructuralError> {
        match self.validate().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Depth-first search with an explicit recursion stack. The first node
    /// found again on the stack closes a cycle; the reported path runs from
    /// that node back to itself.
    fn find_cycles(&self) -> Vec<Vec<StepId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks: HashMap<&str, Mark> =
            self.order.iter().map(|id| (id.as_str(), Mark::Unvisited)).collect();
        let mut cycles: Vec<Vec<StepId>> = Vec::new();
        let mut seen_cycles: HashSet<Vec<StepId>> = HashSet::new();

        for root in &self.order {
            if marks.get(root.as_str()) != Some(&Mark::Unvisited) {
                continue;
            }

            // Each frame: (node, index of next dependency to visit).
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            marks.insert(root.as_str(), Mark::OnStack);

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                let deps = self.dependencies_of(node);

                if next >= deps.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                frame.1 += 1;

                let dep = deps[next].as_str();
                match marks.get(dep).copied() {
                    // Unknown dependency; reported separately.
                    None => {}
                    Some(Mark::Unvisited) => {
                        marks.insert(dep, Mark::OnStack);
                        stack.push((dep, 0));
                    }
                    Some(Mark::OnStack) => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == dep)
                            .unwrap_or(0);
                        let mut path: Vec<StepId> =
                            stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                        path.push(dep.to_string());

                        if seen_cycles.insert(canonical_cycle(&path)) {
                            cycles.push(path);
                        }
                    }
                    Some(Mark::Done) => {}
                }
            }
        }

        cycles
    }

    /// Build a petgraph view of the known nodes (edges `dep -> node`).
    fn to_petgraph(&self) -> (DiGraph<StepId, DependencyKind>, HashMap<&str, NodeIndex>) {
        let mut graph = DiGraph::with_capacity(self.order.len(), self.order.len());
        let mut index = HashMap::with_capacity(self.order.len());

        for id in &self.order {
            index.insert(id.as_str(), graph.add_node(id.clone()));
        }

        for id in &self.order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            for dep in &node.deps {
                if let (Some(&from), Some(&to)) = (index.get(dep.as_str()), index.get(id.as_str())) {
                    let kind = node.kinds.get(dep).copied().unwrap_or_default();
                    graph.add_edge(from, to, kind);
                }
            }
        }

        (graph, index)
    }
}

/// Rotate a closed cycle path so that the same cycle discovered from a
/// different entry point compares equal.
fn canonical_cycle(path: &[StepId]) -> Vec<StepId> {
    let open = &path[..path.len().saturating_sub(1)];
    if open.is_empty() {
        return Vec::new();
    }
    let min_pos = open
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut rotated: Vec<StepId> = open[min_pos..].iter().chain(&open[..min_pos]).cloned().collect();
    rotated.push(rotated[0].clone());
    rotated
}
