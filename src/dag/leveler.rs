// src/dag/leveler.rs

//! Turn a [`DependencyGraph`] into batches of nodes that may run together.
//!
//! This is Kahn's algorithm producing *levels* instead of a single linear
//! order: level 0 holds every node without dependencies, and each later level
//! holds the nodes whose last dependency was released by the previous one.
//! A node therefore lands in the level equal to the length of its longest
//! dependency chain. Hard and soft edges both count here; the kind only
//! matters for runnability.

use std::collections::HashMap;

use tracing::debug;

use crate::dag::graph::DependencyGraph;
use crate::errors::StructuralError;
use crate::types::StepId;

/// One batch of nodes with no dependencies among themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLevel {
    pub index: usize,
    /// Members in graph registration order.
    pub nodes: Vec<StepId>,
}

impl ExecutionLevel {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n == id)
    }
}

/// Compute the execution levels of `graph`.
///
/// Dependencies on unknown nodes are ignored here; run
/// [`DependencyGraph::validate`] first to reject them. If some nodes never
/// reach in-degree zero the graph has a cycle and
/// [`StructuralError::CycleDetected`] lists them.
pub fn execution_levels(graph: &DependencyGraph) -> Result<Vec<ExecutionLevel>, StructuralError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(graph.len());
    for id in graph.nodes() {
        let known = graph
            .dependencies_of(id)
            .iter()
            .filter(|d| graph.contains(d))
            .count();
        in_degree.insert(id, known);
    }

    let mut current: Vec<&str> = graph
        .nodes()
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut levels = Vec::new();
    let mut processed = 0usize;

    while !current.is_empty() {
        processed += current.len();

        let mut released: Vec<&str> = Vec::new();
        for id in &current {
            for dependent in graph.dependents_of(id) {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        released.push(dependent.as_str());
                    }
                }
            }
        }

        levels.push(ExecutionLevel {
            index: levels.len(),
            nodes: current.iter().map(|s| s.to_string()).collect(),
        });

        // Keep registration order inside each level.
        released.sort_by_key(|id| position_of(graph, id));
        released.dedup();
        current = released;
    }

    if processed < graph.len() {
        let unresolved: Vec<StepId> = graph
            .nodes()
            .filter(|id| in_degree.get(id).is_some_and(|d| *d > 0))
            .map(|s| s.to_string())
            .collect();
        return Err(StructuralError::CycleDetected { unresolved });
    }

    debug!(
        levels = levels.len(),
        nodes = processed,
        "leveler: computed execution levels"
    );

    Ok(levels)
}

fn position_of(graph: &DependencyGraph, id: &str) -> usize {
    graph.nodes().position(|n| n == id).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(levels: &[ExecutionLevel]) -> Vec<Vec<&str>> {
        levels
            .iter()
            .map(|l| l.nodes.iter().map(|s| s.as_str()).collect())
            .collect()
    }

    #[test]
    fn independent_nodes_share_one_level() {
        let mut g = DependencyGraph::new();
        for id in ["a", "b", "c", "d"] {
            g.add_node(id, Vec::<String>::new()).unwrap();
        }
        let levels = execution_levels(&g).unwrap();
        assert_eq!(names(&levels), vec![vec!["a", "b", "c", "d"]]);
    }

    #[test]
    fn diamond_has_three_levels() {
        let mut g = DependencyGraph::new();
        g.add_node("A", Vec::<String>::new()).unwrap();
        g.add_node("B", ["A"]).unwrap();
        g.add_node("C", ["A"]).unwrap();
        g.add_node("D", ["B", "C"]).unwrap();

        let levels = execution_levels(&g).unwrap();
        assert_eq!(names(&levels), vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
        assert_eq!(levels[2].index, 2);
    }

    #[test]
    fn level_is_longest_chain_length() {
        // A -> B -> C, and A -> C directly: C must still sit after B.
        let mut g = DependencyGraph::new();
        g.add_node("C", ["A", "B"]).unwrap();
        g.add_node("B", ["A"]).unwrap();
        g.add_node("A", Vec::<String>::new()).unwrap();

        let levels = execution_levels(&g).unwrap();
        assert_eq!(names(&levels), vec![vec!["A"], vec!["B"], vec!["C"]]);
    }

    #[test]
    fn cycle_reports_unresolved_nodes() {
        let mut g = DependencyGraph::new();
        g.add_node("ok", Vec::<String>::new()).unwrap();
        g.add_node("x", ["ok", "y"]).unwrap();
        g.add_node("y", ["x"]).unwrap();

        match execution_levels(&g) {
            Err(StructuralError::CycleDetected { unresolved }) => {
                assert_eq!(unresolved, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn empty_graph_has_no_levels() {
        assert!(execution_levels(&DependencyGraph::new()).unwrap().is_empty());
    }
}
