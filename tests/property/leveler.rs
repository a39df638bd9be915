use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use tierflow::dag::{DependencyGraph, execution_levels};
use tierflow::types::DependencyKind;

// Acyclic by construction: node N may only depend on nodes 0..N-1.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<Vec<(usize, bool)>>> {
    (1..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec(
            proptest::collection::vec((any::<usize>(), any::<bool>()), 0..n),
            n,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, deps)| {
                    let mut seen = BTreeSet::new();
                    deps.into_iter()
                        .filter(|_| i > 0)
                        .map(|(d, soft)| (d % i.max(1), soft))
                        .filter(|(d, _)| seen.insert(*d))
                        .collect()
                })
                .collect()
        })
    })
}

fn name(i: usize) -> String {
    format!("step_{i:02}")
}

fn build_graph(deps: &[Vec<(usize, bool)>]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for (i, node_deps) in deps.iter().enumerate() {
        let edges = node_deps
            .iter()
            .map(|(d, soft)| {
                let kind = if *soft { DependencyKind::Soft } else { DependencyKind::Hard };
                (name(*d), kind)
            })
            .collect();
        graph.add_node_with_edges(name(i), edges).unwrap();
    }
    graph
}

proptest! {
    #[test]
    fn levels_partition_all_nodes(deps in dag_strategy(12)) {
        let graph = build_graph(&deps);
        let levels = execution_levels(&graph).unwrap();

        let mut seen = BTreeSet::new();
        for level in &levels {
            prop_assert!(!level.is_empty());
            for id in &level.nodes {
                prop_assert!(seen.insert(id.clone()), "{} appears twice", id);
            }
        }
        prop_assert_eq!(seen.len(), deps.len());
    }

    #[test]
    fn dependencies_sit_in_strictly_earlier_levels(deps in dag_strategy(12)) {
        let graph = build_graph(&deps);
        let levels = execution_levels(&graph).unwrap();
        let level_of: HashMap<String, usize> = levels
            .iter()
            .flat_map(|l| l.nodes.iter().map(move |id| (id.clone(), l.index)))
            .collect();

        for (i, node_deps) in deps.iter().enumerate() {
            let own = level_of[&name(i)];
            for (d, _) in node_deps {
                prop_assert!(level_of[&name(*d)] < own);
            }
            // Each node sits right after its deepest dependency.
            let expected = node_deps
                .iter()
                .map(|(d, _)| level_of[&name(*d)] + 1)
                .max()
                .unwrap_or(0);
            prop_assert_eq!(own, expected);
        }
    }

    #[test]
    fn leveling_is_deterministic(deps in dag_strategy(12)) {
        let graph = build_graph(&deps);
        let first = execution_levels(&graph).unwrap();
        let second = execution_levels(&graph).unwrap();
        prop_assert_eq!(&first, &second);

        for level in &first {
            let mut sorted = level.nodes.clone();
            sorted.sort();
            prop_assert_eq!(&sorted, &level.nodes);
        }
    }
}
