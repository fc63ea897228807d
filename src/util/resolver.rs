use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;

use crate::error::DbError;

/// Order the nodes of `graph` so that every node comes after all of its
/// dependencies.
///
/// Each pass walks the remaining nodes in input order and places every node
/// whose dependencies have all been placed. Nodes that become ready in the
/// same pass keep their input order. A pass that places nothing means the
/// remaining nodes can never be satisfied (a cycle, or a dependency on a
/// node that is not in the graph) and yields [`DbError::Cycle`].
pub fn resolve_dependencies<K>(graph: &IndexMap<K, Vec<K>>) -> Result<Vec<K>, DbError>
where
    K: Eq + Hash + Clone + Display,
{
    let mut placed: HashSet<&K> = HashSet::with_capacity(graph.len());
    let mut sorted: Vec<K> = Vec::with_capacity(graph.len());

    while sorted.len() < graph.len() {
        let before = sorted.len();

        for (node, deps) in graph {
            if placed.contains(node) {
                continue;
            }
            if deps.iter().all(|d| placed.contains(d)) {
                placed.insert(node);
                sorted.push(node.clone());
            }
        }

        if sorted.len() == before {
            let stuck = graph
                .keys()
                .filter(|k| !placed.contains(k))
                .map(|k| k.to_string())
                .collect();
            return Err(DbError::Cycle(stuck));
        }
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(entries: &[(&str, &[&str])]) -> IndexMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(k, deps)| (k.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let g = graph(&[("a", &["b", "c"]), ("b", &[]), ("c", &["b"])]);
        assert_eq!(resolve_dependencies(&g).unwrap(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_independent_nodes_keep_input_order() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        assert_eq!(resolve_dependencies(&g).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        match resolve_dependencies(&g) {
            Err(DbError::Cycle(nodes)) => assert_eq!(nodes, vec!["a", "b"]),
            other => panic!("expected a cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_behind_resolvable_nodes() {
        let g = graph(&[("x", &[]), ("a", &["b", "x"]), ("b", &["a"])]);
        match resolve_dependencies(&g) {
            Err(DbError::Cycle(nodes)) => assert_eq!(nodes, vec!["a", "b"]),
            other => panic!("expected a cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_dependency_cannot_resolve() {
        let g = graph(&[("a", &["ghost"])]);
        assert!(matches!(resolve_dependencies(&g), Err(DbError::Cycle(_))));
    }

    #[test]
    fn test_empty_graph() {
        let g: IndexMap<String, Vec<String>> = IndexMap::new();
        assert!(resolve_dependencies(&g).unwrap().is_empty());
    }
}
