use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use stagecoach_core::CycleError;

/// Forward and reverse adjacency over unit names.
///
/// Invariant: `b ∈ nodes[a]` iff `a ∈ reverse_nodes[b]`, i.e. an edge
/// `a -> b` means "a depends on b".
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, BTreeSet<String>>,
    reverse_nodes: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Serialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub roots: usize,
    pub leaves: usize,
}

impl DependencyGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an upstream map (`unit -> units it depends on`).
    pub fn from_upstream(upstream: &BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut graph = Self::new();
        for (unit, deps) in upstream {
            graph.add_unit(unit);
            for dep in deps {
                graph.add_dependency(unit, dep);
            }
        }
        graph
    }

    /// Add a node with no edges; a no-op for known units.
    pub fn add_unit(&mut self, unit: &str) {
        self.nodes.entry(unit.to_string()).or_default();
        self.reverse_nodes.entry(unit.to_string()).or_default();
    }

    /// Record that `unit` depends on `dep`, updating both directions.
    pub fn add_dependency(&mut self, unit: &str, dep: &str) {
        if unit == dep {
            return;
        }
        self.add_unit(unit);
        self.add_unit(dep);
        if let Some(deps) = self.nodes.get_mut(unit) {
            deps.insert(dep.to_string());
        }
        if let Some(dependents) = self.reverse_nodes.get_mut(dep) {
            dependents.insert(unit.to_string());
        }
    }

    /// All units, sorted by name.
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Direct upstream units of `unit`.
    pub fn dependencies(&self, unit: &str) -> Option<&BTreeSet<String>> {
        self.nodes.get(unit)
    }

    /// Direct downstream units of `unit`.
    pub fn dependents(&self, unit: &str) -> Option<&BTreeSet<String>> {
        self.reverse_nodes.get(unit)
    }

    /// Direct edge in either direction.
    pub fn has_edge_between(&self, a: &str, b: &str) -> bool {
        let forward = self.nodes.get(a).is_some_and(|d| d.contains(b));
        let backward = self.nodes.get(b).is_some_and(|d| d.contains(a));
        forward || backward
    }

    /// Every unit reachable over forward edges, excluding `unit` itself.
    pub fn transitive_dependencies(&self, unit: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(unit);

        while let Some(current) = queue.pop_front() {
            let Some(deps) = self.nodes.get(current) else {
                continue;
            };
            for dep in deps {
                if dep != unit && seen.insert(dep.clone()) {
                    queue.push_back(dep);
                }
            }
        }
        seen
    }

    /// Either unit reaches the other over forward edges.
    pub fn is_ordered(&self, a: &str, b: &str) -> bool {
        self.transitive_dependencies(a).contains(b) || self.transitive_dependencies(b).contains(a)
    }

    /// Kahn's algorithm restricted to `subset`. Edges leaving the subset are
    /// ignored. Ties are broken by input order so the result is stable.
    pub fn topological_sort(&self, subset: &[String]) -> Result<Vec<String>, CycleError> {
        let members: BTreeSet<&str> = subset.iter().map(String::as_str).collect();
        let position: BTreeMap<&str, usize> = subset
            .iter()
            .enumerate()
            .rev()
            .map(|(i, u)| (u.as_str(), i))
            .collect();

        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for &unit in &members {
            let degree = self
                .nodes
                .get(unit)
                .map(|deps| deps.iter().filter(|d| members.contains(d.as_str())).count())
                .unwrap_or(0);
            in_degree.insert(unit, degree);
        }

        let mut ready: BTreeSet<(usize, &str)> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&u, _)| (position[u], u))
            .collect();
        let mut order = Vec::with_capacity(members.len());

        while let Some(entry) = ready.pop_first() {
            let (_, unit) = entry;
            order.push(unit.to_string());
            let Some(dependents) = self.reverse_nodes.get(unit) else {
                continue;
            };
            for dependent in dependents {
                let dependent = dependent.as_str();
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((position[dependent], dependent));
                    }
                }
            }
        }

        if order.len() < members.len() {
            let units = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(u, _)| u.to_string())
                .collect();
            return Err(CycleError { units });
        }
        Ok(order)
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.nodes.values().map(BTreeSet::len).sum(),
            roots: self.nodes.values().filter(|d| d.is_empty()).count(),
            leaves: self.reverse_nodes.values().filter(|d| d.is_empty()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn chain() -> DependencyGraph {
        // d -> c -> b -> a, and e -> a
        let mut g = DependencyGraph::new();
        g.add_dependency("b", "a");
        g.add_dependency("c", "b");
        g.add_dependency("d", "c");
        g.add_dependency("e", "a");
        g
    }

    #[test]
    fn edges_are_recorded_in_both_directions() {
        let g = chain();
        for unit in g.units() {
            for dep in g.dependencies(unit).unwrap() {
                assert!(g.dependents(dep).unwrap().contains(unit));
            }
        }
        assert!(g.has_edge_between("a", "b"));
        assert!(g.has_edge_between("b", "a"));
        assert!(!g.has_edge_between("a", "d"));
    }

    #[test]
    fn self_edges_are_ignored() {
        let mut g = DependencyGraph::new();
        g.add_dependency("a", "a");
        assert!(g.dependencies("a").is_none());
    }

    #[test]
    fn transitive_dependencies_exclude_self() {
        let g = chain();
        assert_eq!(
            g.transitive_dependencies("d"),
            BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(g.transitive_dependencies("a").is_empty());
        assert!(g.transitive_dependencies("missing").is_empty());
        assert!(g.is_ordered("a", "d"));
        assert!(!g.is_ordered("d", "e"));
    }

    #[test]
    fn topological_sort_respects_every_edge() {
        let g = chain();
        let subset = names(&["d", "e", "a", "c", "b"]);
        let order = g.topological_sort(&subset).unwrap();
        assert_eq!(order.len(), subset.len());
        let pos = |u: &str| order.iter().position(|x| x == u).unwrap();
        for unit in &subset {
            for dep in g.dependencies(unit).unwrap() {
                assert!(pos(dep) < pos(unit), "{dep} must precede {unit}");
            }
        }
    }

    #[test]
    fn topological_sort_is_restricted_to_subset() {
        let g = chain();
        let order = g.topological_sort(&names(&["d", "b"])).unwrap();
        assert_eq!(order, names(&["b", "d"]));
        // Units unknown to the graph pass through in input order.
        let order = g.topological_sort(&names(&["zz", "yy"])).unwrap();
        assert_eq!(order, names(&["zz", "yy"]));
    }

    #[test]
    fn topological_sort_names_the_cycle() {
        let mut g = chain();
        g.add_dependency("a", "c");
        let err = g.topological_sort(&names(&["a", "b", "c"])).unwrap_err();
        assert_eq!(err.units, names(&["a", "b", "c"]));

        // Units blocked behind the cycle are unresolved too.
        let err = g.topological_sort(&names(&["e", "a", "b", "c"])).unwrap_err();
        assert_eq!(err.units, names(&["a", "b", "c", "e"]));

        // The same graph sorts fine when the subset breaks the cycle.
        assert!(g.topological_sort(&names(&["a", "e"])).is_ok());
    }

    #[test]
    fn stats_count_edges() {
        let g = chain();
        let stats = g.stats();
        assert_eq!(stats.node_count, 5);
        assert_eq!(stats.edge_count, 4);
        assert_eq!(stats.roots, 1);
        assert_eq!(stats.leaves, 2);
    }
}
