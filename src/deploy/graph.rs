//! Dependency graph over resource urns.
//!
//! Nodes live in an arena indexed by insertion order; edges are explicit
//! index lists in both directions. Edges to urns that are not nodes are
//! ignored, so references to resources outside the deployment never block
//! anything.

use std::collections::{HashMap, VecDeque};

use crate::error::PlanError;
use crate::resource::Urn;

#[derive(Debug, Clone)]
struct Node {
    urn: Urn,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
}

/// Directed graph where an edge `a -> b` means `a` depends on `b`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<Urn, usize>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, returning its index. Adding a urn twice returns the
    /// existing index.
    pub fn add_node(&mut self, urn: Urn) -> usize {
        if let Some(&idx) = self.index.get(&urn) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(urn.clone(), idx);
        self.nodes.push(Node {
            urn,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        });
        idx
    }

    /// Records that `urn` depends on `dependency`.
    ///
    /// Returns false if either end is not a node; nothing is recorded then.
    pub fn add_dependency(&mut self, urn: &Urn, dependency: &Urn) -> bool {
        let (Some(&from), Some(&to)) = (self.index.get(urn), self.index.get(dependency)) else {
            return false;
        };
        if self.nodes[from].dependencies.contains(&to) {
            return true;
        }
        self.nodes[from].dependencies.push(to);
        self.nodes[to].dependents.push(from);
        true
    }

    /// Returns true if the urn is a node.
    #[must_use]
    pub fn contains(&self, urn: &Urn) -> bool {
        self.index.contains_key(urn)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the direct dependencies of a urn.
    #[must_use]
    pub fn dependencies(&self, urn: &Urn) -> Vec<&Urn> {
        self.index
            .get(urn)
            .map(|&idx| {
                self.nodes[idx]
                    .dependencies
                    .iter()
                    .map(|&d| &self.nodes[d].urn)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns every node that depends on `urn`, directly or not, in
    /// breadth-first order.
    #[must_use]
    pub fn transitive_dependents(&self, urn: &Urn) -> Vec<&Urn> {
        let Some(&start) = self.index.get(urn) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        seen[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut found = Vec::new();

        while let Some(idx) = queue.pop_front() {
            for &dependent in &self.nodes[idx].dependents {
                if !seen[dependent] {
                    seen[dependent] = true;
                    found.push(&self.nodes[dependent].urn);
                    queue.push_back(dependent);
                }
            }
        }
        found
    }

    /// Orders the nodes so every node follows its dependencies.
    ///
    /// Uses Kahn's algorithm. Among nodes that become free at the same time
    /// insertion order is kept, so an already ordered input comes back
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CyclicDependency`] naming one cycle if the graph
    /// is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<Urn>, PlanError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| if d == 0 { Some(i) } else { None })
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            let mut freed: Vec<usize> = Vec::new();
            for &dependent in &self.nodes[idx].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    freed.push(dependent);
                }
            }
            freed.sort_unstable();
            queue.extend(freed);
        }

        if order.len() != self.nodes.len() {
            return Err(PlanError::CyclicDependency {
                cycle: self.describe_cycle(&in_degree),
            });
        }

        Ok(order.into_iter().map(|i| self.nodes[i].urn.clone()).collect())
    }

    /// Walks dependencies among the nodes Kahn's pass could not free until a
    /// node repeats. Every such node has at least one unfreed dependency.
    fn describe_cycle(&self, in_degree: &[usize]) -> String {
        let Some(start) = in_degree.iter().position(|&d| d > 0) else {
            return String::from("unknown");
        };

        let mut path: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&first) = position.get(&current) {
                let mut cycle: Vec<&str> = path[first..]
                    .iter()
                    .map(|&i| self.nodes[i].urn.as_str())
                    .collect();
                cycle.push(self.nodes[current].urn.as_str());
                return cycle.join(" -> ");
            }
            position.insert(current, path.len());
            path.push(current);
            match self.nodes[current]
                .dependencies
                .iter()
                .find(|&&d| in_degree[d] > 0)
            {
                Some(&next) => current = next,
                None => return String::from("unknown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(name: &str) -> Urn {
        Urn::new("dev", "web", None, "test:Thing", name)
    }

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for name in nodes {
            graph.add_node(urn(name));
        }
        for (from, to) in edges {
            graph.add_dependency(&urn(from), &urn(to));
        }
        graph
    }

    #[test]
    fn test_independent_nodes_keep_insertion_order() {
        let graph = graph(&[], &["c", "a", "b"]);
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![urn("c"), urn("a"), urn("b")]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = graph(&[("b", "a"), ("c", "b")], &["c", "b", "a"]);
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![urn("a"), urn("b"), urn("c")]);
    }

    #[test]
    fn test_diamond() {
        let graph = graph(
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
            &["a", "b", "c", "d"],
        );
        let order = graph.topological_order().unwrap();
        assert_eq!(order.first(), Some(&urn("a")));
        assert_eq!(order.last(), Some(&urn("d")));
    }

    #[test]
    fn test_cycle_is_named() {
        let graph = graph(&[("a", "b"), ("b", "c"), ("c", "a")], &["a", "b", "c", "x"]);
        let err = graph.topological_order().unwrap_err();
        let PlanError::CyclicDependency { cycle } = err else {
            panic!("expected a cycle error");
        };
        assert!(cycle.contains(urn("a").as_str()));
        assert!(cycle.contains(urn("c").as_str()));
        assert!(!cycle.contains(urn("x").as_str()));
        assert_eq!(cycle.matches(" -> ").count(), 3);
    }

    #[test]
    fn test_edges_to_unknown_nodes_are_ignored() {
        let mut graph = graph(&[], &["a"]);
        assert!(!graph.add_dependency(&urn("a"), &urn("elsewhere")));
        assert_eq!(graph.topological_order().unwrap(), vec![urn("a")]);
        assert!(graph.dependencies(&urn("a")).is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = graph(&[("b", "a"), ("c", "b"), ("d", "x")], &["a", "b", "c", "d", "x"]);
        let dependents = graph.transitive_dependents(&urn("a"));
        assert_eq!(dependents, vec![&urn("b"), &urn("c")]);
        assert!(graph.transitive_dependents(&urn("c")).is_empty());
        assert_eq!(graph.len(), 5);
    }
}
