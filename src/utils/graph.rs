//! Directed graphs keyed by domain values.
//!
//! [`IndexedGraph`] maps keys (assembly paths, names) to dense node indices and offers the two
//! queries the signing planner needs: a topological order and, when there is none, a cycle.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

/// A directed graph whose nodes are identified by keys of type `K`.
///
/// Nodes are kept in insertion order; all orderings produced by this type are deterministic
/// for a given sequence of insertions.
///
/// # Examples
///
/// ```rust
/// use pesmith::utils::graph::IndexedGraph;
///
/// let mut graph = IndexedGraph::new();
/// graph.add_edge("Base", "App");
/// graph.add_edge("Base", "Plugin");
/// graph.add_edge("Plugin", "App");
///
/// assert_eq!(graph.topological_sort(), Some(vec!["Base", "Plugin", "App"]));
/// ```
#[derive(Debug, Clone)]
pub struct IndexedGraph<K>
where
    K: Hash + Eq + Clone,
{
    keys: Vec<K>,
    key_to_node: HashMap<K, usize>,
    successors: Vec<Vec<usize>>,
}

impl<K> Default for IndexedGraph<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> IndexedGraph<K>
where
    K: Hash + Eq + Clone,
{
    /// An empty graph
    #[must_use]
    pub fn new() -> Self {
        IndexedGraph {
            keys: Vec::new(),
            key_to_node: HashMap::new(),
            successors: Vec::new(),
        }
    }

    /// Adds a node, returning its index. Adding an existing key returns the existing index.
    pub fn add_node(&mut self, key: K) -> usize {
        if let Some(&node) = self.key_to_node.get(&key) {
            return node;
        }
        let node = self.keys.len();
        self.keys.push(key.clone());
        self.key_to_node.insert(key, node);
        self.successors.push(Vec::new());
        node
    }

    /// Adds an edge `from -> to`, creating missing nodes. Returns false if it already existed.
    pub fn add_edge(&mut self, from: K, to: K) -> bool {
        let from = self.add_node(from);
        let to = self.add_node(to);
        if self.successors[from].contains(&to) {
            return false;
        }
        self.successors[from].push(to);
        true
    }

    /// Number of nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if `key` is a node
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.key_to_node.contains_key(key)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    /// Orders the nodes so that every edge points forward.
    ///
    /// Returns `None` if the graph contains a cycle.
    #[must_use]
    pub fn topological_sort(&self) -> Option<Vec<K>> {
        let mut in_degree = vec![0_usize; self.keys.len()];
        for targets in &self.successors {
            for &target in targets {
                in_degree[target] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..self.keys.len())
            .filter(|&node| in_degree[node] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.keys.len());
        while let Some(node) = ready.pop_front() {
            order.push(self.keys[node].clone());
            for &target in &self.successors[node] {
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.push_back(target);
                }
            }
        }

        (order.len() == self.keys.len()).then_some(order)
    }

    /// Finds a cycle, returned as the path of keys with the first key repeated at the end.
    #[must_use]
    pub fn find_any_cycle(&self) -> Option<Vec<K>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::New; self.keys.len()];
        for start in 0..self.keys.len() {
            if marks[start] != Mark::New {
                continue;
            }

            // Iterative DFS; each frame is (node, next successor to visit).
            let mut path: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::OnPath;
            while let Some(frame) = path.last_mut() {
                let node = frame.0;
                if let Some(&target) = self.successors[node].get(frame.1) {
                    frame.1 += 1;
                    match marks[target] {
                        Mark::New => {
                            marks[target] = Mark::OnPath;
                            path.push((target, 0));
                        }
                        Mark::OnPath => {
                            let position = path.iter().position(|(n, _)| *n == target)?;
                            let mut cycle: Vec<K> = path[position..]
                                .iter()
                                .map(|(n, _)| self.keys[*n].clone())
                                .collect();
                            cycle.push(self.keys[target].clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    path.pop();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_nodes_and_edges() {
        let mut graph = IndexedGraph::new();
        assert_eq!(graph.add_node("A"), graph.add_node("A"));
        assert!(graph.add_edge("A", "B"));
        assert!(!graph.add_edge("A", "B"));
        assert_eq!(graph.node_count(), 2);
        assert!(graph.contains(&"B"));
    }

    #[test]
    fn topological_order_respects_edges() {
        let mut graph = IndexedGraph::new();
        graph.add_node("Isolated");
        graph.add_edge("C", "B");
        graph.add_edge("B", "A");
        graph.add_edge("C", "A");

        let order = graph.topological_sort().unwrap();
        let index = |k| order.iter().position(|x| *x == k).unwrap();
        assert!(index("C") < index("B"));
        assert!(index("B") < index("A"));
        assert_eq!(order.len(), 4);
        assert!(graph.find_any_cycle().is_none());
    }

    #[test]
    fn cycles_are_reported() {
        let mut graph = IndexedGraph::new();
        graph.add_edge("Root", "A");
        graph.add_edge("A", "B");
        graph.add_edge("B", "C");
        graph.add_edge("C", "A");

        assert!(graph.topological_sort().is_none());
        assert_eq!(
            graph.find_any_cycle().unwrap(),
            vec!["A", "B", "C", "A"]
        );
    }
}
