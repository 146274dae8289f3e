//! Graph Traversal
//!
//! Read-only queries over the edge set: cycle checks, topological ordering
//! and reachability in either direction.
//!
//! # Algorithm
//!
//! Topological ordering uses Kahn's algorithm:
//!
//! 1. Count incoming edges for every registered node
//! 2. Queue the nodes with no incoming edges, in insertion order
//! 3. Pop a node, emit it, and decrement the count of each of its targets,
//!    queueing targets that reach zero
//! 4. If fewer nodes were emitted than registered, the rest sit on a cycle

use std::collections::{HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};

use super::key::{NodeKey, NodeRef};
use super::registry::Graph;
use crate::error::{Error, Result};

impl Graph {
    /// Whether adding `source -> target` would close a cycle, i.e. whether
    /// `target` already reaches `source`.
    pub fn creates_cycle<'a, 'b>(
        &self,
        source: impl Into<NodeRef<'a>>,
        target: impl Into<NodeRef<'b>>,
    ) -> Result<bool> {
        let source = self.key(source)?;
        let target = self.key(target)?;
        Ok(self.reaches(&target, &source))
    }

    /// Every registered node, ordered so that each edge points forward.
    pub fn topological_sort(&self) -> Result<Vec<NodeKey>> {
        let mut in_degree: IndexMap<&NodeKey, usize> =
            self.nodes.keys().map(|key| (key, 0)).collect();
        for (_, target) in self.edges() {
            if let Some(degree) = in_degree.get_mut(target) {
                *degree += 1;
            }
        }

        let mut queue: VecDeque<&NodeKey> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&key, _)| key)
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        // Kahn's algorithm
        while let Some(key) = queue.pop_front() {
            result.push(key.clone());

            for target in self.targets_of(key) {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            return Err(Error::ResidualCycle {
                sorted: result.len(),
                total: self.nodes.len(),
            });
        }
        Ok(result)
    }

    /// Nodes with an edge into `node`.
    pub fn predecessors<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<Vec<NodeKey>> {
        let key = self.registered(node)?;
        Ok(self.predecessor_keys(&key))
    }

    /// Nodes `node` has an edge to.
    pub fn successors<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<Vec<NodeKey>> {
        let key = self.registered(node)?;
        Ok(self.targets_of(&key).cloned().collect())
    }

    /// Every node that reaches `node`.
    pub fn ancestors<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<Vec<NodeKey>> {
        let key = self.registered(node)?;
        Ok(self.walk(&key, |k| self.predecessor_keys(k)))
    }

    /// Every node reachable from `node`.
    pub fn descendants<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<Vec<NodeKey>> {
        let key = self.registered(node)?;
        Ok(self.walk(&key, |k| self.targets_of(k).cloned().collect()))
    }

    /// Nodes without incoming edges.
    pub fn sources(&self) -> Vec<NodeKey> {
        let targets: HashSet<&NodeKey> = self.edges().map(|(_, target)| target).collect();
        self.nodes
            .keys()
            .filter(|key| !targets.contains(key))
            .cloned()
            .collect()
    }

    /// Nodes without outgoing edges.
    pub fn sinks(&self) -> Vec<NodeKey> {
        self.nodes
            .keys()
            .filter(|key| self.targets_of(key).next().is_none())
            .cloned()
            .collect()
    }

    pub fn in_degree<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<usize> {
        let key = self.registered(node)?;
        Ok(self.edges().filter(|(_, target)| **target == key).count())
    }

    pub fn out_degree<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<usize> {
        let key = self.registered(node)?;
        Ok(self.targets_of(&key).count())
    }

    pub fn has_edge<'a, 'b>(
        &self,
        source: impl Into<NodeRef<'a>>,
        target: impl Into<NodeRef<'b>>,
    ) -> Result<bool> {
        let source = self.key(source)?;
        let target = self.key(target)?;
        Ok(self.has_edge_keys(&source, &target))
    }

    /// The first path from `source` to `target` found by depth-first search.
    pub fn find_path<'a, 'b>(
        &self,
        source: impl Into<NodeRef<'a>>,
        target: impl Into<NodeRef<'b>>,
    ) -> Result<Option<Vec<NodeKey>>> {
        let source = self.registered(source)?;
        let target = self.registered(target)?;

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.path_dfs(&source, &target, &mut visited, &mut path) {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    /// Groups of nodes connected when edge direction is ignored.
    pub fn connected_components(&self) -> Vec<Vec<NodeKey>> {
        let mut neighbours: IndexMap<&NodeKey, IndexSet<&NodeKey>> =
            self.nodes.keys().map(|key| (key, IndexSet::new())).collect();
        for (source, target) in self.edges() {
            neighbours.entry(source).or_default().insert(target);
            neighbours.entry(target).or_default().insert(source);
        }

        let mut seen: HashSet<&NodeKey> = HashSet::new();
        let mut components = Vec::new();
        for &start in neighbours.keys() {
            if !seen.insert(start) {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![start];
            while let Some(key) = stack.pop() {
                component.push(key.clone());
                for &next in &neighbours[key] {
                    if seen.insert(next) {
                        stack.push(next);
                    }
                }
            }
            components.push(component);
        }
        components
    }

    pub(super) fn has_edge_keys(&self, source: &NodeKey, target: &NodeKey) -> bool {
        self.edges
            .get(source)
            .is_some_and(|targets| targets.contains(target))
    }

    pub(super) fn predecessor_keys(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.contains(key))
            .map(|(source, _)| source.clone())
            .collect()
    }

    /// Depth-first reachability over outgoing edges. `from` reaches itself.
    pub(super) fn reaches(&self, from: &NodeKey, to: &NodeKey) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(key) = stack.pop() {
            if key == to {
                return true;
            }
            if visited.insert(key) {
                stack.extend(self.targets_of(key));
            }
        }
        false
    }

    fn targets_of<'g>(&'g self, key: &NodeKey) -> impl Iterator<Item = &'g NodeKey> {
        self.edges.get(key).into_iter().flatten()
    }

    /// Breadth-first closure of `start` under `next`, excluding `start`.
    fn walk<F>(&self, start: &NodeKey, next: F) -> Vec<NodeKey>
    where
        F: Fn(&NodeKey) -> Vec<NodeKey>,
    {
        let mut seen = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([start.clone()]);
        let mut out = Vec::new();
        while let Some(key) = queue.pop_front() {
            for neighbour in next(&key) {
                if seen.insert(neighbour.clone()) {
                    out.push(neighbour.clone());
                    queue.push_back(neighbour);
                }
            }
        }
        out
    }

    fn path_dfs(
        &self,
        current: &NodeKey,
        target: &NodeKey,
        visited: &mut HashSet<NodeKey>,
        path: &mut Vec<NodeKey>,
    ) -> bool {
        path.push(current.clone());
        if current == target {
            return true;
        }
        visited.insert(current.clone());
        for next in self.targets_of(current) {
            if !visited.contains(next) && self.path_dfs(next, target, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Utf8Codec;
    use crate::reactive::Node;
    use serde_json::json;

    fn key(id: &str) -> NodeKey {
        NodeKey::from_bytes(id.as_bytes())
    }

    fn keys(ids: &[&str]) -> Vec<NodeKey> {
        ids.iter().map(|id| key(id)).collect()
    }

    /// a -> b -> d, a -> c -> d, e isolated
    fn diamond() -> Graph {
        let mut graph = Graph::with_codec(Utf8Codec);
        for id in ["a", "b", "c", "d", "e"] {
            graph.add_node(&Node::builder().id(id).value(json!(0))).unwrap();
        }
        for (s, t) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
            graph.connect(s, t).unwrap();
        }
        graph
    }

    #[test]
    fn topological_order_respects_every_edge() {
        let graph = diamond();
        let order = graph.topological_sort().unwrap();
        assert_eq!(order.len(), 5);
        for (source, target) in graph.edges() {
            let s = order.iter().position(|k| k == source).unwrap();
            let t = order.iter().position(|k| k == target).unwrap();
            assert!(s < t, "{source:?} must precede {target:?}");
        }
    }

    #[test]
    fn residual_cycle_is_reported() {
        let mut graph = diamond();
        // Bypass `connect` to plant a cycle.
        graph.edges.entry(key("d")).or_default().insert(key("a"));
        assert_eq!(
            graph.topological_sort(),
            Err(Error::ResidualCycle { sorted: 1, total: 5 })
        );
    }

    #[test]
    fn cycle_check_follows_existing_edges() {
        let graph = diamond();
        assert!(graph.creates_cycle("d", "a").unwrap());
        assert!(graph.creates_cycle("a", "a").unwrap());
        assert!(!graph.creates_cycle("a", "d").unwrap());
        assert!(!graph.creates_cycle("e", "a").unwrap());
    }

    #[test]
    fn neighbour_queries() {
        let graph = diamond();
        assert_eq!(graph.successors("a").unwrap(), keys(&["b", "c"]));
        assert_eq!(graph.predecessors("d").unwrap(), keys(&["b", "c"]));
        assert_eq!(graph.in_degree("d").unwrap(), 2);
        assert_eq!(graph.out_degree("d").unwrap(), 0);
        assert!(graph.has_edge("a", "b").unwrap());
        assert!(!graph.has_edge("b", "a").unwrap());
        assert!(matches!(graph.successors("zzz"), Err(Error::NodeNotFound(_))));
    }

    #[test]
    fn transitive_queries() {
        let graph = diamond();
        assert_eq!(graph.descendants("a").unwrap(), keys(&["b", "c", "d"]));
        assert_eq!(graph.ancestors("d").unwrap(), keys(&["b", "c", "a"]));
        assert!(graph.ancestors("e").unwrap().is_empty());
    }

    #[test]
    fn sources_and_sinks() {
        let graph = diamond();
        assert_eq!(graph.sources(), keys(&["a", "e"]));
        assert_eq!(graph.sinks(), keys(&["d", "e"]));
    }

    #[test]
    fn path_search() {
        let graph = diamond();
        assert_eq!(graph.find_path("a", "d").unwrap(), Some(keys(&["a", "b", "d"])));
        assert_eq!(graph.find_path("d", "a").unwrap(), None);
        assert_eq!(graph.find_path("e", "e").unwrap(), Some(keys(&["e"])));
    }

    #[test]
    fn weakly_connected_components() {
        let graph = diamond();
        let mut components: Vec<Vec<NodeKey>> = graph
            .connected_components()
            .into_iter()
            .map(|mut c| {
                c.sort();
                c
            })
            .collect();
        components.sort();
        assert_eq!(components, vec![keys(&["a", "b", "c", "d"]), keys(&["e"])]);
    }
}
