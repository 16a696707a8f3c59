//! Wait-for graph between workers.
//!
//! An edge `a -> b` means worker `a` is waiting for a lock that worker `b`
//! holds. A cycle through the requesting worker is a deadlock.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` waits on `holder`. Self-edges are ignored.
    pub fn add_edge(&mut self, waiter: &str, holder: &str) {
        if waiter == holder {
            return;
        }
        self.edges
            .entry(waiter.to_string())
            .or_default()
            .insert(holder.to_string());
    }

    pub fn waits_on(&self, worker: &str) -> impl Iterator<Item = &String> {
        self.edges.get(worker).into_iter().flatten()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Depth-first search from `start` with a recursion stack.
    ///
    /// Returns the workers on the first cycle that passes through `start`,
    /// beginning with `start`.
    pub fn find_cycle_from(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();
        self.visit(start, start, &mut visited, &mut stack)
    }

    fn visit(
        &self,
        node: &str,
        start: &str,
        visited: &mut BTreeSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        stack.push(node.to_string());

        for next in self.waits_on(node) {
            if next == start {
                return Some(stack.clone());
            }
            if !visited.contains(next)
                && let Some(cycle) = self.visit(next, start, visited, stack)
            {
                return Some(cycle);
            }
        }

        stack.pop();
        None
    }

    /// Whether any cycle exists anywhere in the graph.
    pub fn has_cycle(&self) -> bool {
        self.edges
            .keys()
            .any(|worker| self.find_cycle_from(worker).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_worker_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("a", "b");
        assert!(graph.find_cycle_from("a").is_none());
        graph.add_edge("b", "a");
        assert_eq!(
            graph.find_cycle_from("b"),
            Some(vec!["b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_three_worker_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("w1", "w2");
        graph.add_edge("w2", "w3");
        assert!(!graph.has_cycle());
        graph.add_edge("w3", "w1");
        let cycle = graph.find_cycle_from("w3").unwrap();
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle[0], "w3");
    }

    #[test]
    fn test_chain_without_cycle_through_start() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "b");
        // b and c deadlock each other but a is only blocked behind them
        assert!(graph.find_cycle_from("a").is_none());
        assert!(graph.has_cycle());
    }

    #[test]
    fn test_self_edges_ignored() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("a", "a");
        assert_eq!(graph.edge_count(), 0);
    }
}
