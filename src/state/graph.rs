use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

/// Dependency graph over cell keys.
///
/// Edges run `dependent <- dependency`: a write to the dependency invalidates
/// the dependent. Both directions are indexed so invalidation walks the
/// reverse view without scanning.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    /// dependent -> its dependencies, in insertion order.
    dependencies_of: FxHashMap<String, Vec<String>>,
    /// dependency -> its dependents, in insertion order.
    dependents_of: FxHashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if inserting `dependent <- dependency` would close a cycle:
    /// i.e. `dependency` already (transitively) depends on `dependent`.
    pub fn would_cycle(&self, dependent: &str, dependency: &str) -> bool {
        if dependent == dependency {
            return true;
        }
        let mut visited = FxHashSet::default();
        let mut stack = vec![dependency];
        while let Some(node) = stack.pop() {
            if node == dependent {
                return true;
            }
            if let Some(deps) = self.dependencies_of.get(node) {
                for dep in deps {
                    if visited.insert(dep.as_str()) {
                        stack.push(dep);
                    }
                }
            }
        }
        false
    }

    /// Insert an edge; returns false if it already exists.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        let deps = self.dependencies_of.entry(dependent.to_string()).or_default();
        if deps.iter().any(|d| d == dependency) {
            return false;
        }
        deps.push(dependency.to_string());
        self.dependents_of
            .entry(dependency.to_string())
            .or_default()
            .push(dependent.to_string());
        true
    }

    /// Remove an edge; returns false if it was absent.
    pub fn remove_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        let mut removed = false;
        if let Some(deps) = self.dependencies_of.get_mut(dependent) {
            let before = deps.len();
            deps.retain(|d| d != dependency);
            removed = deps.len() != before;
            if deps.is_empty() {
                self.dependencies_of.remove(dependent);
            }
        }
        if let Some(dependents) = self.dependents_of.get_mut(dependency) {
            dependents.retain(|d| d != dependent);
            if dependents.is_empty() {
                self.dependents_of.remove(dependency);
            }
        }
        removed
    }

    /// Remove a node and every incident edge.
    pub fn remove_node(&mut self, key: &str) {
        if let Some(deps) = self.dependencies_of.remove(key) {
            for dep in deps {
                if let Some(dependents) = self.dependents_of.get_mut(&dep) {
                    dependents.retain(|d| d != key);
                    if dependents.is_empty() {
                        self.dependents_of.remove(&dep);
                    }
                }
            }
        }
        if let Some(dependents) = self.dependents_of.remove(key) {
            for dependent in dependents {
                if let Some(deps) = self.dependencies_of.get_mut(&dependent) {
                    deps.retain(|d| d != key);
                    if deps.is_empty() {
                        self.dependencies_of.remove(&dependent);
                    }
                }
            }
        }
    }

    pub fn dependencies(&self, key: &str) -> Vec<String> {
        self.dependencies_of.get(key).cloned().unwrap_or_default()
    }

    pub fn dependents(&self, key: &str) -> Vec<String> {
        self.dependents_of.get(key).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.dependencies_of.clear();
        self.dependents_of.clear();
    }

    /// All transitive dependents of `origin`, in topological order: each key
    /// appears after every one of its dependencies that is also affected.
    pub fn affected_downstream(&self, origin: &str) -> Vec<String> {
        // Reverse BFS collects the affected set in discovery order.
        let mut discovered: Vec<String> = Vec::new();
        let mut affected: FxHashSet<String> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(origin);
        while let Some(node) = queue.pop_front() {
            if let Some(dependents) = self.dependents_of.get(node) {
                for dependent in dependents {
                    if affected.insert(dependent.clone()) {
                        discovered.push(dependent.clone());
                        queue.push_back(dependent);
                    }
                }
            }
        }

        // Kahn over the subgraph induced on the affected set.
        let mut indegree: FxHashMap<&str, usize> = FxHashMap::default();
        for key in &discovered {
            let count = self
                .dependencies_of
                .get(key)
                .map(|deps| deps.iter().filter(|d| affected.contains(*d)).count())
                .unwrap_or(0);
            indegree.insert(key.as_str(), count);
        }

        let mut ready: VecDeque<&str> = discovered
            .iter()
            .map(|k| k.as_str())
            .filter(|k| indegree.get(k).copied().unwrap_or(0) == 0)
            .collect();
        let mut order = Vec::with_capacity(discovered.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.to_string());
            if let Some(dependents) = self.dependents_of.get(node) {
                for dependent in dependents {
                    if let Some(count) = indegree.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_detection() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("b", "a");
        graph.add_edge("c", "b");
        // c depends on b depends on a; a <- c would close the loop.
        assert!(graph.would_cycle("a", "c"));
        assert!(graph.would_cycle("a", "a"));
        assert!(!graph.would_cycle("c", "a"));
    }

    #[test]
    fn test_remove_node_prunes_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("sum", "a");
        graph.add_edge("sum", "b");
        graph.add_edge("display", "sum");

        graph.remove_node("sum");
        assert!(graph.dependencies("sum").is_empty());
        assert!(graph.dependents("a").is_empty());
        assert!(graph.dependencies("display").is_empty());
    }

    #[test]
    fn test_affected_downstream_is_topological() {
        let mut graph = DependencyGraph::new();
        // a -> sum -> display, a -> display (diamond-ish)
        graph.add_edge("sum", "a");
        graph.add_edge("display", "sum");
        graph.add_edge("display", "a");

        let order = graph.affected_downstream("a");
        assert_eq!(order, vec!["sum".to_string(), "display".to_string()]);
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let mut graph = DependencyGraph::new();
        assert!(graph.add_edge("sum", "a"));
        assert!(!graph.add_edge("sum", "a"));
        assert_eq!(graph.dependents("a"), vec!["sum".to_string()]);
    }
}
