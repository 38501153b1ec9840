use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};

/// Dependency graph over registered descriptor paths, derived from include
/// references. Forward edges run artifact → included artifact; the reverse
/// view drives invalidation when an included file changes.
#[derive(Debug, Default)]
pub(crate) struct ReloadGraph {
    forward: FxHashMap<PathBuf, FxHashSet<PathBuf>>,
    reverse: FxHashMap<PathBuf, FxHashSet<PathBuf>>,
}

impl ReloadGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the out-edges of `node` with `includes`.
    pub fn set_dependencies(&mut self, node: &Path, includes: &[PathBuf]) {
        self.remove_forward(node);

        let deps: FxHashSet<PathBuf> = includes
            .iter()
            .filter(|p| p.as_path() != node)
            .cloned()
            .collect();
        for dep in &deps {
            self.reverse
                .entry(dep.clone())
                .or_default()
                .insert(node.to_path_buf());
        }
        if !deps.is_empty() {
            self.forward.insert(node.to_path_buf(), deps);
        }
    }

    /// Artifacts that directly include `path`.
    pub fn dependents_of(&self, path: &Path) -> Vec<PathBuf> {
        self.reverse
            .get(path)
            .map(|set| {
                let mut dependents: Vec<PathBuf> = set.iter().cloned().collect();
                dependents.sort();
                dependents
            })
            .unwrap_or_default()
    }

    pub fn dependencies_of(&self, path: &Path) -> Vec<PathBuf> {
        self.forward
            .get(path)
            .map(|set| {
                let mut deps: Vec<PathBuf> = set.iter().cloned().collect();
                deps.sort();
                deps
            })
            .unwrap_or_default()
    }

    pub fn remove(&mut self, node: &Path) {
        self.remove_forward(node);
        if let Some(dependents) = self.reverse.remove(node) {
            for dependent in dependents {
                if let Some(deps) = self.forward.get_mut(&dependent) {
                    deps.remove(node);
                    if deps.is_empty() {
                        self.forward.remove(&dependent);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    fn remove_forward(&mut self, node: &Path) {
        if let Some(old) = self.forward.remove(node) {
            for dep in old {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(node);
                    if dependents.is_empty() {
                        self.reverse.remove(&dep);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_set_dependencies_replaces_edges() {
        let mut graph = ReloadGraph::new();
        graph.set_dependencies(&p("/ui/main.json"), &[p("/ui/a.json"), p("/ui/b.json")]);
        assert_eq!(graph.dependents_of(&p("/ui/a.json")), vec![p("/ui/main.json")]);

        graph.set_dependencies(&p("/ui/main.json"), &[p("/ui/b.json")]);
        assert!(graph.dependents_of(&p("/ui/a.json")).is_empty());
        assert_eq!(graph.dependents_of(&p("/ui/b.json")), vec![p("/ui/main.json")]);
    }

    #[test]
    fn test_self_include_ignored() {
        let mut graph = ReloadGraph::new();
        graph.set_dependencies(&p("/ui/a.json"), &[p("/ui/a.json")]);
        assert!(graph.dependents_of(&p("/ui/a.json")).is_empty());
    }

    #[test]
    fn test_remove_prunes_both_directions() {
        let mut graph = ReloadGraph::new();
        graph.set_dependencies(&p("/ui/main.json"), &[p("/ui/part.json")]);
        graph.set_dependencies(&p("/ui/part.json"), &[p("/ui/leaf.json")]);

        graph.remove(&p("/ui/part.json"));
        assert!(graph.dependents_of(&p("/ui/leaf.json")).is_empty());
        assert!(graph.dependencies_of(&p("/ui/main.json")).is_empty());
    }
}
