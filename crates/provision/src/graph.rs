//! Dependency graph validation and ordering

use crate::error::ValidationError;
use crate::node::ResourceNode;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

/// A validated, acyclic set of resource nodes
///
/// Node indices follow declaration order; every ordering decision breaks
/// ties by that index so repeated runs schedule identically.
#[derive(Debug, Clone)]
pub struct ProvisionGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    /// `deps[i]` are the nodes `i` depends on
    deps: Vec<Vec<usize>>,
    /// `dependents[i]` are the nodes that depend on `i`
    dependents: Vec<Vec<usize>>,
}

impl ProvisionGraph {
    /// Validate nodes and build the graph
    pub fn build(nodes: Vec<ResourceNode>) -> Result<Self, ValidationError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.name.trim().is_empty() {
                return Err(ValidationError::EmptyName);
            }
            if index.insert(node.name.clone(), i).is_some() {
                return Err(ValidationError::DuplicateNode(node.name.clone()));
            }
        }

        let mut deps = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(ValidationError::UnknownDependency {
                        node: node.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                deps[i].push(d);
                dependents[d].push(i);
            }
        }
        for list in deps.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
        }

        let graph = Self {
            nodes,
            index,
            deps,
            dependents,
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(ValidationError::CyclicDependency { cycle });
        }
        Ok(graph)
    }

    /// Restrict the graph to `targets` and everything they depend on
    pub fn select(self, targets: &[String]) -> Result<Self, ValidationError> {
        let mut keep = vec![false; self.nodes.len()];
        let mut queue = VecDeque::new();
        for target in targets {
            let &i = self
                .index
                .get(target)
                .ok_or_else(|| ValidationError::UnknownTarget(target.clone()))?;
            queue.push_back(i);
        }
        while let Some(i) = queue.pop_front() {
            if !keep[i] {
                keep[i] = true;
                queue.extend(self.deps[i].iter().copied());
            }
        }

        let nodes = self
            .nodes
            .into_iter()
            .zip(keep)
            .filter_map(|(node, kept)| kept.then_some(node))
            .collect();
        Self::build(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub(crate) fn node_at(&self, i: usize) -> &ResourceNode {
        &self.nodes[i]
    }

    pub(crate) fn node_at_mut(&mut self, i: usize) -> &mut ResourceNode {
        &mut self.nodes[i]
    }

    pub(crate) fn dependency_count(&self, i: usize) -> usize {
        self.deps[i].len()
    }

    pub(crate) fn dependent_indices(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Deterministic topological order (Kahn, ties by declaration order)
    pub fn topological_order(&self) -> Vec<String> {
        self.topological_indices()
            .into_iter()
            .map(|i| self.nodes[i].name.clone())
            .collect()
    }

    pub(crate) fn topological_indices(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
        order
    }

    /// Names of nodes that directly depend on `name`
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.nodes[d].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of every node that transitively depends on `name`
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.transitive_dependent_indices(i)
                    .into_iter()
                    .map(|d| self.nodes[d].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive dependents of node `i`, sorted by declaration order
    pub(crate) fn transitive_dependent_indices(&self, i: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = self.dependents[i].iter().copied().collect();
        let mut found = Vec::new();
        while let Some(d) = queue.pop_front() {
            if !seen[d] {
                seen[d] = true;
                found.push(d);
                queue.extend(self.dependents[d].iter().copied());
            }
        }
        found.sort_unstable();
        found
    }

    /// Depth-first search for a back edge, returned as a closed path
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            i: usize,
            deps: &[Vec<usize>],
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[i] = Mark::Active;
            path.push(i);
            for &d in &deps[i] {
                match marks[d] {
                    Mark::Active => {
                        let start = path.iter().position(|&p| p == d)?;
                        let mut cycle = path[start..].to_vec();
                        cycle.push(d);
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(d, deps, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut path = Vec::new();
        for i in 0..self.nodes.len() {
            if marks[i] == Mark::New
                && let Some(cycle) = visit(i, &self.deps, &mut marks, &mut path)
            {
                return Some(
                    cycle
                        .into_iter()
                        .map(|c| self.nodes[c].name.clone())
                        .collect(),
                );
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FnAction, ProvisionAction};
    use serde_json::json;
    use std::sync::Arc;

    fn node(name: &str, deps: &[&str]) -> ResourceNode {
        let action: Arc<dyn ProvisionAction> = Arc::new(FnAction::new(name, |_, _| Ok(json!({}))));
        ResourceNode::new(name, action).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_topological_order_ties_follow_declaration() {
        let graph = ProvisionGraph::build(vec![
            node("service", &["database", "cache"]),
            node("vpc", &[]),
            node("database", &["vpc"]),
            node("cache", &["vpc"]),
            node("dns", &[]),
        ])
        .unwrap();

        assert_eq!(
            graph.topological_order(),
            vec!["vpc", "database", "cache", "service", "dns"]
        );
    }

    #[test]
    fn test_duplicate_node() {
        let err = ProvisionGraph::build(vec![node("vpc", &[]), node("vpc", &[])]).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateNode("vpc".into()));
    }

    #[test]
    fn test_empty_name() {
        let err = ProvisionGraph::build(vec![node(" ", &[])]).unwrap_err();
        assert_eq!(err, ValidationError::EmptyName);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ProvisionGraph::build(vec![node("database", &["vpc"])]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                node: "database".into(),
                dependency: "vpc".into(),
            }
        );
    }

    #[test]
    fn test_cycle_reported_as_path() {
        let err = ProvisionGraph::build(vec![node("a", &["b"]), node("b", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()],
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = ProvisionGraph::build(vec![node("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CyclicDependency {
                cycle: vec!["a".into(), "a".into()],
            }
        );
    }

    #[test]
    fn test_longer_cycle_behind_acyclic_prefix() {
        let err = ProvisionGraph::build(vec![
            node("root", &[]),
            node("x", &["root", "z"]),
            node("y", &["x"]),
            node("z", &["y"]),
        ])
        .unwrap_err();

        let ValidationError::CyclicDependency { cycle } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(cycle, vec!["x", "z", "y", "x"]);
    }

    #[test]
    fn test_dependents() {
        let graph = ProvisionGraph::build(vec![
            node("vpc", &[]),
            node("database", &["vpc"]),
            node("cache", &["vpc"]),
            node("service", &["database", "cache"]),
        ])
        .unwrap();

        assert_eq!(graph.dependents_of("vpc"), vec!["database", "cache"]);
        assert_eq!(
            graph.transitive_dependents("vpc"),
            vec!["database", "cache", "service"]
        );
        assert!(graph.transitive_dependents("service").is_empty());
        assert!(graph.dependents_of("missing").is_empty());
    }

    #[test]
    fn test_select_keeps_dependencies() {
        let graph = ProvisionGraph::build(vec![
            node("vpc", &[]),
            node("database", &["vpc"]),
            node("cache", &["vpc"]),
            node("service", &["database", "cache"]),
        ])
        .unwrap();

        let selected = graph.select(&["database".to_string()]).unwrap();
        assert_eq!(selected.topological_order(), vec!["vpc", "database"]);
    }

    #[test]
    fn test_select_unknown_target() {
        let graph = ProvisionGraph::build(vec![node("vpc", &[])]).unwrap();
        let err = graph.select(&["dns".to_string()]).unwrap_err();
        assert_eq!(err, ValidationError::UnknownTarget("dns".into()));
    }
}
