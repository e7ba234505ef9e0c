//! Tool dependency graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Coarse scheduling status of a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Ready,
    Waiting,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Ready => "ready",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A tool and its place in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub tool_name: String,
    pub dependencies: Vec<String>,
    /// Tools that declared this one as a dependency.
    pub dependents: Vec<String>,
    pub status: NodeStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

/// In-memory graph of tool-to-tool ordering constraints.
#[derive(Debug, Default)]
pub struct ToolDependencyGraph {
    nodes: RwLock<BTreeMap<String, DependencyNode>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl ToolDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool and the tools it depends on.
    ///
    /// Re-registering a tool replaces its dependencies and keeps its run
    /// bookkeeping. Reverse edges are filled in on both sides, so the
    /// registration order of a tool and its dependencies does not matter.
    pub fn add_node(&self, tool_name: impl Into<String>, dependencies: Vec<String>) {
        let tool_name = tool_name.into();
        let mut nodes = self.nodes.write();

        let mut dependencies = dependencies;
        let mut seen = BTreeSet::new();
        dependencies.retain(|dep| seen.insert(dep.clone()));

        if let Some(previous) = nodes.get(&tool_name).map(|n| n.dependencies.clone()) {
            for dep in previous {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.retain(|d| *d != tool_name);
                }
            }
        }

        for dep in &dependencies {
            if let Some(dep_node) = nodes.get_mut(dep)
                && !dep_node.dependents.contains(&tool_name)
            {
                dep_node.dependents.push(tool_name.clone());
            }
        }

        let dependents: Vec<String> = nodes
            .values()
            .filter(|n| n.tool_name != tool_name && n.dependencies.contains(&tool_name))
            .map(|n| n.tool_name.clone())
            .collect();

        let node = nodes
            .entry(tool_name.clone())
            .or_insert_with(|| DependencyNode {
                tool_name: tool_name.clone(),
                dependencies: Vec::new(),
                dependents: Vec::new(),
                status: NodeStatus::Ready,
                last_run: None,
                run_count: 0,
            });
        node.dependencies = dependencies;
        node.dependents = dependents;
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.nodes.read().contains_key(tool_name)
    }

    pub fn node(&self, tool_name: &str) -> Option<DependencyNode> {
        self.nodes.read().get(tool_name).cloned()
    }

    pub fn dependents(&self, tool_name: &str) -> Vec<String> {
        self.nodes
            .read()
            .get(tool_name)
            .map(|n| n.dependents.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Update a tool's status. Returns false if the tool is unknown.
    pub fn set_status(&self, tool_name: &str, status: NodeStatus) -> bool {
        match self.nodes.write().get_mut(tool_name) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    /// Count a run of the tool and stamp its last-run time.
    pub fn record_run(&self, tool_name: &str, at: DateTime<Utc>) -> bool {
        match self.nodes.write().get_mut(tool_name) {
            Some(node) => {
                node.run_count += 1;
                node.last_run = Some(at);
                true
            }
            None => false,
        }
    }

    /// Tools ordered so every tool comes after its dependencies.
    ///
    /// Depth-first post-order over tool names in sorted order, so the result
    /// is deterministic. Fails with [`CoordinationError::CyclicDependency`]
    /// naming the cycle, or [`CoordinationError::UnknownDependency`] when a
    /// dependency was never registered.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let nodes = self.nodes.read();
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(nodes.len());
        let mut order = Vec::with_capacity(nodes.len());
        let mut path = Vec::new();

        for name in nodes.keys() {
            visit(&nodes, name, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    /// Tools grouped into levels that can run in parallel.
    ///
    /// Level 0 has no dependencies; each later level depends only on
    /// earlier ones. Names within a level are sorted.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>> {
        // Surfaces cycles and unknown dependencies with the same errors.
        self.execution_order()?;

        let nodes = self.nodes.read();
        let mut remaining: BTreeMap<&str, usize> = nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.dependencies.len()))
            .collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let level: Vec<String> = remaining
                .iter()
                .filter(|(_, pending)| **pending == 0)
                .map(|(name, _)| name.to_string())
                .collect();
            if level.is_empty() {
                break;
            }
            for name in &level {
                remaining.remove(name.as_str());
                if let Some(node) = nodes.get(name) {
                    for dependent in &node.dependents {
                        if let Some(pending) = remaining.get_mut(dependent.as_str()) {
                            *pending = pending.saturating_sub(1);
                        }
                    }
                }
            }
            levels.push(level);
        }
        Ok(levels)
    }
}

fn visit<'a>(
    nodes: &'a BTreeMap<String, DependencyNode>,
    name: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(name.to_string());
            return Err(CoordinationError::CyclicDependency { path: cycle });
        }
        None => {}
    }

    let Some(node) = nodes.get(name) else {
        return Err(CoordinationError::UnknownDependency {
            tool: path.last().map(|n| n.to_string()).unwrap_or_default(),
            dependency: name.to_string(),
        });
    };

    marks.insert(name, Mark::Visiting);
    path.push(name);
    for dep in &node.dependencies {
        visit(nodes, dep, marks, path, order)?;
    }
    path.pop();
    marks.insert(name, Mark::Done);
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_order_respects_dependencies() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("C", deps(&["A", "B"]));
        graph.add_node("B", deps(&["A"]));
        graph.add_node("A", vec![]);

        let order = graph.execution_order().unwrap();
        assert_eq!(order.len(), 3);
        assert!(position(&order, "A") < position(&order, "B"));
        assert!(position(&order, "B") < position(&order, "C"));
    }

    #[test]
    fn test_reverse_edges_backfilled() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("build_image", deps(&["generate_dockerfile"]));
        graph.add_node("generate_dockerfile", deps(&["analyze_repository"]));
        graph.add_node("analyze_repository", vec![]);

        assert_eq!(graph.dependents("generate_dockerfile"), vec!["build_image"]);
        assert_eq!(graph.dependents("analyze_repository"), vec!["generate_dockerfile"]);

        // Re-registering drops the stale reverse edge.
        graph.add_node("build_image", vec![]);
        assert!(graph.dependents("generate_dockerfile").is_empty());
    }

    #[test]
    fn test_cycle_is_reported() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("a", deps(&["b"]));
        graph.add_node("b", deps(&["c"]));
        graph.add_node("c", deps(&["a"]));

        match graph.execution_order() {
            Err(CoordinationError::CyclicDependency { path }) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(matches!(
            graph.execution_levels(),
            Err(CoordinationError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("loop", deps(&["loop"]));
        assert!(matches!(
            graph.execution_order(),
            Err(CoordinationError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("deploy_kubernetes", deps(&["generate_manifests"]));

        match graph.execution_order() {
            Err(CoordinationError::UnknownDependency { tool, dependency }) => {
                assert_eq!(tool, "deploy_kubernetes");
                assert_eq!(dependency, "generate_manifests");
            }
            other => panic!("expected unknown dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_execution_levels() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("analyze_repository", vec![]);
        graph.add_node("generate_dockerfile", deps(&["analyze_repository"]));
        graph.add_node("generate_manifests", deps(&["analyze_repository"]));
        graph.add_node("build_image", deps(&["generate_dockerfile"]));
        graph.add_node(
            "deploy_kubernetes",
            deps(&["build_image", "generate_manifests"]),
        );

        let levels = graph.execution_levels().unwrap();
        assert_eq!(
            levels,
            vec![
                deps(&["analyze_repository"]),
                deps(&["generate_dockerfile", "generate_manifests"]),
                deps(&["build_image"]),
                deps(&["deploy_kubernetes"]),
            ]
        );
    }

    #[test]
    fn test_bookkeeping() {
        let graph = ToolDependencyGraph::new();
        graph.add_node("scan_security", vec![]);
        let now = Utc::now();

        assert!(graph.set_status("scan_security", NodeStatus::Running));
        assert!(graph.record_run("scan_security", now));
        assert!(graph.record_run("scan_security", now));
        assert!(!graph.record_run("missing", now));

        let node = graph.node("scan_security").unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.run_count, 2);
        assert_eq!(node.last_run, Some(now));

        // Re-registration keeps run history.
        graph.add_node("scan_security", vec![]);
        assert_eq!(graph.node("scan_security").unwrap().run_count, 2);
    }
}
