//! Dependency graph resolution, cycle detection, and depth levels.
//!
//! Uses `petgraph` to model task dependencies as a directed graph with an edge
//! from each dependency to its dependent, plus an edge from a task to its
//! fallback. Topological sort detects cycles; depth-based grouping yields the
//! levels the scheduler uses for ordering and for sizing its worker pool.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use taskloom_types::error::GraphError;
use taskloom_types::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// TaskNode
// ---------------------------------------------------------------------------

/// A resolved task node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub id: String,
    /// Longest path from any root. Roots have depth 0.
    pub depth: usize,
    /// Position in the definition's task mapping.
    pub declaration_index: usize,
    /// Declared dependencies (not including a fallback owner).
    pub predecessors: Vec<String>,
    /// Tasks that declare this one as a dependency.
    pub successors: Vec<String>,
    /// Set when this task is another task's fallback.
    pub fallback_for: Option<String>,
    pub fallback: Option<String>,
}

impl TaskNode {
    pub fn is_root(&self) -> bool {
        self.predecessors.is_empty() && self.fallback_for.is_none()
    }
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// A validated, acyclic task graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: IndexMap<String, TaskNode>,
    levels: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Validate a definition and build its graph.
    ///
    /// Pure function of the definition. Checks, in order: the task mapping is
    /// non-empty, every `depends_on` entry exists, every fallback is valid,
    /// and the graph is acyclic.
    pub fn resolve(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        if definition.tasks.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        for (task_id, task) in &definition.tasks {
            for dep in &task.depends_on {
                if !definition.tasks.contains_key(dep) {
                    return Err(GraphError::DanglingDependency {
                        task_id: task_id.clone(),
                        missing_id: dep.clone(),
                    });
                }
            }
        }

        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for (task_id, task) in &definition.tasks {
            let Some(fallback) = task.fallback.as_deref() else {
                continue;
            };
            let invalid = |reason: String| GraphError::InvalidFallback {
                task_id: task_id.clone(),
                reason,
            };
            if fallback == task_id {
                return Err(invalid("a task cannot be its own fallback".to_string()));
            }
            if !definition.tasks.contains_key(fallback) {
                return Err(invalid(format!("unknown task '{fallback}'")));
            }
            if let Some(owner) = claimed.insert(fallback, task_id) {
                return Err(invalid(format!(
                    "'{fallback}' is already the fallback of '{owner}'"
                )));
            }
        }

        // Edge from dependency -> dependent, and owner -> fallback
        let mut graph = DiGraph::<&str, ()>::new();
        let indices: HashMap<&str, NodeIndex> = definition
            .tasks
            .keys()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        for (task_id, task) in &definition.tasks {
            let to = indices[task_id.as_str()];
            for dep in &task.depends_on {
                graph.add_edge(indices[dep.as_str()], to, ());
            }
            if let Some(fallback) = task.fallback.as_deref() {
                graph.add_edge(to, indices[fallback], ());
            }
        }

        let sorted = toposort(&graph, None)
            .map_err(|cycle| GraphError::CycleDetected(cycle_path(&graph, cycle.node_id())))?;

        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        for &idx in &sorted {
            let depth = graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|pred| depths.get(&pred).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(idx, depth);
        }

        let mut nodes: IndexMap<String, TaskNode> = IndexMap::with_capacity(definition.tasks.len());
        for (declaration_index, (task_id, task)) in definition.tasks.iter().enumerate() {
            nodes.insert(
                task_id.clone(),
                TaskNode {
                    id: task_id.clone(),
                    depth: depths[&indices[task_id.as_str()]],
                    declaration_index,
                    predecessors: task.depends_on.clone(),
                    successors: Vec::new(),
                    fallback_for: claimed.get(task_id.as_str()).map(|o| o.to_string()),
                    fallback: task.fallback.clone(),
                },
            );
        }
        for (task_id, task) in &definition.tasks {
            for dep in &task.depends_on {
                if let Some(node) = nodes.get_mut(dep) {
                    if !node.successors.contains(task_id) {
                        node.successors.push(task_id.clone());
                    }
                }
            }
        }

        let max_depth = nodes.values().map(|n| n.depth).max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); max_depth + 1];
        for node in nodes.values() {
            levels[node.depth].push(node.id.clone());
        }

        Ok(Self { nodes, levels })
    }

    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.get(task_id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tasks with no incoming edges, in declaration order.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.is_root())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Task ids grouped by depth; within a level, in declaration order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Number of tasks at each depth.
    pub fn level_widths(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// Widest level, used to size the worker pool.
    pub fn max_width(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Every task ordered by ascending depth, then declaration order.
    pub fn dispatch_order(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flat_map(|level| level.iter().map(String::as_str))
            .collect()
    }

    /// Ordering key for deterministic dispatch.
    pub fn priority(&self, task_id: &str) -> (usize, usize) {
        self.nodes
            .get(task_id)
            .map(|n| (n.depth, n.declaration_index))
            .unwrap_or((usize::MAX, usize::MAX))
    }

    /// All tasks transitively depending on `task_id` through `depends_on`.
    pub fn descendants(&self, task_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([task_id]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for succ in &node.successors {
                if seen.insert(succ.clone()) {
                    queue.push_back(succ);
                }
            }
        }
        seen
    }
}

/// Shortest path from `start` back to itself, as task ids.
fn cycle_path(graph: &DiGraph<&str, ()>, start: NodeIndex) -> Vec<String> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors(current) {
            if next == start {
                let mut chain = Vec::new();
                let mut cursor = current;
                while cursor != start {
                    chain.push(graph[cursor].to_string());
                    match parent.get(&cursor) {
                        Some(&p) => cursor = p,
                        None => break,
                    }
                }
                chain.reverse();

                let mut path = Vec::with_capacity(chain.len() + 2);
                path.push(graph[start].to_string());
                path.extend(chain);
                path.push(graph[start].to_string());
                return path;
            }
            if visited.insert(next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    vec![graph[start].to_string()]
}
