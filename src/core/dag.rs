//! Dependency graph over task identifiers.
//!
//! The graph is a pure relation index: it owns no task data, only the
//! `depends_on` relation and per-node weights. Edges point from dependent to
//! dependency. The engine owns the graph exclusively; callers only ever see
//! snapshots derived from it.
//!
//! Acyclicity is enforced before any edge is committed. Cycle detection and
//! the transitive walks use explicit stacks so graphs with tens of thousands
//! of nodes cannot overflow the call stack.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::NodeIndexable;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// The task dependency graph.
///
/// Wraps petgraph's DiGraph with a TaskId index for fast lookups and a
/// weight map feeding the critical-path computation.
pub struct DependencyGraph {
    /// The underlying directed graph. Edge `a -> b` means a depends on b.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex.
    index: HashMap<TaskId, NodeIndex>,
    /// Per-node cost estimate (default 1.0).
    weights: HashMap<TaskId, f64>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            weights: HashMap::new(),
        }
    }

    /// Add a node with the given critical-path weight.
    ///
    /// Adding an existing node updates its weight only.
    pub fn add_node(&mut self, id: TaskId, weight: f64) {
        self.weights.insert(id, weight);
        if !self.index.contains_key(&id) {
            let index = self.graph.add_node(id);
            self.index.insert(id, index);
        }
    }

    /// Add a dependency edge: `dependent` requires `dependency`.
    ///
    /// The edge is checked for cycles before it is committed; on a cycle the
    /// edge is removed again and `Error::Cycle` carries the offending path.
    /// The graph is left exactly as it was.
    pub fn add_edge(&mut self, dependent: TaskId, dependency: TaskId) -> Result<()> {
        if dependent == dependency {
            return Err(Error::Cycle {
                path: vec![dependent, dependent],
            });
        }
        let from = *self
            .index
            .get(&dependent)
            .ok_or(Error::TaskNotFound(dependent))?;
        let to = *self
            .index
            .get(&dependency)
            .ok_or(Error::TaskNotFound(dependency))?;

        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }

        // Tentatively add, then verify acyclicity before the edge counts.
        let edge = self.graph.add_edge(from, to, ());
        if let Some(path) = self.detect_cycle() {
            self.graph.remove_edge(edge);
            return Err(Error::Cycle { path });
        }
        Ok(())
    }

    /// Remove a node and all edges touching it.
    ///
    /// Returns false if the node was not present.
    pub fn remove_node(&mut self, id: &TaskId) -> bool {
        let Some(index) = self.index.remove(id) else {
            return false;
        };
        self.weights.remove(id);
        self.graph.remove_node(index);
        // petgraph swaps the last node into the freed slot; re-point its index.
        if let Some(moved) = self.graph.node_weight(index).copied() {
            self.index.insert(moved, index);
        }
        true
    }

    /// Whether the node exists.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// The number of nodes.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// The number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// The weight recorded for a node (default 1.0).
    pub fn weight(&self, id: &TaskId) -> f64 {
        self.weights.get(id).copied().unwrap_or(1.0)
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependents of a node.
    pub fn dependents_of(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> BTreeSet<TaskId> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, dir)
                .filter_map(|n| self.graph.node_weight(n).copied())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// All tasks that transitively depend on `id` (forward closure).
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.closure(id, Direction::Incoming)
    }

    /// All tasks `id` transitively depends on (reverse closure).
    pub fn transitive_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.closure(id, Direction::Outgoing)
    }

    fn closure(&self, id: &TaskId, dir: Direction) -> BTreeSet<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let mut result = BTreeSet::new();
        let mut stack: Vec<NodeIndex> = self.graph.neighbors_directed(start, dir).collect();

        while let Some(current) = stack.pop() {
            let Some(&task_id) = self.graph.node_weight(current) else {
                continue;
            };
            if result.insert(task_id) {
                stack.extend(self.graph.neighbors_directed(current, dir));
            }
        }
        result
    }

    /// Detect a cycle, returning its path when one exists.
    ///
    /// Iterative DFS with an on-path marker per node. A back-edge to a node
    /// still on the path yields the ordered node list from that node's first
    /// occurrence back to its repeat.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        const UNVISITED: u8 = 0;
        const ON_PATH: u8 = 1;
        const DONE: u8 = 2;

        let mut state = vec![UNVISITED; self.graph.node_bound()];
        // Start nodes sorted by id so the reported path is deterministic.
        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by_key(|&n| self.graph[n]);

        for start in starts {
            if state[start.index()] != UNVISITED {
                continue;
            }

            // Each frame holds a node and its remaining neighbors.
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
            let mut path: Vec<NodeIndex> = Vec::new();

            state[start.index()] = ON_PATH;
            path.push(start);
            stack.push((start, self.sorted_neighbors(start)));

            while let Some((_, neighbors)) = stack.last_mut() {
                match neighbors.pop() {
                    Some(next) => match state[next.index()] {
                        ON_PATH => {
                            let first = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle: Vec<TaskId> =
                                path[first..].iter().map(|&n| self.graph[n]).collect();
                            cycle.push(self.graph[next]);
                            return Some(cycle);
                        }
                        UNVISITED => {
                            state[next.index()] = ON_PATH;
                            path.push(next);
                            stack.push((next, self.sorted_neighbors(next)));
                        }
                        _ => {}
                    },
                    None => {
                        let (done, _) = stack.pop().expect("frame present");
                        state[done.index()] = DONE;
                        path.pop();
                    }
                }
            }
        }
        None
    }

    fn sorted_neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        // Popped from the back, so descending order visits lowest id first.
        neighbors.sort_by_key(|&n| std::cmp::Reverse(self.graph[n]));
        neighbors
    }

    /// The longest weighted dependency chain and its cumulative weight.
    ///
    /// Dynamic programming over a topological order; the order is always
    /// defined because the graph is acyclic by construction. Ties are broken
    /// by the lowest task id so the result is deterministic.
    pub fn critical_path(&self) -> (Vec<TaskId>, f64) {
        if self.graph.node_count() == 0 {
            return (Vec::new(), 0.0);
        }

        // toposort orders dependents before their dependencies (edges point
        // dependent -> dependency); process reversed so dependencies come first.
        let order = match toposort(&self.graph, None) {
            Ok(order) => order,
            // Unreachable while the add_edge invariant holds.
            Err(_) => return (Vec::new(), 0.0),
        };

        let mut distance: HashMap<TaskId, f64> = HashMap::new();
        let mut predecessor: HashMap<TaskId, TaskId> = HashMap::new();

        for &node in order.iter().rev() {
            let id = self.graph[node];
            let mut best: f64 = 0.0;
            let mut best_pred: Option<TaskId> = None;
            // Dependencies iterate in ascending id order, so a strict `>`
            // keeps the lowest id on ties.
            for dep in self.dependencies_of(&id) {
                let d = distance.get(&dep).copied().unwrap_or(0.0);
                if best_pred.is_none() || d > best {
                    best = d;
                    best_pred = Some(dep);
                }
            }
            distance.insert(id, best + self.weight(&id));
            if let Some(pred) = best_pred {
                predecessor.insert(id, pred);
            }
        }

        // End of the critical path: max distance, lowest id on ties.
        let mut end: Option<(TaskId, f64)> = None;
        for node in self.graph.node_indices() {
            let id = self.graph[node];
            let d = distance.get(&id).copied().unwrap_or(0.0);
            let replace = match end {
                None => true,
                Some((best_id, best_d)) => d > best_d || (d == best_d && id < best_id),
            };
            if replace {
                end = Some((id, d));
            }
        }

        let Some((end_id, total)) = end else {
            return (Vec::new(), 0.0);
        };

        let mut path = vec![end_id];
        let mut current = end_id;
        while let Some(&pred) = predecessor.get(&current) {
            path.push(pred);
            current = pred;
        }
        path.reverse();
        (path, total)
    }

    /// Nodes with no dependencies.
    pub fn find_roots(&self) -> BTreeSet<TaskId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n])
            .collect()
    }

    /// Nodes with no dependents.
    pub fn find_leaves(&self) -> BTreeSet<TaskId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n])
            .collect()
    }

    /// Composite bottleneck score per node.
    ///
    /// Direct dependents weigh heaviest, then the size of the downstream
    /// closure, the node's own weight, and a bonus for critical-path
    /// membership.
    pub fn blocking_scores(&self) -> HashMap<TaskId, f64> {
        let (critical, _) = self.critical_path();
        let critical: BTreeSet<TaskId> = critical.into_iter().collect();

        let mut scores = HashMap::new();
        for node in self.graph.node_indices() {
            let id = self.graph[node];
            let direct = self.dependents_of(&id).len() as f64;
            let downstream = self.transitive_dependents(&id).len() as f64;
            let on_critical = if critical.contains(&id) { 2.0 } else { 1.0 };
            let score = direct * 2.0 + downstream * 1.5 + self.weight(&id) + on_critical * 3.0;
            scores.insert(id, score);
        }
        scores
    }

    /// Export the graph in DOT format for visualization.
    pub fn to_dot(&self) -> String {
        let mut lines = vec![
            "digraph dependencies {".to_string(),
            "  rankdir=TB;".to_string(),
            "  node [shape=box];".to_string(),
        ];

        let mut ids: Vec<TaskId> = self.index.keys().copied().collect();
        ids.sort();
        for id in &ids {
            lines.push(format!(
                "  \"{}\" [label=\"{}\\n({})\"];",
                id,
                id.short(),
                self.weight(id)
            ));
        }
        for id in &ids {
            for dep in self.dependencies_of(id) {
                lines.push(format!("  \"{}\" -> \"{}\";", id, dep));
            }
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
