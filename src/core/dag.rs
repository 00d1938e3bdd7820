//! Dependency graph for registered tasks.
//!
//! This module provides the DependencyGraph structure: an arena of task ids
//! (petgraph nodes) with index-based edges running from a dependency to the
//! task that waits on it. Tasks never hold references to each other.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// The task dependency graph.
///
/// A declared dependency whose id is not registered yet is kept as a
/// *dangling* edge and wired in when that id is added. Cycles are rejected
/// before any mutation, so the graph is always acyclic.
pub struct DependencyGraph {
    /// Edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Unregistered dependency id -> tasks declaring it.
    dangling: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            dangling: HashMap::new(),
        }
    }

    /// Add a task together with its declared dependencies.
    ///
    /// # Errors
    /// - [`Error::DuplicateTask`] if `id` is already present
    /// - [`Error::DependencyCycle`] if `id` depends on itself, or if wiring in
    ///   tasks that were waiting on `id` would close a cycle
    ///
    /// On error the graph is left unchanged.
    pub fn add_task(&mut self, id: TaskId, dependencies: &BTreeSet<TaskId>) -> Result<NodeIndex> {
        if self.task_index.contains_key(&id) {
            return Err(Error::DuplicateTask(id));
        }
        if dependencies.contains(&id) {
            return Err(Error::DependencyCycle { task_id: id });
        }

        let waiting: Vec<TaskId> = self.dangling.get(&id).cloned().unwrap_or_default();

        // New edges: deps -> id -> waiting. A cycle exists iff some waiting
        // task already reaches one of our dependencies.
        for waiter in &waiting {
            if dependencies.contains(waiter) {
                return Err(Error::DependencyCycle { task_id: id });
            }
            let Some(&waiter_index) = self.task_index.get(waiter) else {
                continue;
            };
            for dep in dependencies {
                if let Some(&dep_index) = self.task_index.get(dep) {
                    if has_path_connecting(&self.graph, waiter_index, dep_index, None) {
                        return Err(Error::DependencyCycle { task_id: id });
                    }
                }
            }
        }

        let index = self.graph.add_node(id);
        self.task_index.insert(id, index);

        for dep in dependencies {
            match self.task_index.get(dep) {
                Some(&dep_index) => {
                    self.graph.add_edge(dep_index, index, ());
                }
                None => self.dangling.entry(*dep).or_default().push(id),
            }
        }

        if let Some(waiters) = self.dangling.remove(&id) {
            for waiter in waiters {
                if let Some(&waiter_index) = self.task_index.get(&waiter) {
                    self.graph.add_edge(index, waiter_index, ());
                }
            }
        }

        Ok(index)
    }

    /// Get the NodeIndex for a task by its ID.
    pub fn node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of resolved edges. Dangling dependencies are not counted.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from_idx), Some(&to_idx)) => self.graph.find_edge(from_idx, to_idx).is_some(),
            _ => false,
        }
    }

    /// Registered tasks that `id` depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Registered tasks that depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n).copied())
            .collect();
        ids.sort();
        ids
    }

    /// Ids referenced as dependencies but never registered.
    pub fn dangling_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.dangling.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Tasks ordered so every task comes after its registered dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::DependencyCycle {
            task_id: self.graph[cycle.node_id()],
        })?;
        Ok(sorted.into_iter().map(|index| self.graph[index]).collect())
    }

    /// Get the underlying graph for advanced operations.
    pub fn graph(&self) -> &DiGraph<TaskId, ()> {
        &self.graph
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
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}
