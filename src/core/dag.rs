//! Task graph for dependency management.
//!
//! `TaskGraph` holds one batch's tasks as a directed acyclic graph. Edges run
//! from a dependency to its dependent, so a task is ready once every incoming
//! neighbour has completed. Phase edges (from a task's `after` list) only wait
//! for the earlier task to finish, whatever its outcome. The graph shape is
//! fixed at construction; only task statuses change afterwards.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    /// `depends_on`: the source must complete (or be skipped).
    Dependency,
    /// `after`: the source must be terminal.
    Phase,
}

/// The dependency graph of a single batch.
///
/// Nodes are inserted in input order, so node index order is also the
/// tie-break order used by the readiness engine.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, Edge>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a graph from a flat task list.
    ///
    /// Each task's `sequence` is set to its position in `tasks`; statuses are
    /// kept as given, which lets a recovered snapshot be rebuilt unchanged.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `UnknownDependency` if a `depends_on` or `after` entry names no task
    /// - `Cycle` if the ordering relation is cyclic (self-dependencies included)
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for (sequence, mut task) in tasks.into_iter().enumerate() {
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            task.sequence = sequence;
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        // Phase edges go in first so a direct dependency on the same pair wins
        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            let phase = task.after.iter().map(|dep| (dep, Edge::Phase));
            let direct = task.depends_on.iter().map(|dep| (dep, Edge::Dependency));
            for (dep, kind) in phase.chain(direct) {
                let dep_index = task_index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                edges.push((*dep_index, index, kind));
            }
        }
        for (from, to, kind) in edges {
            graph.update_edge(from, to, kind);
        }

        let dag = Self { graph, task_index };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(Error::Cycle {
                task: self.graph[cycle.node_id()].id.clone(),
                remaining: self.graph.node_count() - self.kahn_order().len(),
            }),
        }
    }

    /// Kahn's algorithm with the lowest sequence number taken first.
    ///
    /// Nodes on or behind a cycle are left out of the result.
    fn kahn_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                let degree = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count();
                (index, degree)
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(*index))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(index)) = heap.pop() {
            order.push(index);
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(Reverse(next));
                    }
                }
            }
        }
        order
    }

    /// Get a reference to a task by its ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Look up a task, failing with `TaskNotFound`.
    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.get(id).ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Mutable lookup, failing with `TaskNotFound`.
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => Ok(&mut self.graph[index]),
            None => Err(Error::TaskNotFound(id.clone())),
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get the number of dependency edges, phase ordering excluded.
    pub fn dependency_count(&self) -> usize {
        self.graph
            .edge_weights()
            .filter(|kind| **kind == Edge::Dependency)
            .count()
    }

    /// All tasks in sequence order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Tasks the given task depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<&Task> = self
            .dependency_neighbors(index, direction)
            .map(|neighbor| &self.graph[neighbor])
            .collect();
        found.sort_by_key(|task| task.sequence);
        found
    }

    fn dependency_neighbors(
        &self,
        index: NodeIndex,
        direction: Direction,
    ) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .edges_directed(index, direction)
            .filter(|edge| *edge.weight() == Edge::Dependency)
            .map(move |edge| match direction {
                Direction::Incoming => edge.source(),
                Direction::Outgoing => edge.target(),
            })
    }

    /// Every task reachable downstream of `id` through dependencies, in
    /// sequence order.
    pub fn dependents_transitive(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.dependency_neighbors(index, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut found: Vec<NodeIndex> = seen.into_iter().collect();
        found.sort();
        found
            .into_iter()
            .map(|index| self.graph[index].id.clone())
            .collect()
    }

    // ========== Readiness ==========

    /// Get every pending task whose dependencies have all completed (or
    /// were skipped) and whose earlier-phase tasks have all finished.
    ///
    /// The result is ordered by sequence number so dispatch order is
    /// reproducible for tasks with no ordering constraint between them.
    pub fn ready(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                let task = &self.graph[index];
                task.status == TaskStatus::Pending
                    && self
                        .graph
                        .edges_directed(index, Direction::Incoming)
                        .all(|edge| {
                            let source = &self.graph[edge.source()];
                            match edge.weight() {
                                Edge::Dependency => source.satisfies_dependents(),
                                Edge::Phase => source.is_terminal(),
                            }
                        })
            })
            .map(|index| self.graph[index].id.clone())
            .collect()
    }

    /// Number of tasks in ContextBuilding or Dispatched.
    pub fn active_count(&self) -> usize {
        self.tasks().filter(|task| task.is_active()).count()
    }

    /// Whether every task is Completed, Failed or Skipped.
    pub fn all_terminal(&self) -> bool {
        self.tasks().all(Task::is_terminal)
    }

    pub fn completed_count(&self) -> usize {
        self.tasks()
            .filter(|task| task.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks().filter(|task| task.is_failed()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.tasks().filter(|task| task.is_skipped()).count()
    }

    /// Tasks that reached Dispatched at least once.
    pub fn dispatched_count(&self) -> usize {
        self.tasks().filter(|task| task.was_dispatched()).count()
    }

    /// Tasks in a dependency-respecting order, lowest sequence first among peers.
    pub fn topological_order(&self) -> Vec<&Task> {
        self.kahn_order()
            .into_iter()
            .map(|index| &self.graph[index])
            .collect()
    }

    /// Clone every task in sequence order, e.g. for the recovery ledger.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks().cloned().collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
