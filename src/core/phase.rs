//! Plan phases: coarse ordering above the task graph.
//!
//! A phased plan groups its tasks into phases that form their own DAG. A
//! phase starts once every phase it depends on has finished, whether or not
//! its tasks succeeded. The dispatcher does not schedule phases separately;
//! [`apply_phases`] lowers the phase DAG onto each task's `after` list and
//! the task graph enforces it.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// One entry of a plan's `phases.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    #[serde(default)]
    pub sequence: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Phases that must finish before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Phase {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sequence: 0,
            name: id.to_string(),
            description: String::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Validated phase DAG.
struct PhaseGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> PhaseGraph<'a> {
    fn build(phases: &'a [Phase]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(phases.len(), phases.len());
        let mut index = HashMap::with_capacity(phases.len());
        for phase in phases {
            if index.contains_key(phase.id.as_str()) {
                return Err(Error::DuplicatePhase(phase.id.clone()));
            }
            index.insert(phase.id.as_str(), graph.add_node(phase.id.as_str()));
        }

        for phase in phases {
            let to = index[phase.id.as_str()];
            for dep in &phase.depends_on {
                let from = index
                    .get(dep.as_str())
                    .ok_or_else(|| Error::UnknownPhaseDependency {
                        phase: phase.id.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.update_edge(*from, to, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| Error::PhaseCycle(graph[cycle.node_id()].to_string()))?;
        Ok(Self { graph, index })
    }

    /// Every phase upstream of `id`.
    fn ancestors(&self, id: &str) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for prev in self.graph.neighbors_directed(node, Direction::Incoming) {
                if seen.insert(self.graph[prev]) {
                    queue.push_back(prev);
                }
            }
        }
        seen
    }
}

/// Order `tasks` by their phases.
///
/// Each phased task's `after` list is set to every task in an upstream phase,
/// so phases with no tasks of their own still chain their neighbours.
/// Tasks without a `phase_id` are left unconstrained. With no phases the
/// tasks are returned unchanged.
///
/// # Errors
/// - `DuplicatePhase`, `UnknownPhaseDependency` or `PhaseCycle` for a bad phase DAG
/// - `UnknownPhase` if a task names a phase that is not in `phases`
pub fn apply_phases(mut tasks: Vec<Task>, phases: &[Phase]) -> Result<Vec<Task>> {
    if phases.is_empty() {
        return Ok(tasks);
    }
    let graph = PhaseGraph::build(phases)?;

    for task in &tasks {
        if let Some(phase) = &task.phase_id {
            if !graph.index.contains_key(phase.as_str()) {
                return Err(Error::UnknownPhase {
                    task: task.id.clone(),
                    phase: phase.clone(),
                });
            }
        }
    }

    let placed: Vec<(TaskId, Option<String>)> = tasks
        .iter()
        .map(|task| (task.id.clone(), task.phase_id.clone()))
        .collect();
    let mut ancestors: HashMap<String, HashSet<&str>> = HashMap::new();
    for task in &mut tasks {
        let Some(phase) = task.phase_id.clone() else {
            continue;
        };
        let upstream = ancestors
            .entry(phase)
            .or_insert_with_key(|phase| graph.ancestors(phase));
        task.after = placed
            .iter()
            .filter(|(_, p)| p.as_deref().is_some_and(|p| upstream.contains(p)))
            .map(|(id, _)| id.clone())
            .collect();
    }

    debug!(phases = phases.len(), tasks = tasks.len(), "phases applied");
    Ok(tasks)
}
