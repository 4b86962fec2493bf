//! Task storage: where a batch's task snapshot comes from.
//!
//! Plans live under `<plans_dir>/<slug>/` and carry their tasks in
//! `tasks.json`, an array of task entries written by the task generator.
//! A phased plan also has `phases.json`.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

use crate::core::phase::Phase;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// File name of a plan's task list.
pub const TASKS_FILE: &str = "tasks.json";

/// File name of a plan's phase list.
pub const PHASES_FILE: &str = "phases.json";

/// Task status value that clears a task for dispatch.
pub const APPROVED: &str = "approved";

/// Lowercase alphanumeric with inner hyphens, 1-50 chars.
static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,48}[a-z0-9])?$").unwrap());

/// Check that a plan slug is safe to use as a path component.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.contains("..") || slug.contains('/') || slug.contains('\\') {
        return Err(Error::InvalidSlug(slug.to_string()));
    }
    if !SLUG_RE.is_match(slug) {
        return Err(Error::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

/// One entry of a plan's `tasks.json`.
///
/// Fields the dispatcher does not use (acceptance criteria, timestamps) are
/// ignored. A task with a `status` other than `approved` is skipped at
/// dispatch time; a task with no `status` counts as approved.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanTask {
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl From<PlanTask> for Task {
    fn from(entry: PlanTask) -> Self {
        let mut task = Task::new(entry.id)
            .with_description(&entry.description)
            .with_files(entry.files);
        task.depends_on = entry.depends_on;
        task.phase_id = entry.phase_id.filter(|phase| !phase.is_empty());
        task.approved = entry.status.as_deref().map_or(true, |status| status == APPROVED);
        task
    }
}

/// Parse a `tasks.json` document into pending tasks, in file order.
pub fn parse_tasks(bytes: &[u8]) -> Result<Vec<Task>> {
    let entries: Vec<PlanTask> = serde_json::from_slice(bytes)?;
    Ok(entries.into_iter().map(Task::from).collect())
}

/// Parse a `phases.json` document.
pub fn parse_phases(bytes: &[u8]) -> Result<Vec<Phase>> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Loads the task snapshot for a plan.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Tasks of `plan_slug`, in plan order. An unknown plan yields no tasks.
    async fn load(&self, plan_slug: &str) -> Result<Vec<Task>>;

    /// Phases of `plan_slug`. An unphased plan yields none.
    async fn load_phases(&self, _plan_slug: &str) -> Result<Vec<Phase>> {
        Ok(Vec::new())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file not found");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads `<plans_dir>/<slug>/tasks.json`.
#[derive(Debug, Clone)]
pub struct FileTaskSource {
    plans_dir: PathBuf,
}

impl FileTaskSource {
    pub fn new(plans_dir: impl AsRef<Path>) -> Self {
        Self {
            plans_dir: plans_dir.as_ref().to_path_buf(),
        }
    }

    pub fn plans_dir(&self) -> &Path {
        &self.plans_dir
    }

    pub fn tasks_path(&self, plan_slug: &str) -> PathBuf {
        self.plans_dir.join(plan_slug).join(TASKS_FILE)
    }

    pub fn phases_path(&self, plan_slug: &str) -> PathBuf {
        self.plans_dir.join(plan_slug).join(PHASES_FILE)
    }
}

#[async_trait]
impl TaskSource for FileTaskSource {
    async fn load(&self, plan_slug: &str) -> Result<Vec<Task>> {
        validate_slug(plan_slug)?;

        let Some(bytes) = read_optional(&self.tasks_path(plan_slug)).await? else {
            return Ok(Vec::new());
        };
        let tasks = parse_tasks(&bytes)?;
        debug!(plan_slug, count = tasks.len(), "loaded tasks");
        Ok(tasks)
    }

    async fn load_phases(&self, plan_slug: &str) -> Result<Vec<Phase>> {
        validate_slug(plan_slug)?;
        let Some(bytes) = read_optional(&self.phases_path(plan_slug)).await? else {
            return Ok(Vec::new());
        };
        let phases = parse_phases(&bytes)?;
        debug!(plan_slug, count = phases.len(), "loaded phases");
        Ok(phases)
    }
}

/// Task lists held in memory, keyed by plan slug.
#[derive(Debug, Clone, Default)]
pub struct InlineTaskSource {
    plans: HashMap<String, Vec<Task>>,
    phases: HashMap<String, Vec<Phase>>,
}

impl InlineTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan_slug: &str, tasks: Vec<Task>) -> Self {
        self.plans.insert(plan_slug.to_string(), tasks);
        self
    }

    pub fn with_phases(mut self, plan_slug: &str, phases: Vec<Phase>) -> Self {
        self.phases.insert(plan_slug.to_string(), phases);
        self
    }
}

#[async_trait]
impl TaskSource for InlineTaskSource {
    async fn load(&self, plan_slug: &str) -> Result<Vec<Task>> {
        validate_slug(plan_slug)?;
        Ok(self.plans.get(plan_slug).cloned().unwrap_or_default())
    }

    async fn load_phases(&self, plan_slug: &str) -> Result<Vec<Phase>> {
        validate_slug(plan_slug)?;
        Ok(self.phases.get(plan_slug).cloned().unwrap_or_default())
    }
}
