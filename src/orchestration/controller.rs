//! Batch controller: owns one batch's task graph and serializes every
//! transition of its tasks and of the batch itself.
//!
//! The controller never blocks on a collaborator. Each entry point applies
//! one event, publishes whatever messages follow from it, re-runs readiness
//! and admission, and records any timers the caller must arm. Timers come
//! back in through [`BatchController::on_timer`].

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::dag::TaskGraph;
use crate::core::gate::ConcurrencyGate;
use crate::core::lifecycle::{BatchLifecycle, BatchState};
use crate::core::settings::{BatchSettings, FailurePolicy};
use crate::core::task::{BatchId, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::context::{AttemptOutcome, ContextCoordinator};
use crate::orchestration::listener;
use crate::orchestration::outlet::Outlet;
use crate::orchestration::publisher::{DispatchOutcome, DispatchPublisher};
use crate::protocol::{
    AggregateResult, BatchOutcome, CompletionSignal, CompletionStatus, ContextBuildResult,
    Outbound, TaskPhaseUpdate,
};
use crate::state::BatchRecord;

/// Identity of a batch, copied from its trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMeta {
    pub batch_id: BatchId,
    pub plan_slug: String,
    pub request_id: String,
}

impl BatchMeta {
    pub fn new(batch_id: BatchId, plan_slug: &str, request_id: &str) -> Self {
        Self {
            batch_id,
            plan_slug: plan_slug.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Deferred work the controller asks its owner to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// No reply arrived for this context request in time.
    ContextTimeout { task_id: TaskId, request_id: String },
    /// Backoff elapsed; request context for the task again.
    ContextRetry { task_id: TaskId },
    /// The batch ran out of time.
    ExecutionDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub delay: Duration,
    pub event: TimerEvent,
}

/// Whether an inbound event changed the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Applied,
    Discarded,
}

pub struct BatchController {
    meta: BatchMeta,
    settings: BatchSettings,
    graph: TaskGraph,
    gate: ConcurrencyGate,
    lifecycle: BatchLifecycle,
    context: ContextCoordinator,
    dispatcher: DispatchPublisher,
    outlet: Outlet,
    aggregate: Option<AggregateResult>,
    published: bool,
    started_at: Option<DateTime<Utc>>,
    timers: Vec<Timer>,
}

impl BatchController {
    /// Build and validate a batch. Nothing is published until [`start`].
    ///
    /// # Errors
    /// Graph errors (`Cycle`, `UnknownDependency`, `DuplicateTask`) and a zero
    /// concurrency ceiling are rejected here, before any dispatch.
    ///
    /// [`start`]: BatchController::start
    pub fn new(
        meta: BatchMeta,
        tasks: Vec<Task>,
        settings: BatchSettings,
        outlet: Outlet,
    ) -> Result<Self> {
        if settings.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        let graph = TaskGraph::from_tasks(tasks)?;
        Ok(Self::assemble(meta, settings, graph, BatchLifecycle::new(), outlet))
    }

    /// Rebuild a controller from its ledger record after a restart.
    ///
    /// Tasks caught in ContextBuilding go back to Pending: their requests died
    /// with the old process. Dispatched tasks keep waiting for completion.
    pub fn restore(record: BatchRecord, outlet: Outlet) -> Result<Self> {
        let meta = BatchMeta::new(record.batch_id, &record.plan_slug, &record.request_id);
        let mut graph = TaskGraph::from_tasks(record.tasks)?;

        let building: Vec<TaskId> = graph
            .tasks()
            .filter(|task| task.status == TaskStatus::ContextBuilding)
            .map(|task| task.id.clone())
            .collect();
        for id in &building {
            graph.task_mut(id)?.reset_context_build();
        }
        if !building.is_empty() {
            info!(
                batch_id = %meta.batch_id,
                reset = building.len(),
                "context builds reset after restart"
            );
        }

        let mut controller = Self::assemble(meta, record.settings, graph, record.lifecycle, outlet);
        controller.aggregate = record.aggregate;
        controller.published = record.published;
        controller.started_at = record.started_at;
        Ok(controller)
    }

    fn assemble(
        meta: BatchMeta,
        settings: BatchSettings,
        graph: TaskGraph,
        lifecycle: BatchLifecycle,
        outlet: Outlet,
    ) -> Self {
        Self {
            gate: ConcurrencyGate::new(settings.max_concurrent),
            context: ContextCoordinator::new(settings.context_max_attempts),
            dispatcher: DispatchPublisher::new(outlet.clone()),
            meta,
            settings,
            graph,
            lifecycle,
            outlet,
            aggregate: None,
            published: false,
            started_at: None,
            timers: Vec::new(),
        }
    }

    // ========== Accessors ==========

    pub fn meta(&self) -> &BatchMeta {
        &self.meta
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.meta.batch_id
    }

    pub fn state(&self) -> BatchState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &BatchLifecycle {
        &self.lifecycle
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn aggregate(&self) -> Option<&AggregateResult> {
        self.aggregate.as_ref()
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Timers requested since the last call.
    pub fn take_timers(&mut self) -> Vec<Timer> {
        std::mem::take(&mut self.timers)
    }

    /// Snapshot for the ledger.
    pub fn record(&self) -> BatchRecord {
        BatchRecord {
            batch_id: self.meta.batch_id.clone(),
            plan_slug: self.meta.plan_slug.clone(),
            request_id: self.meta.request_id.clone(),
            settings: self.settings.clone(),
            lifecycle: self.lifecycle.clone(),
            tasks: self.graph.snapshot(),
            aggregate: self.aggregate.clone(),
            published: self.published,
            started_at: self.started_at,
            updated_at: Utc::now(),
        }
    }

    // ========== Lifecycle ==========

    /// Move to Dispatching and admit the first wave of ready tasks.
    pub async fn start(&mut self) -> Result<()> {
        self.lifecycle.transition(BatchState::Dispatching)?;
        self.started_at = Some(Utc::now());
        info!(
            batch_id = %self.meta.batch_id,
            plan_slug = %self.meta.plan_slug,
            tasks = self.graph.len(),
            max_concurrent = self.settings.max_concurrent,
            policy = %self.settings.failure_policy,
            "batch started"
        );
        self.timers.push(Timer {
            delay: self.settings.execution_timeout(),
            event: TimerEvent::ExecutionDeadline,
        });
        self.advance().await
    }

    /// Continue a restored batch from whatever state it was saved in.
    pub async fn resume(&mut self) -> Result<()> {
        match self.state() {
            BatchState::Created => self.start().await,
            BatchState::Dispatching => {
                let elapsed = self
                    .started_at
                    .and_then(|at| (Utc::now() - at).to_std().ok())
                    .unwrap_or_default();
                self.timers.push(Timer {
                    delay: self.settings.execution_timeout().saturating_sub(elapsed),
                    event: TimerEvent::ExecutionDeadline,
                });
                info!(
                    batch_id = %self.meta.batch_id,
                    active = self.graph.active_count(),
                    "batch resumed"
                );
                self.advance().await
            }
            BatchState::Draining => {
                if self.aggregate.is_none() {
                    self.aggregate = Some(self.compute_aggregate());
                }
                Ok(())
            }
            BatchState::Completed => Ok(()),
        }
    }

    /// Publish the aggregate result and complete the batch.
    ///
    /// Only valid while Draining. Calling it again once Completed publishes
    /// nothing. On a publish error the batch stays Draining so the caller
    /// can retry.
    pub async fn publish_aggregate(&mut self) -> Result<()> {
        match self.state() {
            BatchState::Draining => {}
            BatchState::Completed => return Ok(()),
            other => {
                return Err(Error::InvalidStateTransition {
                    from: other.to_string(),
                    to: BatchState::Completed.to_string(),
                })
            }
        }

        let aggregate = match &self.aggregate {
            Some(aggregate) => aggregate.clone(),
            None => {
                let aggregate = self.compute_aggregate();
                self.aggregate = Some(aggregate.clone());
                aggregate
            }
        };
        self.outlet
            .send(&Outbound::AggregateResult(aggregate.clone()))
            .await?;

        self.published = true;
        self.lifecycle.transition(BatchState::Completed)?;
        self.outlet.stats().batch_processed();
        info!(
            batch_id = %self.meta.batch_id,
            status = %aggregate.status,
            dispatched = aggregate.dispatched_count,
            failed = aggregate.failed_count,
            "batch result published"
        );
        Ok(())
    }

    fn compute_aggregate(&self) -> AggregateResult {
        let failed = self.graph.failed_count();
        AggregateResult {
            batch_id: self.meta.batch_id.clone(),
            plan_slug: self.meta.plan_slug.clone(),
            request_id: self.meta.request_id.clone(),
            task_count: self.graph.len(),
            dispatched_count: self.graph.dispatched_count(),
            failed_count: failed,
            status: BatchOutcome::from_counts(self.graph.completed_count(), failed),
            error: None,
        }
    }

    fn check_drain(&mut self) -> Result<()> {
        if self.state() == BatchState::Dispatching && self.graph.all_terminal() {
            self.lifecycle.transition(BatchState::Draining)?;
            let aggregate = self.compute_aggregate();
            info!(batch_id = %self.meta.batch_id, status = %aggregate.status, "batch drained");
            self.aggregate = Some(aggregate);
        }
        Ok(())
    }

    /// Admit ready tasks, then drain if nothing is left to do.
    async fn advance(&mut self) -> Result<()> {
        self.pump().await?;
        self.check_drain()
    }

    async fn pump(&mut self) -> Result<()> {
        while self.state() == BatchState::Dispatching {
            let (ready, unapproved): (Vec<TaskId>, Vec<TaskId>) = self
                .graph
                .ready()
                .into_iter()
                .partition(|id| self.graph.get(id).is_some_and(|task| task.approved));

            // Skipping takes no slot
            for task_id in &unapproved {
                self.skip_task(task_id).await?;
            }

            let active = self.graph.active_count();
            if !ready.is_empty() && !self.gate.has_capacity(active) {
                debug!(
                    batch_id = %self.meta.batch_id,
                    waiting = ready.len(),
                    active,
                    "concurrency ceiling reached"
                );
            }
            let admitted = self.gate.admit(&ready, active);
            if admitted.is_empty() && unapproved.is_empty() {
                break;
            }
            // Every pass moves at least one task out of Pending, so this terminates
            for task_id in admitted {
                self.request_context(&task_id).await?;
            }
        }
        Ok(())
    }

    async fn skip_task(&mut self, task_id: &TaskId) -> Result<()> {
        info!(batch_id = %self.meta.batch_id, %task_id, "skipping unapproved task");
        self.graph.task_mut(task_id)?.skip("task not approved");
        self.announce(task_id).await;
        Ok(())
    }

    // ========== Context builds ==========

    async fn request_context(&mut self, task_id: &TaskId) -> Result<()> {
        let task = self.graph.task(task_id)?;
        let request = self
            .context
            .begin(&self.meta.batch_id, &self.meta.plan_slug, task);
        let attempt = self.context.attempts(task_id);
        self.graph.task_mut(task_id)?.begin_context_build();

        let request_id = request.request_id.clone();
        match self.outlet.send(&Outbound::ContextRequest(request)).await {
            Ok(()) => {
                debug!(
                    batch_id = %self.meta.batch_id,
                    %task_id,
                    %request_id,
                    attempt,
                    "context requested"
                );
                self.timers.push(Timer {
                    delay: self.settings.context_timeout(),
                    event: TimerEvent::ContextTimeout {
                        task_id: task_id.clone(),
                        request_id,
                    },
                });
                if attempt == 1 {
                    self.announce(task_id).await;
                }
                Ok(())
            }
            Err(e) => {
                let reason = format!("context request publish failed: {}", e);
                self.context_attempt_failed(task_id, &reason).await
            }
        }
    }

    async fn context_attempt_failed(&mut self, task_id: &TaskId, reason: &str) -> Result<()> {
        match self.context.fail_attempt(task_id) {
            AttemptOutcome::Retry { attempt } => {
                let delay = self.settings.context_backoff(attempt);
                warn!(
                    batch_id = %self.meta.batch_id,
                    %task_id,
                    attempt,
                    max_attempts = self.settings.context_max_attempts,
                    ?delay,
                    reason,
                    "context build attempt failed, retrying"
                );
                self.timers.push(Timer {
                    delay,
                    event: TimerEvent::ContextRetry {
                        task_id: task_id.clone(),
                    },
                });
                Ok(())
            }
            AttemptOutcome::Exhausted { attempts } => {
                let reason =
                    format!("context build failed after {} attempts: {}", attempts, reason);
                self.fail_task(task_id, &reason).await
            }
        }
    }

    /// Apply a reply from the context builder.
    pub async fn on_context_result(&mut self, result: ContextBuildResult) -> Result<Handled> {
        if self.state() != BatchState::Dispatching {
            return Ok(self.discard("context_result", &result.task_id, "batch is not dispatching"));
        }
        if result.batch_id != self.meta.batch_id {
            return Ok(self.discard("context_result", &result.task_id, "result for another batch"));
        }
        if !self.context.is_current(&result.task_id, &result.request_id) {
            return Ok(self.discard("context_result", &result.task_id, "stale or unknown request"));
        }

        let task_id = result.task_id.clone();
        match result.outcome() {
            Ok(reference) => {
                let reference = reference.to_string();
                self.context.finish(&task_id);
                self.outlet.stats().context_built();
                let dispatched = self
                    .dispatcher
                    .dispatch(
                        &mut self.graph,
                        &self.meta.batch_id,
                        &self.meta.plan_slug,
                        &task_id,
                        &reference,
                    )
                    .await;
                match dispatched {
                    Ok(DispatchOutcome::Published) => self.announce(&task_id).await,
                    Ok(DispatchOutcome::Skipped) => {}
                    Err(e) => {
                        warn!(
                            batch_id = %self.meta.batch_id,
                            %task_id,
                            error = %e,
                            "dispatch publish failed"
                        );
                        self.fail_task(&task_id, "dispatch publish failed").await?;
                    }
                }
            }
            Err(error) => {
                let error = error.to_string();
                self.context_attempt_failed(&task_id, &error).await?;
            }
        }

        self.advance().await?;
        Ok(Handled::Applied)
    }

    // ========== Completions ==========

    /// Apply a completion or failure signal from the executor.
    pub async fn on_completion(&mut self, signal: CompletionSignal) -> Result<Handled> {
        if self.state() != BatchState::Dispatching {
            return Ok(self.discard("completion", &signal.task_id, "batch is not dispatching"));
        }
        if let Err(reason) = listener::screen(&self.meta.batch_id, &self.graph, &signal) {
            return Ok(self.discard("completion", &signal.task_id, &reason.to_string()));
        }

        match signal.status {
            CompletionStatus::Success => {
                self.graph.task_mut(&signal.task_id)?.complete();
                info!(batch_id = %self.meta.batch_id, task_id = %signal.task_id, "task completed");
                self.announce(&signal.task_id).await;
            }
            CompletionStatus::Failure => {
                self.outlet.stats().execution_failed();
                let reason = signal
                    .error
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or("execution failed")
                    .to_string();
                self.fail_task(&signal.task_id, &reason).await?;
            }
        }

        self.advance().await?;
        Ok(Handled::Applied)
    }

    // ========== Failure and cancellation ==========

    /// Fail one task, then apply the batch's failure policy.
    async fn fail_task(&mut self, task_id: &TaskId, reason: &str) -> Result<()> {
        warn!(batch_id = %self.meta.batch_id, %task_id, reason, "task failed");
        self.mark_failed(task_id, reason).await?;

        let victims: Vec<(TaskId, String)> = match self.settings.failure_policy {
            FailurePolicy::FailFast => self
                .graph
                .dependents_transitive(task_id)
                .into_iter()
                .filter(|id| self.graph.get(id).is_some_and(|task| !task.is_terminal()))
                .map(|id| (id, format!("dependency {} failed", task_id)))
                .collect(),
            FailurePolicy::AbortAll => self
                .graph
                .tasks()
                .filter(|task| !task.is_terminal())
                .map(|task| (task.id.clone(), format!("batch aborted: task {} failed", task_id)))
                .collect(),
        };

        if !victims.is_empty() {
            info!(
                batch_id = %self.meta.batch_id,
                %task_id,
                skipped = victims.len(),
                policy = %self.settings.failure_policy,
                "failure propagated"
            );
        }
        for (id, reason) in victims {
            self.mark_failed(&id, &reason).await?;
        }
        Ok(())
    }

    async fn mark_failed(&mut self, task_id: &TaskId, reason: &str) -> Result<()> {
        self.graph.task_mut(task_id)?.fail(reason);
        self.context.finish(task_id);
        self.announce(task_id).await;
        Ok(())
    }

    async fn abort_remaining(&mut self, reason: &str) -> Result<()> {
        let remaining: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|task| !task.is_terminal())
            .map(|task| task.id.clone())
            .collect();
        for id in &remaining {
            self.mark_failed(id, reason).await?;
        }
        self.context.clear();
        Ok(())
    }

    /// Stop the batch: every non-terminal task fails and the batch drains.
    ///
    /// A batch that is no longer dispatching is left untouched.
    pub async fn cancel(&mut self, reason: Option<&str>) -> Result<Handled> {
        if self.state() != BatchState::Dispatching {
            debug!(batch_id = %self.meta.batch_id, state = %self.state(), "cancel ignored");
            return Ok(Handled::Discarded);
        }
        let reason = match reason.map(str::trim) {
            Some(reason) if !reason.is_empty() => format!("batch cancelled: {}", reason),
            _ => "batch cancelled".to_string(),
        };
        info!(batch_id = %self.meta.batch_id, %reason, "batch cancelled");
        self.abort_remaining(&reason).await?;
        self.check_drain()?;
        Ok(Handled::Applied)
    }

    // ========== Timers ==========

    /// Apply a timer that fired.
    pub async fn on_timer(&mut self, event: TimerEvent) -> Result<Handled> {
        if self.state() != BatchState::Dispatching {
            return Ok(Handled::Discarded);
        }
        match event {
            TimerEvent::ContextTimeout { task_id, request_id } => {
                if !self.context.is_current(&task_id, &request_id) {
                    return Ok(Handled::Discarded);
                }
                self.context_attempt_failed(&task_id, "context build timed out")
                    .await?;
            }
            TimerEvent::ContextRetry { task_id } => {
                let building = self
                    .graph
                    .get(&task_id)
                    .is_some_and(|task| task.status == TaskStatus::ContextBuilding);
                if !building || !self.context.is_backing_off(&task_id) {
                    return Ok(Handled::Discarded);
                }
                self.request_context(&task_id).await?;
            }
            TimerEvent::ExecutionDeadline => {
                warn!(
                    batch_id = %self.meta.batch_id,
                    active = self.graph.active_count(),
                    "execution deadline reached"
                );
                self.abort_remaining("execution timeout").await?;
            }
        }
        self.advance().await?;
        Ok(Handled::Applied)
    }

    // ========== Helpers ==========

    fn discard(&self, kind: &str, task_id: &TaskId, reason: &str) -> Handled {
        self.outlet.stats().duplicate_discarded();
        info!(batch_id = %self.meta.batch_id, %task_id, kind, reason, "message discarded");
        Handled::Discarded
    }

    /// Best-effort phase update; failures are only logged.
    async fn announce(&self, task_id: &TaskId) {
        let Some(task) = self.graph.get(task_id) else {
            return;
        };
        let update = TaskPhaseUpdate::for_task(&self.meta.batch_id, task);
        if let Err(e) = self.outlet.send(&Outbound::PhaseUpdate(update)).await {
            debug!(batch_id = %self.meta.batch_id, %task_id, error = %e, "phase update dropped");
        }
    }
}

impl std::fmt::Debug for BatchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchController")
            .field("batch_id", &self.meta.batch_id)
            .field("state", &self.state())
            .field("graph", &self.graph)
            .field("published", &self.published)
            .finish()
    }
}
