//! In-process stand-ins for the context builder and the task executor.
//!
//! The simulator subscribes to a [`MemoryBus`] and answers context requests
//! and execution triggers by feeding replies back into the [`Dispatcher`],
//! following a [`Script`]. It also watches phase updates to record how many
//! tasks were active at once and when each task was dispatched and finished.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::task::TaskId;
use crate::orchestration::Dispatcher;
use crate::protocol::{
    CompletionSignal, ContextBuildRequest, ContextBuildResult, DispatchTrigger, Inbound, Outbound,
    TaskPhaseUpdate,
};
use crate::transport::{Envelope, MemoryBus};

/// How the simulated collaborators behave.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Context builds that fail before one succeeds, per task.
    pub context_failures: HashMap<TaskId, u32>,
    /// Tasks whose context requests are never answered.
    pub silent_context: HashSet<TaskId>,
    /// Tasks whose execution reports failure, with the error text.
    pub execution_failures: HashMap<TaskId, String>,
    /// Tasks that are dispatched but never report back.
    pub silent_execution: HashSet<TaskId>,
    /// Report every completion twice.
    pub duplicate_completions: bool,
    pub context_delay: Duration,
    pub execution_delay: Duration,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_context(mut self, task: &str, times: u32) -> Self {
        self.context_failures.insert(TaskId::from(task), times);
        self
    }

    pub fn drop_context(mut self, task: &str) -> Self {
        self.silent_context.insert(TaskId::from(task));
        self
    }

    pub fn fail_execution(mut self, task: &str, error: &str) -> Self {
        self.execution_failures
            .insert(TaskId::from(task), error.to_string());
        self
    }

    pub fn hang_execution(mut self, task: &str) -> Self {
        self.silent_execution.insert(TaskId::from(task));
        self
    }

    pub fn with_duplicate_completions(mut self) -> Self {
        self.duplicate_completions = true;
        self
    }

    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn with_context_delay(mut self, delay: Duration) -> Self {
        self.context_delay = delay;
        self
    }
}

/// What the simulator saw on the bus.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    active: HashSet<TaskId>,
    /// Most tasks in ContextBuilding or Dispatched at the same time.
    pub max_active: usize,
    /// Tasks in the order their execution triggers were seen.
    pub dispatch_order: Vec<TaskId>,
    /// Bus position of each task's execution trigger.
    pub dispatched_at: HashMap<TaskId, usize>,
    /// Bus position of each task's completed phase update.
    pub completed_at: HashMap<TaskId, usize>,
    /// Bus position of each task's failed phase update.
    pub failed_at: HashMap<TaskId, usize>,
    /// Tasks announced as skipped, in order.
    pub skipped: Vec<TaskId>,
    /// Context requests seen per task.
    pub context_requests: HashMap<TaskId, u32>,
    seen: usize,
}

impl Observations {
    fn record(&mut self, message: &Outbound) {
        self.seen += 1;
        match message {
            Outbound::ContextRequest(request) => {
                *self.context_requests.entry(request.task_id.clone()).or_default() += 1;
            }
            Outbound::ExecutionTrigger(trigger) => {
                self.dispatch_order.push(trigger.task_id.clone());
                self.dispatched_at.insert(trigger.task_id.clone(), self.seen);
            }
            Outbound::PhaseUpdate(update) => self.record_phase(update),
            Outbound::AggregateResult(_) => {}
        }
    }

    fn record_phase(&mut self, update: &TaskPhaseUpdate) {
        match update.phase.as_str() {
            "context_building" => {
                self.active.insert(update.task_id.clone());
                self.max_active = self.max_active.max(self.active.len());
            }
            "completed" => {
                self.active.remove(&update.task_id);
                self.completed_at.insert(update.task_id.clone(), self.seen);
            }
            "failed" => {
                self.active.remove(&update.task_id);
                self.failed_at.insert(update.task_id.clone(), self.seen);
            }
            "skipped" => self.skipped.push(update.task_id.clone()),
            _ => {}
        }
    }
}

/// Simulated context builder and executor wired to one dispatcher.
#[derive(Clone)]
pub struct Simulator {
    dispatcher: Arc<Dispatcher>,
    script: Arc<Script>,
    observations: Arc<Mutex<Observations>>,
}

impl Simulator {
    pub fn new(dispatcher: Arc<Dispatcher>, script: Script) -> Self {
        Self {
            dispatcher,
            script: Arc::new(script),
            observations: Arc::new(Mutex::new(Observations::default())),
        }
    }

    pub fn observations(&self) -> Observations {
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start reacting to messages published on `bus` from now on.
    ///
    /// Stops when the dispatcher shuts down.
    pub fn spawn(&self, bus: &MemoryBus) -> JoinHandle<()> {
        let mut envelopes = bus.subscribe();
        let shutdown = self.dispatcher.shutdown_token();
        let sim = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    envelope = envelopes.recv() => match envelope {
                        Ok(envelope) => sim.observe(envelope),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "simulator fell behind the bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn observe(&self, envelope: Envelope) {
        let attempt = {
            let mut observations = self.observations.lock().unwrap_or_else(|e| e.into_inner());
            observations.record(&envelope.message);
            match &envelope.message {
                Outbound::ContextRequest(request) => observations
                    .context_requests
                    .get(&request.task_id)
                    .copied()
                    .unwrap_or(0),
                _ => 0,
            }
        };

        match envelope.message {
            Outbound::ContextRequest(request) => self.answer_context(request, attempt),
            Outbound::ExecutionTrigger(trigger) => self.execute(trigger),
            Outbound::AggregateResult(_) | Outbound::PhaseUpdate(_) => {}
        }
    }

    fn answer_context(&self, request: ContextBuildRequest, attempt: u32) {
        if self.script.silent_context.contains(&request.task_id) {
            debug!(task_id = %request.task_id, "simulator dropping context request");
            return;
        }
        let failures = self
            .script
            .context_failures
            .get(&request.task_id)
            .copied()
            .unwrap_or(0);
        let result = if attempt <= failures {
            ContextBuildResult::failed(
                &request.request_id,
                request.batch_id,
                request.task_id,
                "simulated context failure",
            )
        } else {
            let reference = format!("ctx/{}/{}", request.batch_id, request.task_id);
            ContextBuildResult::ready(
                &request.request_id,
                request.batch_id,
                request.task_id,
                &reference,
            )
        };
        self.reply(self.script.context_delay, vec![Inbound::ContextResult(result)]);
    }

    fn execute(&self, trigger: DispatchTrigger) {
        if self.script.silent_execution.contains(&trigger.task_id) {
            debug!(task_id = %trigger.task_id, "simulator leaving task running");
            return;
        }
        let signal = match self.script.execution_failures.get(&trigger.task_id) {
            Some(error) => CompletionSignal::failure(trigger.batch_id, trigger.task_id, error),
            None => CompletionSignal::success(trigger.batch_id, trigger.task_id),
        };
        let mut replies = vec![Inbound::Completion(signal.clone())];
        if self.script.duplicate_completions {
            replies.push(Inbound::Completion(signal));
        }
        self.reply(self.script.execution_delay, replies);
    }

    fn reply(&self, delay: Duration, messages: Vec<Inbound>) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for message in messages {
                let kind = message.kind();
                if let Err(e) = dispatcher.handle(message).await {
                    warn!(kind, error = %e, "simulated reply rejected");
                }
            }
        });
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("script", &self.script)
            .finish()
    }
}
