//! Dispatcher: entry point for every inbound message.
//!
//! Triggers create a batch actor; every other message is routed to the actor
//! owning its `batch_id`. Batches never share state, so the only lock here
//! guards the routing table. It is never held across ledger or task-source
//! I/O, and handles of finished actors are pruned as new batches arrive.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::phase::apply_phases;
use crate::core::settings::BatchSettings;
use crate::core::task::BatchId;
use crate::error::{Error, Result};
use crate::orchestration::actor::{wait_result, BatchActor, BatchEvent, BatchHandle, Launch};
use crate::orchestration::controller::{BatchController, BatchMeta};
use crate::orchestration::outlet::Outlet;
use crate::orchestration::stats::DispatcherStats;
use crate::protocol::{AggregateResult, BatchTrigger, Inbound, Outbound};
use crate::state::{validate_slug, BatchLedger, BatchRecord, TaskSource};

pub struct Dispatcher {
    outlet: Outlet,
    tasks: Arc<dyn TaskSource>,
    ledger: Arc<dyn BatchLedger>,
    settings: BatchSettings,
    batches: Mutex<HashMap<BatchId, BatchHandle>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        outlet: Outlet,
        tasks: Arc<dyn TaskSource>,
        ledger: Arc<dyn BatchLedger>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            outlet,
            tasks,
            ledger,
            settings,
            batches: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> &Arc<DispatcherStats> {
        self.outlet.stats()
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Token cancelled by [`shutdown`](Dispatcher::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle one inbound message.
    ///
    /// # Errors
    /// A trigger that cannot start (bad graph, invalid slug, no tasks, task
    /// load failure) is answered with a rejected result and the error is
    /// returned. Messages for unknown or finished batches are discarded and
    /// return `Ok`.
    pub async fn handle(&self, message: Inbound) -> Result<()> {
        debug!(kind = message.kind(), batch_id = %message.batch_id(), "message received");
        match message {
            Inbound::BatchTrigger(trigger) => self.trigger(trigger).await,
            Inbound::ContextResult(result) => {
                let batch_id = result.batch_id.clone();
                self.route(&batch_id, BatchEvent::ContextResult(result)).await
            }
            Inbound::Completion(signal) => {
                let batch_id = signal.batch_id.clone();
                self.route(&batch_id, BatchEvent::Completion(signal)).await
            }
            Inbound::Cancel(cancel) => {
                let event = BatchEvent::Cancel(cancel.reason);
                self.route(&cancel.batch_id, event).await
            }
        }
    }

    async fn trigger(&self, trigger: BatchTrigger) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        if self.is_tracked(&trigger.batch_id).await {
            self.duplicate_trigger(&trigger.batch_id);
            return Ok(());
        }

        let (controller, launch) = match self.ledger.load(&trigger.batch_id).await? {
            Some(record) if record.is_finished() => {
                self.stats().duplicate_discarded();
                info!(
                    batch_id = %trigger.batch_id,
                    state = %record.state(),
                    "batch already finished, trigger ignored"
                );
                return Ok(());
            }
            Some(record) => (self.restore(record)?, Launch::Resume),
            None => match self.prepare(&trigger).await {
                Ok(controller) => {
                    info!(
                        batch_id = %trigger.batch_id,
                        plan_slug = %trigger.plan_slug,
                        request_id = %trigger.request_id,
                        tasks = controller.graph().len(),
                        "batch accepted"
                    );
                    (controller, Launch::Start)
                }
                Err(e) => return self.reject(&trigger, e).await,
            },
        };

        if !self.install(controller, launch).await? {
            self.duplicate_trigger(&trigger.batch_id);
        }
        Ok(())
    }

    fn duplicate_trigger(&self, batch_id: &BatchId) {
        self.stats().duplicate_discarded();
        info!(%batch_id, "duplicate trigger ignored");
    }

    async fn is_tracked(&self, batch_id: &BatchId) -> bool {
        let mut batches = self.batches.lock().await;
        prune(&mut batches);
        batches.contains_key(batch_id)
    }

    /// Spawn the batch's actor unless another trigger installed one while
    /// this one was loading. Returns whether an actor was spawned.
    async fn install(&self, controller: BatchController, launch: Launch) -> Result<bool> {
        let mut batches = self.batches.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        prune(&mut batches);
        match batches.entry(controller.batch_id().clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let actor = BatchActor::new(controller, self.ledger.clone(), &self.shutdown);
                slot.insert(actor.spawn(launch));
                Ok(true)
            }
        }
    }

    async fn prepare(&self, trigger: &BatchTrigger) -> Result<BatchController> {
        validate_slug(&trigger.plan_slug)?;
        let tasks = self.tasks.load(&trigger.plan_slug).await?;
        if tasks.is_empty() {
            return Err(Error::NoTasks(trigger.plan_slug.clone()));
        }
        let phases = self.tasks.load_phases(&trigger.plan_slug).await?;
        if !phases.is_empty() {
            debug!(batch_id = %trigger.batch_id, phases = phases.len(), "plan is phased");
        }
        let tasks = apply_phases(tasks, &phases)?;

        let meta = BatchMeta::new(
            trigger.batch_id.clone(),
            &trigger.plan_slug,
            &trigger.request_id,
        );
        BatchController::new(meta, tasks, self.settings.clone(), self.outlet.clone())
    }

    /// Publish and record a rejected result, then hand the error back.
    async fn reject(&self, trigger: &BatchTrigger, cause: Error) -> Result<()> {
        warn!(
            batch_id = %trigger.batch_id,
            plan_slug = %trigger.plan_slug,
            error = %cause,
            "batch rejected"
        );
        let result = AggregateResult::rejected(
            &trigger.batch_id,
            &trigger.plan_slug,
            &trigger.request_id,
            &cause.to_string(),
        );
        if let Err(e) = self.outlet.send(&Outbound::AggregateResult(result.clone())).await {
            // Left unrecorded so a re-delivered trigger can try again
            error!(batch_id = %trigger.batch_id, error = %e, "rejected result publish failed");
            return Err(cause);
        }
        let record = BatchRecord::rejected(result, self.settings.clone());
        if let Err(e) = self.ledger.save(&record).await {
            warn!(batch_id = %trigger.batch_id, error = %e, "ledger save failed");
        }
        Err(cause)
    }

    async fn route(&self, batch_id: &BatchId, event: BatchEvent) -> Result<()> {
        let batches = self.batches.lock().await;
        match batches.get(batch_id) {
            Some(handle) if !handle.is_finished() => {
                if handle.send(event).is_err() {
                    self.stats().duplicate_discarded();
                    debug!(%batch_id, "batch actor gone, message discarded");
                }
            }
            Some(_) => {
                self.stats().duplicate_discarded();
                debug!(%batch_id, "batch finished, message discarded");
            }
            None => {
                self.stats().duplicate_discarded();
                info!(%batch_id, "message for unknown batch discarded");
            }
        }
        Ok(())
    }

    fn restore(&self, record: BatchRecord) -> Result<BatchController> {
        info!(batch_id = %record.batch_id, state = %record.state(), "resuming batch");
        BatchController::restore(record, self.outlet.clone())
    }

    /// Resume every unfinished batch found in the ledger.
    ///
    /// Returns how many batches were resumed. A record that cannot be
    /// restored is logged and skipped.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.ledger.unfinished().await?;
        let mut resumed = 0;
        for record in records {
            if self.is_tracked(&record.batch_id).await {
                continue;
            }
            let batch_id = record.batch_id.clone();
            match self.restore(record) {
                Ok(controller) => {
                    if self.install(controller, Launch::Resume).await? {
                        resumed += 1;
                    }
                }
                Err(e) => warn!(%batch_id, error = %e, "batch could not be restored"),
            }
        }
        if resumed > 0 {
            info!(resumed, "recovery complete");
        }
        Ok(resumed)
    }

    /// Consume inbound messages until the channel closes or shutdown.
    ///
    /// Errors from individual messages are logged; the loop keeps going.
    pub async fn run(&self, mut inbound: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("dispatcher loop cancelled");
                    break;
                }
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    let kind = message.kind();
                    if let Err(e) = self.handle(message).await {
                        warn!(kind, error = %e, "message handling failed");
                    }
                }
            }
        }
    }

    /// Wait for a batch's aggregate. `None` if the batch is unknown or was
    /// stopped before publishing.
    ///
    /// A batch whose actor was already pruned is answered from the ledger.
    pub async fn wait_for(&self, batch_id: &BatchId) -> Option<AggregateResult> {
        let result = self
            .batches
            .lock()
            .await
            .get(batch_id)
            .map(BatchHandle::subscribe);
        match result {
            Some(result) => wait_result(result).await,
            None => self.published_result(batch_id).await,
        }
    }

    async fn published_result(&self, batch_id: &BatchId) -> Option<AggregateResult> {
        match self.ledger.load(batch_id).await {
            Ok(Some(record)) if record.published => record.aggregate,
            Ok(_) => None,
            Err(e) => {
                warn!(%batch_id, error = %e, "ledger lookup failed");
                None
            }
        }
    }

    /// Size of the routing table once finished actors are pruned.
    pub async fn tracked_batches(&self) -> usize {
        let mut batches = self.batches.lock().await;
        prune(&mut batches);
        batches.len()
    }

    /// Batches with a live actor.
    pub async fn active_batches(&self) -> Vec<BatchId> {
        let batches = self.batches.lock().await;
        let mut active: Vec<BatchId> = batches
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        active.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        active
    }

    /// Stop every batch actor and wait for them to exit.
    ///
    /// Unfinished batches stay in the ledger and are picked up by
    /// [`recover`](Dispatcher::recover) on the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<BatchHandle> = self
            .batches
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        info!(batches = handles.len(), "dispatcher shutting down");
        for result in join_all(handles.into_iter().map(BatchHandle::join)).await {
            if let Err(e) = result {
                warn!(error = %e, "batch actor did not exit cleanly");
            }
        }
    }
}

/// Drop handles whose actor has exited; their outcome lives in the ledger.
fn prune(batches: &mut HashMap<BatchId, BatchHandle>) {
    batches.retain(|_, handle| !handle.is_finished());
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("outlet", &self.outlet)
            .field("settings", &self.settings)
            .finish()
    }
}
