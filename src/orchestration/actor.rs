//! Batch actor: one spawned task per batch, owning its controller.
//!
//! Inbound messages and fired timers reach the actor through an unbounded
//! channel and are applied one at a time, so a batch never needs a lock. A
//! ledger snapshot is written after every event. Once the batch drains the
//! actor keeps retrying the aggregate publication until it is delivered or
//! the actor is stopped.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::lifecycle::BatchState;
use crate::error::{Error, Result};
use crate::orchestration::controller::{BatchController, Timer, TimerEvent};
use crate::protocol::{AggregateResult, CompletionSignal, ContextBuildResult};
use crate::state::BatchLedger;

/// Events a batch actor consumes.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    ContextResult(ContextBuildResult),
    Completion(CompletionSignal),
    Cancel(Option<String>),
    Timer(TimerEvent),
}

/// How the actor brings its controller up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Fresh batch: Created -> Dispatching.
    Start,
    /// Restored from the ledger.
    Resume,
}

/// Handle to a running batch actor.
pub struct BatchHandle {
    events: mpsc::UnboundedSender<BatchEvent>,
    result: watch::Receiver<Option<AggregateResult>>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl BatchHandle {
    /// Queue an event for the batch.
    pub fn send(&self, event: BatchEvent) -> Result<()> {
        self.events.send(event).map_err(|_| Error::Shutdown)
    }

    /// Whether the actor has exited (batch completed or stopped).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// The published aggregate, once there is one.
    pub fn result(&self) -> Option<AggregateResult> {
        self.result.borrow().clone()
    }

    /// Wait for the published aggregate. `None` if the actor stopped first.
    pub async fn wait(&self) -> Option<AggregateResult> {
        wait_result(self.subscribe()).await
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AggregateResult>> {
        self.result.clone()
    }

    /// Stop the actor without completing the batch.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the actor task to exit.
    pub async fn join(self) -> Result<()> {
        self.join.await.map_err(|e| Error::TaskJoin(e.to_string()))
    }
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("finished", &self.is_finished())
            .field("result", &self.result())
            .finish()
    }
}

/// Resolve once the watched aggregate is set, or the actor is gone.
pub(crate) async fn wait_result(
    mut result: watch::Receiver<Option<AggregateResult>>,
) -> Option<AggregateResult> {
    loop {
        if let Some(aggregate) = result.borrow_and_update().clone() {
            return Some(aggregate);
        }
        if result.changed().await.is_err() {
            return result.borrow().clone();
        }
    }
}

/// Drives one [`BatchController`] from its event channel.
pub struct BatchActor {
    controller: BatchController,
    ledger: Arc<dyn BatchLedger>,
    cancel: CancellationToken,
}

impl BatchActor {
    /// `shutdown` is the dispatcher-wide token; the actor listens on a child.
    pub fn new(
        controller: BatchController,
        ledger: Arc<dyn BatchLedger>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            controller,
            ledger,
            cancel: shutdown.child_token(),
        }
    }

    pub fn spawn(self, launch: Launch) -> BatchHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = watch::channel(None);
        let cancel = self.cancel.clone();

        debug!(batch_id = %self.controller.batch_id(), ?launch, "BatchActor::spawn");

        let timers = events_tx.clone();
        let join = tokio::spawn(self.run(launch, timers, events_rx, result_tx));

        BatchHandle {
            events: events_tx,
            result: result_rx,
            cancel,
            join,
        }
    }

    async fn run(
        mut self,
        launch: Launch,
        timers: mpsc::UnboundedSender<BatchEvent>,
        mut events: mpsc::UnboundedReceiver<BatchEvent>,
        result: watch::Sender<Option<AggregateResult>>,
    ) {
        let started = match launch {
            Launch::Start => self.controller.start().await,
            Launch::Resume => self.controller.resume().await,
        };
        if let Err(e) = started {
            error!(batch_id = %self.controller.batch_id(), error = %e, "batch failed to start");
            self.cancel.cancel();
            return;
        }
        self.arm_timers(&timers);
        self.persist().await;

        loop {
            match self.controller.state() {
                BatchState::Draining => {
                    if !self.deliver().await {
                        break;
                    }
                    continue;
                }
                BatchState::Completed => {
                    result.send_replace(self.controller.aggregate().cloned());
                    break;
                }
                BatchState::Created | BatchState::Dispatching => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(batch_id = %self.controller.batch_id(), "BatchActor cancelled");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.apply(event).await;
                    self.arm_timers(&timers);
                    self.persist().await;
                }
            }
        }

        // Releases any timers still sleeping
        self.cancel.cancel();
    }

    async fn apply(&mut self, event: BatchEvent) {
        let applied = match event {
            BatchEvent::ContextResult(result) => self.controller.on_context_result(result).await,
            BatchEvent::Completion(signal) => self.controller.on_completion(signal).await,
            BatchEvent::Cancel(reason) => self.controller.cancel(reason.as_deref()).await,
            BatchEvent::Timer(timer) => self.controller.on_timer(timer).await,
        };
        if let Err(e) = applied {
            error!(batch_id = %self.controller.batch_id(), error = %e, "batch event failed");
        }
    }

    /// Publish the aggregate, retrying with backoff. False if stopped first.
    async fn deliver(&mut self) -> bool {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.controller.publish_aggregate().await {
                Ok(()) => {
                    self.persist().await;
                    return true;
                }
                Err(e) => {
                    let delay = self.controller.settings().publish_backoff(attempt);
                    warn!(
                        batch_id = %self.controller.batch_id(),
                        attempt,
                        ?delay,
                        error = %e,
                        "aggregate publish failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn arm_timers(&mut self, events: &mpsc::UnboundedSender<BatchEvent>) {
        for Timer { delay, event } in self.controller.take_timers() {
            let events = events.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let _ = events.send(BatchEvent::Timer(event));
                    }
                }
            });
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.ledger.save(&self.controller.record()).await {
            warn!(batch_id = %self.controller.batch_id(), error = %e, "ledger save failed");
        }
    }
}
