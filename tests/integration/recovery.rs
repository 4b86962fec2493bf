//! Crash recovery integration tests.
//!
//! These tests stop a dispatcher mid-batch and start a fresh one on the same
//! bus and ledger, verifying that the batch finishes without re-dispatching
//! work and that its aggregate is published exactly once.

use std::sync::Arc;

use tempfile::TempDir;

use dispatcher::core::{BatchId, BatchState, Task, TaskStatus};
use dispatcher::protocol::BatchOutcome;
use dispatcher::sim::Script;
use dispatcher::state::{BatchLedger, FileLedger, InlineTaskSource};
use dispatcher::transport::MemoryBus;

use crate::fixtures::{diamond, fan_out, independent, settings, wait_until, Harness, PLAN};

/// Test: Restart with tasks in flight
/// Given a diamond whose A and B were dispatched before a crash
/// When a new dispatcher recovers and the executor reports back
/// Then C and D run, no task is dispatched twice and one aggregate is published
#[tokio::test(start_paused = true)]
async fn test_restart_with_dispatched_tasks() {
    let script = Script::new().hang_execution("A").hang_execution("B");
    let harness = Harness::new(diamond(), settings(2), script);
    harness.trigger("b-crash").await.unwrap();

    let bus = harness.bus.clone();
    wait_until(|| bus.count_of("execution_trigger") == 2).await;

    let harness = harness.restart(Script::new()).await;
    assert_eq!(harness.dispatcher.recover().await.unwrap(), 1);
    assert_eq!(harness.dispatcher.active_batches().await, vec![BatchId::from("b-crash")]);

    harness.complete("b-crash", "A").await;
    harness.complete("b-crash", "B").await;
    let result = harness.wait("b-crash").await;

    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(result.dispatched_count, 4);
    assert_eq!(harness.aggregates("b-crash").len(), 1);
    for task in ["A", "B", "C", "D"] {
        assert_eq!(harness.triggers_for(task), 1, "task {} dispatched more than once", task);
    }
}

/// Test: Restart while the aggregate is unpublished
/// Given a drained batch whose result publish kept failing
/// When the dispatcher restarts on a healthy bus
/// Then the stored aggregate is published once
#[tokio::test(start_paused = true)]
async fn test_restart_publishes_pending_aggregate() {
    let harness = Harness::new(independent(2), settings(2), Script::new());
    harness.bus.fail_next("aggregate_result", usize::MAX);
    harness.trigger("b-drain").await.unwrap();

    let bus = harness.bus.clone();
    // context_building, dispatched and completed for both tasks
    wait_until(|| bus.count_of("phase_update") == 6).await;
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert!(harness.aggregates("b-drain").is_empty());

    let record = harness.ledger.load(&BatchId::from("b-drain")).await.unwrap().unwrap();
    assert_eq!(record.state(), BatchState::Draining);
    assert!(!record.published);

    harness.bus.fail_next("aggregate_result", 0);
    let harness = harness.restart(Script::new()).await;
    assert_eq!(harness.dispatcher.recover().await.unwrap(), 1);
    let result = harness.wait("b-drain").await;

    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(harness.aggregates("b-drain").len(), 1);
    assert_eq!(harness.bus.count_of("execution_trigger"), 2);

    let record = harness.ledger.load(&BatchId::from("b-drain")).await.unwrap().unwrap();
    assert!(record.published);
    assert_eq!(record.state(), BatchState::Completed);
}

/// Test: Finished batches stay finished
/// Given a completed batch in the ledger
/// When the dispatcher restarts and the trigger is re-delivered
/// Then nothing is resumed and nothing is published
#[tokio::test(start_paused = true)]
async fn test_completed_batch_not_resumed() {
    let harness = Harness::new(diamond(), settings(2), Script::new());
    harness.run("b-done").await;
    let published = harness.bus.published().len();

    let harness = harness.restart(Script::new()).await;
    assert_eq!(harness.dispatcher.recover().await.unwrap(), 0);
    assert!(harness.dispatcher.active_batches().await.is_empty());

    harness.trigger("b-done").await.unwrap();
    assert_eq!(harness.bus.published().len(), published);
}

/// Test: Restart from a file ledger
/// Given a batch persisted to disk with A still running
/// When a new dispatcher reads the same directory
/// Then the batch resumes and finishes
#[tokio::test(start_paused = true)]
async fn test_restart_from_file_ledger() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let harness = Harness::build(
        bus.clone(),
        Arc::new(FileLedger::new(dir.path())),
        Arc::new(InlineTaskSource::new().with_plan(PLAN, fan_out())),
        settings(4),
        Script::new().hang_execution("A"),
    );
    harness.trigger("b-disk").await.unwrap();
    wait_until(|| bus.count_of("execution_trigger") == 2).await;
    harness.dispatcher.shutdown().await;

    // A fresh ledger instance proves the state came from disk
    let reopened = Arc::new(FileLedger::new(dir.path()));
    let record = reopened.load(&BatchId::from("b-disk")).await.unwrap().unwrap();
    assert_eq!(record.state(), BatchState::Dispatching);
    assert_eq!(record.plan_slug, PLAN);

    let harness = Harness::build(
        bus,
        reopened.clone(),
        Arc::new(InlineTaskSource::new().with_plan(PLAN, fan_out())),
        settings(4),
        Script::new(),
    );
    assert_eq!(harness.dispatcher.recover().await.unwrap(), 1);
    harness.complete("b-disk", "A").await;
    let result = harness.wait("b-disk").await;

    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(result.request_id, "req-b-disk");
    assert_eq!(harness.triggers_for("A"), 1);
    assert!(reopened.unfinished().await.unwrap().is_empty());
}

/// Test: Context build interrupted by a crash
/// Given A waiting on a context build that never answered
/// When the dispatcher restarts
/// Then A's context is requested again and the batch succeeds
#[tokio::test(start_paused = true)]
async fn test_context_build_restarted_after_crash() {
    let tasks = vec![Task::new("A"), Task::new("B").with_depends_on(["A"])];
    let harness = Harness::new(tasks, settings(2), Script::new().drop_context("A"));
    harness.trigger("b-ctx-crash").await.unwrap();

    let bus = harness.bus.clone();
    wait_until(|| bus.count_of("context_request") == 1).await;
    let record = harness
        .ledger
        .load(&BatchId::from("b-ctx-crash"))
        .await
        .unwrap()
        .unwrap();
    let a = record.tasks.iter().find(|t| t.id.as_str() == "A").unwrap();
    assert_eq!(a.status, TaskStatus::ContextBuilding);

    let harness = harness.restart(Script::new()).await;
    assert_eq!(harness.dispatcher.recover().await.unwrap(), 1);
    let result = harness.wait("b-ctx-crash").await;

    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(harness.bus.count_of("context_request"), 3);
    assert_eq!(harness.triggers_for("A"), 1);
    assert_eq!(harness.triggers_for("B"), 1);
}
