//! Scheduling integration tests.
//!
//! These tests verify dispatch order, the concurrency ceiling and the
//! end-to-end happy path, including file-backed plans and ledgers.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use dispatcher::core::{BatchId, BatchState, TaskId};
use dispatcher::protocol::BatchOutcome;
use dispatcher::sim::Script;
use dispatcher::state::{BatchLedger, FileLedger, FileTaskSource, TASKS_FILE};
use dispatcher::transport::MemoryBus;

use crate::fixtures::{diamond, independent, layered, settings, Harness};

fn ids(list: &[&str]) -> Vec<TaskId> {
    list.iter().map(|s| TaskId::from(*s)).collect()
}

/// Test: Diamond batch succeeds
/// Given A, B -> C -> D with max_concurrent 2
/// When every task succeeds
/// Then the aggregate is {4, 4, 0, success} and C waits for both A and B
#[tokio::test(start_paused = true)]
async fn test_diamond_batch_succeeds() {
    let harness = Harness::new(diamond(), settings(2), Script::new());
    let result = harness.run("b-diamond").await;

    assert_eq!(result.task_count, 4);
    assert_eq!(result.dispatched_count, 4);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(result.request_id, "req-b-diamond");

    let observed = harness.simulator.observations();
    let order = &observed.dispatch_order;
    assert_eq!(order.len(), 4);
    assert_eq!(order[2], TaskId::from("C"));
    assert_eq!(order[3], TaskId::from("D"));

    let c_dispatched = observed.dispatched_at[&TaskId::from("C")];
    assert!(observed.completed_at[&TaskId::from("A")] < c_dispatched);
    assert!(observed.completed_at[&TaskId::from("B")] < c_dispatched);
    assert_eq!(harness.aggregates("b-diamond").len(), 1);
}

/// Test: Concurrency bound
/// Given eight independent tasks and max_concurrent 2
/// When executions take a while
/// Then no more than two tasks are ever active, and all eight run
#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_respected() {
    let script = Script::new().with_execution_delay(Duration::from_secs(5));
    let harness = Harness::new(independent(8), settings(2), script);
    let result = harness.run("b-bound").await;

    assert_eq!(result.dispatched_count, 8);
    assert_eq!(result.status, BatchOutcome::Success);

    let observed = harness.simulator.observations();
    assert_eq!(observed.max_active, 2);
}

/// Test: Concurrency bound of one serializes the batch
#[tokio::test(start_paused = true)]
async fn test_single_slot_follows_plan_order() {
    let tasks = vec![
        dispatcher::core::Task::new("t3"),
        dispatcher::core::Task::new("t1"),
        dispatcher::core::Task::new("t2"),
    ];
    let harness = Harness::new(tasks, settings(1), Script::new());
    harness.run("b-serial").await;

    let observed = harness.simulator.observations();
    assert_eq!(observed.max_active, 1);
    // Ready ties break on plan position, not id
    assert_eq!(observed.dispatch_order, ids(&["t3", "t1", "t2"]));
}

/// Test: Topological soundness
/// Given a layered graph with cross-layer edges
/// When the batch runs with some slack in concurrency
/// Then every task is dispatched after all of its dependencies completed
#[tokio::test(start_paused = true)]
async fn test_topological_soundness_layered() {
    let tasks = layered();
    let script = Script::new().with_execution_delay(Duration::from_millis(250));
    let harness = Harness::new(tasks.clone(), settings(3), script);
    let result = harness.run("b-layered").await;
    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(result.dispatched_count, tasks.len());

    let observed = harness.simulator.observations();
    assert!(observed.max_active <= 3);
    for task in &tasks {
        let dispatched = observed.dispatched_at[&task.id];
        for dep in &task.depends_on {
            assert!(
                observed.completed_at[dep] < dispatched,
                "{} dispatched before {} completed",
                task.id,
                dep
            );
        }
    }
}

/// Test: Dispatch trigger contents
/// Given a diamond batch
/// When it runs
/// Then each trigger carries a deterministic dispatch id and the context reference
#[tokio::test(start_paused = true)]
async fn test_dispatch_triggers_carry_context() {
    let harness = Harness::new(diamond(), settings(4), Script::new());
    harness.run("b-ctx").await;

    for trigger in harness.execution_triggers() {
        assert_eq!(trigger.dispatch_id, format!("b-ctx/{}", trigger.task_id));
        assert_eq!(trigger.context_reference, format!("ctx/b-ctx/{}", trigger.task_id));
        assert_eq!(trigger.plan_slug, crate::fixtures::PLAN);
    }
    let a = harness
        .execution_triggers()
        .into_iter()
        .find(|t| t.task_id.as_str() == "A")
        .unwrap();
    assert_eq!(a.description, "schema");
}

/// Test: Phase updates are published per batch
#[tokio::test(start_paused = true)]
async fn test_phase_updates_use_batch_subject() {
    let harness = Harness::new(diamond(), settings(2), Script::new());
    harness.run("b-phase").await;

    let phase_subjects: Vec<String> = harness
        .bus
        .published()
        .into_iter()
        .filter(|envelope| envelope.message.kind() == "phase_update")
        .map(|envelope| envelope.subject)
        .collect();
    // context_building, dispatched and completed for each of four tasks
    assert_eq!(phase_subjects.len(), 12);
    assert!(phase_subjects
        .iter()
        .all(|subject| subject == "workflow.phase.task-dispatcher.b-phase"));
}

/// Test: File-backed plan and ledger
/// Given a tasks.json under <plans_dir>/<slug>/ and a file ledger
/// When the batch runs
/// Then the ledger record on disk is finished and Completed
#[tokio::test(start_paused = true)]
async fn test_file_backed_plan_and_ledger() {
    let plans = TempDir::new().unwrap();
    let ledger_dir = TempDir::new().unwrap();
    let plan_dir = plans.path().join(crate::fixtures::PLAN);
    std::fs::create_dir_all(&plan_dir).unwrap();
    std::fs::write(
        plan_dir.join(TASKS_FILE),
        r#"[
            {"id": "A", "description": "schema"},
            {"id": "B"},
            {"id": "C", "depends_on": ["A", "B"]},
            {"id": "D", "depends_on": ["C"], "files": ["src/d.rs"]}
        ]"#,
    )
    .unwrap();

    let ledger = Arc::new(FileLedger::new(ledger_dir.path()));
    let harness = Harness::build(
        Arc::new(MemoryBus::new()),
        ledger.clone(),
        Arc::new(FileTaskSource::new(plans.path())),
        settings(2),
        Script::new(),
    );
    let result = harness.run("b-files").await;
    assert_eq!(result.status, BatchOutcome::Success);

    let record = ledger.load(&BatchId::from("b-files")).await.unwrap().unwrap();
    assert!(record.is_finished());
    assert_eq!(record.state(), BatchState::Completed);
    assert_eq!(record.aggregate.as_ref(), Some(&result));
    let visited: Vec<BatchState> = record.lifecycle.history().iter().map(|e| e.state).collect();
    assert_eq!(
        visited,
        vec![
            BatchState::Created,
            BatchState::Dispatching,
            BatchState::Draining,
            BatchState::Completed
        ]
    );
}

/// Test: Batches run independently
/// Given two batches of the same plan
/// When both are triggered together
/// Then each publishes its own aggregate on its own subject
#[tokio::test(start_paused = true)]
async fn test_parallel_batches_are_isolated() {
    let harness = Harness::new(independent(3), settings(2), Script::new());
    tokio_test::assert_ok!(harness.trigger("b-one").await);
    tokio_test::assert_ok!(harness.trigger("b-two").await);

    let one = harness.wait("b-one").await;
    let two = harness.wait("b-two").await;
    assert_eq!(one.batch_id.as_str(), "b-one");
    assert_eq!(two.batch_id.as_str(), "b-two");
    assert_eq!(one.dispatched_count, 3);
    assert_eq!(two.dispatched_count, 3);

    let result_subjects: Vec<String> = harness
        .bus
        .published()
        .into_iter()
        .filter(|envelope| envelope.message.kind() == "aggregate_result")
        .map(|envelope| envelope.subject)
        .collect();
    assert_eq!(result_subjects.len(), 2);
    assert!(result_subjects.contains(&"workflow.result.task-dispatcher.b-one".to_string()));
    assert!(result_subjects.contains(&"workflow.result.task-dispatcher.b-two".to_string()));
}
