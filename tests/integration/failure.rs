//! Failure handling integration tests.
//!
//! These tests verify failure propagation under both policies, bounded
//! context retries, timeouts, cancellation and pre-dispatch rejection.

use std::collections::HashMap;

use dispatcher::core::{BatchId, FailurePolicy, Task, TaskId, TaskStatus};
use dispatcher::protocol::{BatchOutcome, CancelBatch, Inbound};
use dispatcher::sim::Script;
use dispatcher::state::BatchLedger;
use dispatcher::Error;

use crate::fixtures::{diamond, fan_out, independent, settings, wait_until, Harness};

async fn final_statuses(harness: &Harness, batch: &str) -> HashMap<TaskId, TaskStatus> {
    let record = harness
        .ledger
        .load(&BatchId::from(batch))
        .await
        .unwrap()
        .unwrap();
    record
        .tasks
        .into_iter()
        .map(|task| (task.id, task.status))
        .collect()
}

fn failed_with(reason: &str) -> TaskStatus {
    TaskStatus::Failed {
        reason: reason.to_string(),
    }
}

/// Test: Fan-out with a pre-dispatch failure
/// Given A -> {B, C} and independent D
/// When A's context build keeps failing
/// Then B and C are skipped, D completes, and the aggregate is {1 dispatched, 3 failed, partial}
#[tokio::test(start_paused = true)]
async fn test_fan_out_context_failure() {
    let script = Script::new().fail_context("A", u32::MAX);
    let harness = Harness::new(fan_out(), settings(4), script);
    let result = harness.run("b-pre").await;

    assert_eq!(result.task_count, 4);
    assert_eq!(result.dispatched_count, 1);
    assert_eq!(result.failed_count, 3);
    assert_eq!(result.status, BatchOutcome::Partial);
    assert_eq!(harness.triggers_for("A"), 0);
    assert_eq!(harness.triggers_for("D"), 1);

    let observed = harness.simulator.observations();
    assert_eq!(observed.context_requests[&TaskId::from("A")], 3);

    let statuses = final_statuses(&harness, "b-pre").await;
    assert_eq!(statuses[&TaskId::from("B")], failed_with("dependency A failed"));
    assert_eq!(statuses[&TaskId::from("C")], failed_with("dependency A failed"));
    assert_eq!(statuses[&TaskId::from("D")], TaskStatus::Completed);
}

/// Test: Fan-out with a post-dispatch failure
/// Given A -> {B, C} and independent D
/// When A is dispatched and its execution fails
/// Then the aggregate is {2 dispatched, 3 failed, partial}
#[tokio::test(start_paused = true)]
async fn test_fan_out_execution_failure() {
    let script = Script::new().fail_execution("A", "tests failed");
    let harness = Harness::new(fan_out(), settings(4), script);
    let result = harness.run("b-post").await;

    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.failed_count, 3);
    assert_eq!(result.status, BatchOutcome::Partial);
    assert_eq!(harness.triggers_for("B"), 0);
    assert_eq!(harness.triggers_for("C"), 0);

    let statuses = final_statuses(&harness, "b-post").await;
    assert_eq!(statuses[&TaskId::from("A")], failed_with("tests failed"));
    assert_eq!(harness.dispatcher.stats().snapshot().executions_failed, 1);
}

/// Test: Failure propagates transitively
/// Given the diamond
/// When B fails
/// Then C and D are skipped while A still completes
#[tokio::test(start_paused = true)]
async fn test_failure_propagates_transitively() {
    let script = Script::new().fail_execution("B", "boom");
    let harness = Harness::new(diamond(), settings(2), script);
    let result = harness.run("b-trans").await;

    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.failed_count, 3);
    assert_eq!(result.status, BatchOutcome::Partial);

    let statuses = final_statuses(&harness, "b-trans").await;
    assert_eq!(statuses[&TaskId::from("A")], TaskStatus::Completed);
    assert_eq!(statuses[&TaskId::from("C")], failed_with("dependency B failed"));
    assert_eq!(statuses[&TaskId::from("D")], failed_with("dependency B failed"));
}

/// Test: Diamond root fails before dispatch
/// Given the diamond
/// When A's context build keeps failing
/// Then B still runs while C and D are never triggered: {1 dispatched, 3 failed, partial}
#[tokio::test(start_paused = true)]
async fn test_diamond_context_failure_of_a() {
    let script = Script::new().fail_context("A", u32::MAX);
    let harness = Harness::new(diamond(), settings(2), script);
    let result = harness.run("b-diamond-pre").await;

    assert_eq!(result.dispatched_count, 1);
    assert_eq!(result.failed_count, 3);
    assert_eq!(result.status, BatchOutcome::Partial);
    assert_eq!(harness.triggers_for("A"), 0);
    assert_eq!(harness.triggers_for("B"), 1);
    assert_eq!(harness.triggers_for("C"), 0);
    assert_eq!(harness.triggers_for("D"), 0);

    let statuses = final_statuses(&harness, "b-diamond-pre").await;
    assert_eq!(statuses[&TaskId::from("B")], TaskStatus::Completed);
    assert_eq!(statuses[&TaskId::from("C")], failed_with("dependency A failed"));
    assert_eq!(statuses[&TaskId::from("D")], failed_with("dependency A failed"));
}

/// Test: Diamond root fails after dispatch
/// Given the diamond
/// When A is dispatched and its execution fails
/// Then the aggregate is {2 dispatched, 3 failed, partial}
#[tokio::test(start_paused = true)]
async fn test_diamond_execution_failure_of_a() {
    let script = Script::new().fail_execution("A", "migration failed");
    let harness = Harness::new(diamond(), settings(2), script);
    let result = harness.run("b-diamond-post").await;

    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.failed_count, 3);
    assert_eq!(result.status, BatchOutcome::Partial);
    assert_eq!(harness.triggers_for("C"), 0);
    assert_eq!(harness.triggers_for("D"), 0);

    let statuses = final_statuses(&harness, "b-diamond-post").await;
    assert_eq!(statuses[&TaskId::from("A")], failed_with("migration failed"));
    assert_eq!(statuses[&TaskId::from("B")], TaskStatus::Completed);
}

/// Test: Every task fails
#[tokio::test(start_paused = true)]
async fn test_all_failed_status() {
    let script = Script::new().fail_execution("A", "boom").fail_execution("D", "boom");
    let harness = Harness::new(fan_out(), settings(4), script);
    let result = harness.run("b-all").await;

    assert_eq!(result.failed_count, 4);
    assert_eq!(result.status, BatchOutcome::Failed);
}

/// Test: AbortAll policy
/// Given A -> {B, C}, independent D still running
/// When A fails under AbortAll
/// Then every non-terminal task fails at once
#[tokio::test(start_paused = true)]
async fn test_abort_all_policy() {
    let mut batch_settings = settings(4);
    batch_settings.failure_policy = FailurePolicy::AbortAll;
    let script = Script::new().fail_execution("A", "boom").hang_execution("D");
    let harness = Harness::new(fan_out(), batch_settings, script);
    let result = harness.run("b-abort").await;

    assert_eq!(result.failed_count, 4);
    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.status, BatchOutcome::Failed);

    let statuses = final_statuses(&harness, "b-abort").await;
    assert_eq!(statuses[&TaskId::from("D")], failed_with("batch aborted: task A failed"));
}

/// Test: Context retry recovers
/// Given a task whose first two context builds fail
/// When retries are allowed (three attempts)
/// Then the third attempt succeeds and the task is dispatched once
#[tokio::test(start_paused = true)]
async fn test_context_retry_recovers() {
    let script = Script::new().fail_context("A", 2);
    let harness = Harness::new(vec![Task::new("A")], settings(1), script);
    let result = harness.run("b-retry").await;

    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(harness.triggers_for("A"), 1);
    let observed = harness.simulator.observations();
    assert_eq!(observed.context_requests[&TaskId::from("A")], 3);
}

/// Test: Context timeout
/// Given a context builder that never answers for A
/// When each attempt times out
/// Then A fails after the configured attempts and independent tasks still complete
#[tokio::test(start_paused = true)]
async fn test_context_timeout_exhausts_attempts() {
    let mut tasks = independent(2);
    tasks.push(Task::new("A"));
    let script = Script::new().drop_context("A");
    let harness = Harness::new(tasks, settings(3), script);
    let result = harness.run("b-timeout").await;

    assert_eq!(result.failed_count, 1);
    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.status, BatchOutcome::Partial);

    let statuses = final_statuses(&harness, "b-timeout").await;
    match &statuses[&TaskId::from("A")] {
        TaskStatus::Failed { reason } => {
            assert!(reason.starts_with("context build failed after 3 attempts"), "{}", reason);
            assert!(reason.ends_with("context build timed out"), "{}", reason);
        }
        other => panic!("expected A to fail, got {:?}", other),
    }
}

/// Test: Execution deadline
/// Given a task that never reports back
/// When the batch execution timeout elapses
/// Then the task fails with "execution timeout" and the batch still publishes
#[tokio::test(start_paused = true)]
async fn test_execution_deadline() {
    let mut batch_settings = settings(2);
    batch_settings.execution_timeout_secs = 60;
    let script = Script::new().hang_execution("B");
    let harness = Harness::new(vec![Task::new("A"), Task::new("B")], batch_settings, script);
    let result = harness.run("b-deadline").await;

    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.status, BatchOutcome::Partial);
    let statuses = final_statuses(&harness, "b-deadline").await;
    assert_eq!(statuses[&TaskId::from("B")], failed_with("execution timeout"));
}

/// Test: Cancellation
/// Given a batch with a task stuck in execution
/// When a cancel message arrives
/// Then every non-terminal task fails with the cancel reason and late signals are discarded
#[tokio::test(start_paused = true)]
async fn test_cancel_mid_batch() {
    let script = Script::new().hang_execution("A").hang_execution("B");
    let harness = Harness::new(diamond(), settings(2), script);
    harness.trigger("b-cancel").await.unwrap();

    let bus = harness.bus.clone();
    wait_until(|| bus.count_of("execution_trigger") == 2).await;

    let cancel = CancelBatch {
        batch_id: BatchId::from("b-cancel"),
        reason: Some("plan superseded".to_string()),
    };
    harness.dispatcher.handle(Inbound::Cancel(cancel)).await.unwrap();
    let result = harness.wait("b-cancel").await;

    assert_eq!(result.failed_count, 4);
    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.status, BatchOutcome::Failed);

    let statuses = final_statuses(&harness, "b-cancel").await;
    assert_eq!(statuses[&TaskId::from("C")], failed_with("batch cancelled: plan superseded"));

    // A late completion changes nothing
    harness.complete("b-cancel", "A").await;
    assert_eq!(harness.aggregates("b-cancel").len(), 1);
    assert_eq!(harness.triggers_for("C"), 0);
}

/// Test: Cycle rejected before dispatch
/// Given tasks forming a cycle
/// When the batch is triggered
/// Then no context request or execution trigger is published and a rejected result is
#[tokio::test(start_paused = true)]
async fn test_cycle_rejected() {
    let tasks = vec![
        Task::new("a").with_depends_on(["c"]),
        Task::new("b").with_depends_on(["a"]),
        Task::new("c").with_depends_on(["b"]),
        Task::new("d"),
    ];
    let harness = Harness::new(tasks, settings(2), Script::new());

    let err = tokio_test::assert_err!(harness.trigger("b-cycle").await);
    assert!(matches!(err, Error::Cycle { .. }));
    assert!(err.is_pre_dispatch());

    assert_eq!(harness.bus.count_of("context_request"), 0);
    assert_eq!(harness.bus.count_of("execution_trigger"), 0);
    let results = harness.aggregates("b-cycle");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, BatchOutcome::Rejected);
    assert!(results[0].error.as_deref().unwrap().contains("cycle"));
}

/// Test: Unknown dependency rejected
#[tokio::test(start_paused = true)]
async fn test_unknown_dependency_rejected() {
    let tasks = vec![Task::new("a"), Task::new("b").with_depends_on(["zz"])];
    let harness = Harness::new(tasks, settings(2), Script::new());

    let err = harness.trigger("b-unknown").await.unwrap_err();
    assert!(matches!(err, Error::UnknownDependency { .. }));
    assert_eq!(harness.bus.count_of("context_request"), 0);
    assert_eq!(harness.aggregates("b-unknown").len(), 1);
}

/// Test: Trigger for a plan with no tasks
#[tokio::test(start_paused = true)]
async fn test_missing_plan_rejected() {
    let harness = Harness::new(Vec::new(), settings(2), Script::new());
    let err = harness.trigger("b-empty").await.unwrap_err();
    assert!(matches!(err, Error::NoTasks(_)));
    assert_eq!(harness.aggregates("b-empty")[0].status, BatchOutcome::Rejected);
}
