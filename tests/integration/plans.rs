//! Plan structure integration tests.
//!
//! These tests verify phase ordering across a batch and the handling of
//! tasks the plan has not approved.

use std::sync::Arc;

use tempfile::TempDir;

use dispatcher::core::{BatchId, Phase, Task, TaskId, TaskStatus};
use dispatcher::protocol::BatchOutcome;
use dispatcher::sim::Script;
use dispatcher::state::{BatchLedger, FileTaskSource, MemoryLedger, PHASES_FILE, TASKS_FILE};
use dispatcher::transport::MemoryBus;
use dispatcher::Error;

use crate::fixtures::{diamond, settings, Harness, PLAN};

fn two_phases() -> Vec<Phase> {
    vec![
        Phase::new("foundation"),
        Phase::new("features").with_depends_on(["foundation"]),
    ]
}

fn status_of(record_tasks: &[Task], id: &str) -> TaskStatus {
    record_tasks
        .iter()
        .find(|task| task.id.as_str() == id)
        .unwrap()
        .status
        .clone()
}

/// Test: Later phase waits for the earlier one
/// Given two foundation tasks and two feature tasks with no task dependencies
/// When the batch runs with room for all four at once
/// Then no feature task is dispatched before both foundation tasks complete
#[tokio::test(start_paused = true)]
async fn test_later_phase_waits_for_earlier() {
    let tasks = vec![
        Task::new("schema").with_phase("foundation"),
        Task::new("config").with_phase("foundation"),
        Task::new("api").with_phase("features"),
        Task::new("ui").with_phase("features"),
    ];
    let harness = Harness::phased(tasks, two_phases(), settings(4), Script::new());
    let result = harness.run("b-phased").await;

    assert_eq!(result.dispatched_count, 4);
    assert_eq!(result.status, BatchOutcome::Success);

    let observed = harness.simulator.observations();
    let foundation_done = ["schema", "config"]
        .iter()
        .map(|id| observed.completed_at[&TaskId::from(*id)])
        .max()
        .unwrap();
    for feature in ["api", "ui"] {
        assert!(observed.dispatched_at[&TaskId::from(feature)] > foundation_done);
    }
}

/// Test: A failed phase still releases the next one
/// Given a foundation task that fails and a feature task in the next phase
/// When the batch runs
/// Then the feature task runs after the failure and the batch is partial
#[tokio::test(start_paused = true)]
async fn test_phase_failure_does_not_block_next_phase() {
    let tasks = vec![
        Task::new("schema").with_phase("foundation"),
        Task::new("config").with_phase("foundation"),
        Task::new("api").with_phase("features"),
    ];
    let script = Script::new().fail_execution("schema", "migration failed");
    let harness = Harness::phased(tasks, two_phases(), settings(4), script);
    let result = harness.run("b-phase-fail").await;

    assert_eq!(result.dispatched_count, 3);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.status, BatchOutcome::Partial);

    let observed = harness.simulator.observations();
    let api = observed.dispatched_at[&TaskId::from("api")];
    assert!(observed.failed_at[&TaskId::from("schema")] < api);
    assert!(observed.completed_at[&TaskId::from("config")] < api);
}

/// Test: Empty phases chain their neighbours
/// Given phases p1 -> p2 -> p3 where p2 has no tasks
/// When the batch runs
/// Then p3's task still waits for p1's task
#[tokio::test(start_paused = true)]
async fn test_empty_phase_still_orders_neighbours() {
    let phases = vec![
        Phase::new("p1"),
        Phase::new("p2").with_depends_on(["p1"]),
        Phase::new("p3").with_depends_on(["p2"]),
    ];
    let tasks = vec![
        Task::new("first").with_phase("p1"),
        Task::new("last").with_phase("p3"),
    ];
    let harness = Harness::phased(tasks, phases, settings(2), Script::new());
    let result = harness.run("b-gap").await;

    assert_eq!(result.status, BatchOutcome::Success);
    let observed = harness.simulator.observations();
    assert_eq!(observed.dispatch_order, vec![TaskId::from("first"), TaskId::from("last")]);
    let first_done = observed.completed_at[&TaskId::from("first")];
    assert!(first_done < observed.dispatched_at[&TaskId::from("last")]);
}

/// Test: Task in an unknown phase
/// Given a task naming a phase the plan does not define
/// When the batch is triggered
/// Then it is rejected before any context request
#[tokio::test(start_paused = true)]
async fn test_unknown_phase_rejected() {
    let tasks = vec![Task::new("a").with_phase("nowhere")];
    let harness = Harness::phased(tasks, two_phases(), settings(2), Script::new());

    let err = harness.trigger("b-lost").await.unwrap_err();
    assert!(matches!(err, Error::UnknownPhase { .. }));
    assert_eq!(harness.bus.count_of("context_request"), 0);
    assert_eq!(harness.aggregates("b-lost")[0].status, BatchOutcome::Rejected);
}

/// Test: Phase cycle
#[tokio::test(start_paused = true)]
async fn test_phase_cycle_rejected() {
    let phases = vec![
        Phase::new("p1").with_depends_on(["p2"]),
        Phase::new("p2").with_depends_on(["p1"]),
    ];
    let tasks = vec![Task::new("a").with_phase("p1")];
    let harness = Harness::phased(tasks, phases, settings(2), Script::new());

    let err = harness.trigger("b-loop").await.unwrap_err();
    assert!(matches!(err, Error::PhaseCycle(_)));
    assert!(err.is_pre_dispatch());
}

/// Test: Unapproved task is skipped
/// Given the diamond with B not approved
/// When the batch runs
/// Then B is never dispatched, C and D still run and the batch succeeds
#[tokio::test(start_paused = true)]
async fn test_unapproved_task_skipped() {
    let mut tasks = diamond();
    tasks[1] = Task::new("B").with_description("config").unapproved();
    let harness = Harness::new(tasks, settings(2), Script::new());
    let result = harness.run("b-approval").await;

    assert_eq!(result.task_count, 4);
    assert_eq!(result.dispatched_count, 3);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(harness.triggers_for("B"), 0);
    assert_eq!(harness.triggers_for("C"), 1);
    assert_eq!(harness.triggers_for("D"), 1);

    let observed = harness.simulator.observations();
    assert_eq!(observed.skipped, vec![TaskId::from("B")]);
    assert!(!observed.context_requests.contains_key(&TaskId::from("B")));

    let record = harness
        .ledger
        .load(&BatchId::from("b-approval"))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(status_of(&record.tasks, "B"), TaskStatus::Skipped { .. }));
}

/// Test: Phased plan read from disk
/// Given tasks.json with phase ids and one unapproved task, plus phases.json
/// When the batch runs from a file-backed task source
/// Then phase order holds and the unapproved task is skipped
#[tokio::test(start_paused = true)]
async fn test_phased_plan_from_files() {
    let plans = TempDir::new().unwrap();
    let plan_dir = plans.path().join(PLAN);
    std::fs::create_dir_all(&plan_dir).unwrap();
    std::fs::write(
        plan_dir.join(TASKS_FILE),
        r#"[
            {"id": "schema", "phase_id": "foundation", "status": "approved"},
            {"id": "seed", "phase_id": "foundation", "status": "pending_approval"},
            {"id": "api", "phase_id": "features", "status": "approved"}
        ]"#,
    )
    .unwrap();
    std::fs::write(
        plan_dir.join(PHASES_FILE),
        r#"[
            {"id": "foundation", "plan_id": "demo", "sequence": 1, "status": "pending"},
            {"id": "features", "sequence": 2, "depends_on": ["foundation"]}
        ]"#,
    )
    .unwrap();

    let harness = Harness::build(
        Arc::new(MemoryBus::new()),
        Arc::new(MemoryLedger::new()),
        Arc::new(FileTaskSource::new(plans.path())),
        settings(4),
        Script::new(),
    );
    let result = harness.run("b-disk-phases").await;

    assert_eq!(result.task_count, 3);
    assert_eq!(result.dispatched_count, 2);
    assert_eq!(result.status, BatchOutcome::Success);
    assert_eq!(harness.triggers_for("seed"), 0);

    let observed = harness.simulator.observations();
    assert_eq!(observed.dispatch_order, vec![TaskId::from("schema"), TaskId::from("api")]);
    assert_eq!(observed.skipped, vec![TaskId::from("seed")]);
}
