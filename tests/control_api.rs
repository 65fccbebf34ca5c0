// tests/control_api.rs

mod common;
use crate::common::{start, wait_for_run_finished, with_timeout};

use std::time::Duration;

use dagflow::dag::TaskStatus;
use dagflow::engine::{ControlCommand, RerunMode};
use dagflow::errors::ControlError;
use dagflow::run::{RunId, RunStatus};
use dagflow::store::StateStore;
use dagflow::task::TaskId;
use dagflow_test_utils::builders::{FlowBuilder, chain, fan_out};
use dagflow_test_utils::fake_executor::{ScriptedExecutor, Step};

#[tokio::test]
async fn rerun_downstream_resets_task_and_dependents() {
    let exec = ScriptedExecutor::new();
    let mut h = start(chain("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Succeeded);

    h.handle.rerun(&run, "b", RerunMode::Downstream).await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Succeeded);

    assert_eq!(exec.attempts_of("a"), 1);
    assert_eq!(exec.attempts_of("b"), 2);
    assert_eq!(exec.attempts_of("c"), 2);

    h.stop().await;
}

#[tokio::test]
async fn rerun_single_leaves_dependents_alone() {
    let exec = ScriptedExecutor::new();
    let mut h = start(chain("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    wait_for_run_finished(&mut h.events, &run).await;

    h.handle.rerun(&run, "b", RerunMode::Single).await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Succeeded);

    assert_eq!(exec.attempts_of("b"), 2);
    assert_eq!(exec.attempts_of("c"), 1);
    let view = h.handle.run_status(&run).await.unwrap();
    assert_eq!(view.status_of("c"), Some(TaskStatus::Succeeded));

    h.stop().await;
}

#[tokio::test]
async fn rerun_after_failure_completes_the_run() {
    let exec = ScriptedExecutor::new();
    exec.script("b", [Step::Fail(dagflow::errors::TaskError::fatal("bad input"))]);
    let mut h = start(chain("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Failed);
    assert_eq!(exec.attempts_of("c"), 0);

    h.handle.rerun(&run, "b", "downstream".parse().unwrap()).await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Succeeded);
    assert_eq!(exec.attempts_of("c"), 1);

    h.stop().await;
}

#[tokio::test]
async fn rerun_of_running_task_is_rejected() {
    let exec = ScriptedExecutor::new();
    exec.script("a", [Step::Hang]);
    let h = start(chain("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    with_timeout(exec.wait_for_starts(1)).await;

    let err = h.handle.rerun(&run, "a", RerunMode::Single).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidTransition { .. }), "{err:?}");
    assert_eq!(err.code(), "invalid_transition");

    let view = h.handle.run_status(&run).await.unwrap();
    assert_eq!(view.status_of("a"), Some(TaskStatus::Running));

    h.handle.cancel_run(&run).await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn cancel_run_stops_running_work() {
    let exec = ScriptedExecutor::new().non_preemptible();
    exec.script("a", [Step::Hang]);
    let mut h = start(fan_out("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    with_timeout(exec.wait_for_starts(1)).await;

    h.handle.cancel_run(&run).await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Cancelled);

    let view = h.handle.run_status(&run).await.unwrap();
    assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Cancelled));

    with_timeout(async {
        while exec.cancelled().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(exec.cancelled(), vec!["a".to_string()]);

    let err = h.handle.cancel_run(&run).await.unwrap_err();
    assert_eq!(err, ControlError::RunFinished(run.clone()));

    // The late result of the cancelled attempt changes nothing.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let view = h.handle.run_status(&run).await.unwrap();
    assert_eq!(view.status_of("a"), Some(TaskStatus::Cancelled));

    h.stop().await;
}

#[tokio::test]
async fn cancel_task_leaves_sibling_branch_running() {
    let exec = ScriptedExecutor::new();
    exec.script("b", [Step::Hang]);
    let mut h = start(fan_out("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    with_timeout(async {
        while exec.attempts_of("b") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    h.handle.cancel_task(&run, "b").await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Failed);

    let view = h.handle.run_status(&run).await.unwrap();
    assert_eq!(view.status_of("b"), Some(TaskStatus::Cancelled));
    assert_eq!(view.status_of("c"), Some(TaskStatus::Succeeded));

    let err = h.handle.cancel_task(&run, "c").await.unwrap_err();
    assert_eq!(err, ControlError::RunFinished(run.clone()));

    h.stop().await;
}

#[tokio::test]
async fn cancelling_a_finished_task_is_invalid() {
    let exec = ScriptedExecutor::new();
    exec.script("b", [Step::Hang]);
    let h = start(chain("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    with_timeout(exec.wait_for_starts(2)).await;

    let err = h.handle.cancel_task(&run, "a").await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::InvalidTransition { status: TaskStatus::Succeeded, .. }
    ));

    h.handle.cancel_run(&run).await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn paused_flow_dispatches_nothing_until_resumed() {
    let exec = ScriptedExecutor::new();
    let mut h = start(chain("f").build(), &exec);

    h.handle.pause("f").await.unwrap();
    let run = h.handle.trigger_run("f").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(exec.executed().is_empty());
    let view = h.handle.run_status(&run).await.unwrap();
    assert_eq!(view.status_of("a"), Some(TaskStatus::Ready));
    assert_eq!(view.status_of("b"), Some(TaskStatus::Blocked));

    h.handle.resume("f").await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Succeeded);
    assert_eq!(exec.executed_tasks(), vec!["a", "b", "c"]);

    h.stop().await;
}

#[tokio::test]
async fn unknown_identifiers_are_reported() {
    let exec = ScriptedExecutor::new();
    let mut h = start(chain("f").build(), &exec);

    let err = h.handle.trigger_run("nope").await.unwrap_err();
    assert_eq!(err, ControlError::UnknownFlow("nope".to_string()));
    assert_eq!(err.code(), "unknown_flow");

    let ghost = RunId::new("f", 99);
    let err = h.handle.run_status(&ghost).await.unwrap_err();
    assert_eq!(err, ControlError::UnknownRun(ghost.clone()));
    assert_eq!(h.handle.cancel_run(&ghost).await.unwrap_err().code(), "unknown_run");

    let run = h.handle.trigger_run("f").await.unwrap();
    wait_for_run_finished(&mut h.events, &run).await;
    let err = h.handle.rerun(&run, "zzz", RerunMode::Single).await.unwrap_err();
    assert_eq!(err.code(), "unknown_task");

    assert!(h.handle.pause("nope").await.is_err());

    h.stop().await;
}

#[tokio::test]
async fn list_runs_returns_history_in_order() {
    let exec = ScriptedExecutor::new();
    let mut h = start(chain("f").build(), &exec);

    for _ in 0..3 {
        let run = h.handle.trigger_run("f").await.unwrap();
        wait_for_run_finished(&mut h.events, &run).await;
    }

    let runs = h.handle.list_runs("f").await.unwrap();
    let seqs: Vec<u64> = runs.iter().map(|r| r.id.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded && r.finished_at.is_some()));

    h.stop().await;
}

#[tokio::test]
async fn retired_flow_rejects_new_runs() {
    let exec = ScriptedExecutor::new();
    let h = start(chain("f").build(), &exec);

    h.handle.retire_flow("f").await.unwrap();
    let err = h.handle.trigger_run("f").await.unwrap_err();
    assert_eq!(err, ControlError::FlowInactive("f".to_string()));
    assert_eq!(err.code(), "flow_inactive");

    h.stop().await;
}

#[tokio::test]
async fn drain_waits_for_in_flight_and_dispatches_nothing_new() {
    let exec = ScriptedExecutor::new();
    exec.script("a", [Step::Sleep(Duration::from_millis(100))]);
    let h = start(chain("f").build(), &exec);

    let run = h.handle.trigger_run("f").await.unwrap();
    with_timeout(exec.wait_for_starts(1)).await;

    let store = h.store.clone();
    let handle = h.handle.clone();
    h.stop().await;

    assert_eq!(exec.executed_tasks(), vec!["a"]);
    let stored = store.get_run(&run).unwrap().unwrap();
    assert_eq!(stored.summary.status, RunStatus::Running);
    assert_eq!(stored.records[&TaskId::from("a")].status, TaskStatus::Succeeded);
    assert_eq!(stored.records[&TaskId::from("b")].status, TaskStatus::Ready);

    let err = handle.trigger_run("f").await.unwrap_err();
    assert_eq!(err, ControlError::SchedulerStopped);
}

#[tokio::test]
async fn registering_an_invalid_flow_leaves_the_scheduler_running() {
    let exec = ScriptedExecutor::new();
    let mut h = start(chain("f").build(), &exec);

    let broken = FlowBuilder::new("broken").task("a", &["ghost"]).build();
    let err = h
        .handle
        .send(ControlCommand::RegisterFlow { flow: Box::new(broken) })
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidGraph { .. }), "{err:?}");
    assert_eq!(err.code(), "invalid_graph");

    let run = h.handle.trigger_run("f").await.unwrap();
    assert_eq!(wait_for_run_finished(&mut h.events, &run).await, RunStatus::Succeeded);
    assert!(matches!(
        h.handle.trigger_run("broken").await,
        Err(ControlError::UnknownFlow(_))
    ));

    h.stop().await;
}
