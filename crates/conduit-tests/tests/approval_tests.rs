//! Approval gates and run cancellation.

use conduit_core::Error;
use conduit_core::ids::RunId;
use conduit_core::run::{JobState, RunStatus};
use conduit_core::trigger::TriggerContext;
use conduit_scheduler::SchedulerConfig;
use conduit_tests::{Behavior, PipelineFixture, ScriptedWorker, TestHarness};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn main_branch() -> TriggerContext {
    TriggerContext::branch("main")
}

fn quick_cancel() -> SchedulerConfig {
    SchedulerConfig::default().with_cancel_grace_period(Duration::from_millis(200))
}

#[tokio::test]
async fn test_gate_blocks_until_approved() {
    let harness = TestHarness::new(PipelineFixture::GATED, ScriptedWorker::new());
    let run_id = harness.trigger("gated", main_branch()).await.unwrap();

    let snapshot = harness.wait_for_state(run_id, "hold", JobState::Running).await;
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Pending));

    let pending = harness.scheduler.list_pending_approvals(run_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job.as_str(), "hold");

    // Nothing moves while the gate is open.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = harness.scheduler.run_state(run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Running);
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Pending));
    assert_eq!(harness.worker.started(), vec!["build".to_string()]);

    harness.scheduler.approve(run_id, "hold", "alice").await.unwrap();
    let snapshot = harness.wait(run_id).await;
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.state_of("hold"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Succeeded));
    // Gates never reach a worker.
    assert!(harness.worker.calls_for("hold").is_empty());

    assert!(matches!(
        harness.scheduler.approve(run_id, "hold", "bob").await,
        Err(Error::GateAlreadyResolved(_))
    ));
    assert!(harness.scheduler.list_pending_approvals(run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_approve_rejects_bad_targets() {
    let harness = TestHarness::new(PipelineFixture::GATED, ScriptedWorker::new());
    let run_id = harness.trigger("gated", main_branch()).await.unwrap();
    harness.wait_for_state(run_id, "hold", JobState::Running).await;

    let scheduler = &harness.scheduler;
    assert!(matches!(
        scheduler.approve(run_id, "build", "alice").await,
        Err(Error::NotAnApprovalGate(_))
    ));
    assert!(matches!(
        scheduler.approve(run_id, "release", "alice").await,
        Err(Error::JobNotFound(_))
    ));
    assert!(matches!(
        scheduler.approve(RunId::new(), "hold", "alice").await,
        Err(Error::RunNotFound(_))
    ));

    scheduler.approve(run_id, "hold", "alice").await.unwrap();
    harness.wait(run_id).await;
}

#[tokio::test]
async fn test_gate_not_open_before_its_requirements() {
    let worker = ScriptedWorker::new().on("build", Behavior::Hang);
    let harness = TestHarness::with_config(PipelineFixture::GATED, worker, quick_cancel());
    let run_id = harness.trigger("gated", main_branch()).await.unwrap();
    harness.wait_for_state(run_id, "build", JobState::Running).await;

    assert!(matches!(
        harness.scheduler.approve(run_id, "hold", "alice").await,
        Err(Error::GateNotOpen(_))
    ));
    harness.scheduler.cancel_run(run_id, "done").await.unwrap();
    harness.wait(run_id).await;
}

#[tokio::test]
async fn test_gate_after_failure_is_skipped() {
    let worker = ScriptedWorker::new().on("build", Behavior::Exit(1));
    let harness = TestHarness::new(PipelineFixture::GATED, worker);
    let snapshot = harness.run("gated", main_branch()).await;

    assert_eq!(snapshot.status, RunStatus::Failed);
    let hold = snapshot.job("hold").unwrap();
    assert_eq!(hold.state, JobState::Skipped);
    assert!(!hold.visited(JobState::Running));
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Skipped));
}

#[tokio::test]
async fn test_cancel_stops_running_and_pending_jobs() {
    let worker = ScriptedWorker::new().on("build", Behavior::Hang);
    let harness = TestHarness::with_config(PipelineFixture::GATED, worker, quick_cancel());
    let run_id = harness.trigger("gated", main_branch()).await.unwrap();
    harness.wait_for_state(run_id, "build", JobState::Running).await;

    harness.scheduler.cancel_run(run_id, "superseded").await.unwrap();
    let snapshot = harness.wait(run_id).await;

    assert_eq!(snapshot.status, RunStatus::Cancelled);
    assert_eq!(snapshot.cancel_reason.as_ref().unwrap().message, "superseded");
    assert_eq!(snapshot.count(JobState::Cancelled), 3);

    // The cancelled worker returns; nothing else is dispatched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.worker.started(), vec!["build".to_string()]);
    assert_eq!(harness.worker.finished(), vec!["build".to_string()]);
}

#[tokio::test]
async fn test_cancel_drains_the_queue() {
    let worker = ScriptedWorker::new()
        .on("small", Behavior::Hang)
        .on("large", Behavior::Hang);
    let config = quick_cancel().with_worker_capacity(1);
    let harness = TestHarness::with_config(PipelineFixture::WIDE, worker, config);
    let run_id = harness.trigger("wide", main_branch()).await.unwrap();
    harness.wait_for_state(run_id, "small-1", JobState::Running).await;

    harness.scheduler.cancel_run(run_id, "stop").await.unwrap();
    let snapshot = harness.wait(run_id).await;
    assert_eq!(snapshot.count(JobState::Cancelled), 7);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.worker.calls().len(), 1);
}

#[tokio::test]
async fn test_cancelled_worker_holds_capacity_until_grace_expires() {
    let worker = ScriptedWorker::new().on("build", Behavior::Stubborn(Duration::from_secs(5)));
    let config = quick_cancel().with_worker_capacity(1);
    let harness = TestHarness::with_config(PipelineFixture::RELEASE, worker, config);

    let first = harness.trigger("release", main_branch()).await.unwrap();
    harness.wait_for_state(first, "build", JobState::Running).await;
    let second = harness
        .trigger("tags-only", TriggerContext::tag("v2.0.0"))
        .await
        .unwrap();

    let cancelled_at = tokio::time::Instant::now();
    harness.scheduler.cancel_run(first, "superseded").await.unwrap();
    assert_eq!(harness.wait(first).await.status, RunStatus::Cancelled);

    // The ignored cancel keeps the only slot busy during the grace period.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.worker.calls_for("publish").is_empty());
    let snapshot = harness.scheduler.run_state(second).await.unwrap();
    assert_eq!(snapshot.state_of("publish"), Some(JobState::Ready));

    let snapshot = harness.wait(second).await;
    let elapsed = cancelled_at.elapsed();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert!(elapsed >= Duration::from_millis(200), "started after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "started after {:?}", elapsed);
    assert_eq!(harness.worker.started(), vec!["build".to_string(), "publish".to_string()]);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_approval() {
    let harness = TestHarness::with_config(PipelineFixture::GATED, ScriptedWorker::new(), quick_cancel());
    let run_id = harness.trigger("gated", main_branch()).await.unwrap();
    harness.wait_for_state(run_id, "hold", JobState::Running).await;

    harness.scheduler.cancel_run(run_id, "declined").await.unwrap();
    let snapshot = harness.wait(run_id).await;
    assert_eq!(snapshot.status, RunStatus::Cancelled);
    assert_eq!(snapshot.state_of("build"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("hold"), Some(JobState::Cancelled));
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Cancelled));

    assert!(harness.scheduler.list_pending_approvals(run_id).await.unwrap().is_empty());
    // The gate was closed by the cancel, not left waiting.
    assert!(matches!(
        harness.scheduler.approve(run_id, "hold", "alice").await,
        Err(Error::GateAlreadyResolved(_))
    ));
}

#[tokio::test]
async fn test_cancel_after_completion_is_a_no_op() {
    let harness = TestHarness::new(PipelineFixture::RELEASE, ScriptedWorker::new());
    let snapshot = harness.run("release", main_branch()).await;
    assert_eq!(snapshot.status, RunStatus::Succeeded);

    harness.scheduler.cancel_run(snapshot.run_id, "late").await.unwrap();
    let after = harness.scheduler.run_state(snapshot.run_id).await.unwrap();
    assert_eq!(after.status, RunStatus::Succeeded);
    assert!(after.cancel_reason.is_none());
}
