//! Branch and tag filtering of runs.

use conduit_core::run::{JobState, RunStatus};
use conduit_core::trigger::{FilterPolicy, TriggerContext};
use conduit_scheduler::SchedulerConfig;
use conduit_tests::{PipelineFixture, ScriptedWorker, TestHarness};
use pretty_assertions::assert_eq;

fn harness() -> TestHarness {
    TestHarness::new(PipelineFixture::RELEASE, ScriptedWorker::new())
}

#[tokio::test]
async fn test_main_branch_deploys_without_publishing() {
    let harness = harness();
    let snapshot = harness.run("release", TriggerContext::branch("main")).await;

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Succeeded));
    let publish = snapshot.job("publish").unwrap();
    assert_eq!(publish.state, JobState::Skipped);
    assert!(!publish.visited(JobState::Running));
    assert_eq!(
        harness.worker.started(),
        vec!["build".to_string(), "deploy".to_string()]
    );
}

#[tokio::test]
async fn test_feature_branch_only_builds() {
    let harness = harness();
    let snapshot = harness
        .run("release", TriggerContext::branch("feature/login"))
        .await;

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    assert_eq!(snapshot.state_of("build"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Skipped));
    assert_eq!(snapshot.state_of("publish"), Some(JobState::Skipped));
}

#[tokio::test]
async fn test_release_tag_publishes() {
    let harness = harness();
    let snapshot = harness.run("release", TriggerContext::tag("v1.2.3")).await;

    assert_eq!(snapshot.status, RunStatus::Succeeded);
    // Unfiltered jobs run on tags; branch-filtered ones do not.
    assert_eq!(snapshot.state_of("build"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("publish"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Skipped));
}

#[tokio::test]
async fn test_tag_outside_the_pattern() {
    let harness = harness();
    let snapshot = harness.run("release", TriggerContext::tag("v1.2")).await;

    assert_eq!(snapshot.state_of("build"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("publish"), Some(JobState::Skipped));
    assert!(harness.worker.calls_for("publish").is_empty());
}

#[tokio::test]
async fn test_no_run_when_nothing_is_admitted() {
    let harness = harness();
    assert!(
        harness
            .trigger("tags-only", TriggerContext::branch("main"))
            .await
            .is_none()
    );
    assert!(harness.worker.calls().is_empty());
    assert!(harness.scheduler.active_runs().await.is_empty());

    let snapshot = harness.run("tags-only", TriggerContext::tag("v2.0.0")).await;
    assert_eq!(snapshot.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_symmetric_policy() {
    let config = SchedulerConfig::default().with_filter_policy(FilterPolicy::symmetric());
    let harness = TestHarness::with_config(PipelineFixture::RELEASE, ScriptedWorker::new(), config);

    // A branch filter says nothing about tags under the symmetric policy.
    let snapshot = harness.run("release", TriggerContext::tag("v1.2.3")).await;
    assert_eq!(snapshot.state_of("deploy"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("publish"), Some(JobState::Succeeded));

    let snapshot = harness.run("release", TriggerContext::branch("main")).await;
    assert_eq!(snapshot.state_of("publish"), Some(JobState::Succeeded));
}
