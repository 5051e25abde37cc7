//! Test harness wiring a scheduler to in-process collaborators.

use crate::fixtures::ScriptedWorker;
use conduit_core::ids::RunId;
use conduit_core::pipeline::PipelineConfig;
use conduit_core::ports::Worker;
use conduit_core::run::{JobState, RunSnapshot};
use conduit_core::trigger::TriggerContext;
use conduit_scheduler::{BroadcastEventBus, Scheduler, SchedulerConfig, TemplateRegistry};
use conduit_workspace::{MemoryBlobStore, WorkspaceStore};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A scheduler over a parsed pipeline, an in-memory workspace and a
/// broadcast bus.
pub struct TestHarness {
    pub pipeline: PipelineConfig,
    pub scheduler: Scheduler,
    pub worker: Arc<ScriptedWorker>,
    pub bus: Arc<BroadcastEventBus>,
    pub workspace: Arc<WorkspaceStore>,
    pub blobs: Arc<MemoryBlobStore>,
}

impl TestHarness {
    pub fn new(yaml: &str, worker: ScriptedWorker) -> Self {
        Self::with_config(yaml, worker, SchedulerConfig::default())
    }

    pub fn with_config(yaml: &str, worker: ScriptedWorker, config: SchedulerConfig) -> Self {
        let worker = Arc::new(worker);
        let pipeline = PipelineConfig::from_yaml(yaml).expect("pipeline parses");
        let (scheduler, bus, workspace, blobs) =
            build_scheduler(&pipeline, worker.clone(), config);
        Self {
            pipeline,
            scheduler,
            worker,
            bus,
            workspace,
            blobs,
        }
    }

    /// Start a run of `workflow`. `None` when no job is admitted.
    pub async fn trigger(&self, workflow: &str, context: TriggerContext) -> Option<RunId> {
        let spec = self.pipeline.workflow(workflow).expect("workflow exists");
        self.scheduler
            .trigger(&spec, context)
            .await
            .expect("workflow builds")
    }

    /// Start a run and wait for it to finish.
    pub async fn run(&self, workflow: &str, context: TriggerContext) -> RunSnapshot {
        let run_id = self
            .trigger(workflow, context)
            .await
            .expect("a job is admitted");
        self.wait(run_id).await
    }

    pub async fn wait(&self, run_id: RunId) -> RunSnapshot {
        tokio::time::timeout(TEST_TIMEOUT, self.scheduler.wait_for_completion(run_id))
            .await
            .expect("run finishes in time")
            .expect("run exists")
    }

    /// Poll until `job` reaches `state`.
    pub async fn wait_for_state(&self, run_id: RunId, job: &str, state: JobState) -> RunSnapshot {
        let poll = async {
            loop {
                let snapshot = self.scheduler.run_state(run_id).await.expect("run exists");
                if snapshot.state_of(job) == Some(state) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(TEST_TIMEOUT, poll)
            .await
            .unwrap_or_else(|_| panic!("{} never reached {}", job, state))
    }
}

/// Build a scheduler for `pipeline` around any worker.
pub fn build_scheduler(
    pipeline: &PipelineConfig,
    worker: Arc<dyn Worker>,
    config: SchedulerConfig,
) -> (
    Scheduler,
    Arc<BroadcastEventBus>,
    Arc<WorkspaceStore>,
    Arc<MemoryBlobStore>,
) {
    let registry = TemplateRegistry::from_config(pipeline).expect("templates register");
    let blobs = Arc::new(MemoryBlobStore::new());
    let workspace = Arc::new(WorkspaceStore::new(blobs.clone()));
    let bus = Arc::new(BroadcastEventBus::default());
    let scheduler = Scheduler::new(
        config,
        Arc::new(registry),
        worker,
        workspace.clone(),
        bus.clone(),
    );
    (scheduler, bus, workspace, blobs)
}
