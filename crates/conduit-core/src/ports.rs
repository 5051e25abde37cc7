//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! collaborators it drives: workers that run steps, the blob store that holds
//! workspace bytes, and the event bus.

use crate::artifact::{MaterializedArtifact, ProducedFile};
use crate::events::Event;
use crate::ids::*;
use crate::template::{ParameterBindings, ResolvedStep};
use crate::trigger::TriggerContext;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    ///
    /// Events arrive one at a time in the order they were produced. A slow
    /// publish delays later events but never the runs that produced them.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `run.*.job.>`, `approval.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Everything a worker needs to run one job instance.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub job: JobInstanceId,
    pub job_name: String,
    pub steps: Vec<ResolvedStep>,
    pub parameters: ParameterBindings,
    pub parallel_index: u32,
    pub parallel_total: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    pub context: TriggerContext,
    pub resource_class: Option<String>,
    /// Workspace files to place before the first step.
    pub attachments: Vec<MaterializedArtifact>,
}

impl ExecutionRequest {
    /// Environment exported to steps.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("CONDUIT_RUN_ID".to_string(), self.run_id.to_string()),
            ("CONDUIT_JOB".to_string(), self.job.to_string()),
            ("CONDUIT_JOB_NAME".to_string(), self.job_name.clone()),
            (
                "CONDUIT_NODE_INDEX".to_string(),
                self.parallel_index.saturating_sub(1).to_string(),
            ),
            (
                "CONDUIT_NODE_TOTAL".to_string(),
                self.parallel_total.to_string(),
            ),
            ("CONDUIT_ATTEMPT".to_string(), self.attempt.to_string()),
            ("CONDUIT_REF".to_string(), self.context.git_ref.clone()),
        ];
        match self.context.ref_kind {
            crate::trigger::RefKind::Branch => {
                env.push(("CONDUIT_BRANCH".to_string(), self.context.git_ref.clone()))
            }
            crate::trigger::RefKind::Tag => {
                env.push(("CONDUIT_TAG".to_string(), self.context.git_ref.clone()))
            }
        }
        env
    }

    /// `persist_to_workspace` directives in step order.
    pub fn persist_directives(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.steps.iter().filter_map(|s| match s {
            ResolvedStep::PersistToWorkspace { root, paths } => {
                Some((root.as_str(), paths.as_slice()))
            }
            _ => None,
        })
    }
}

/// What a worker reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    pub exit_code: i32,
    /// Files collected for `persist_to_workspace`, relative to their root.
    pub produced: Vec<ProducedFile>,
}

impl WorkerOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code,
            produced: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.produced.push(ProducedFile::new(path, contents));
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes the steps of one job instance.
///
/// Implementations should stop promptly once `cancel` fires. A returned
/// `Err` is a worker failure (retryable); a nonzero exit code is a job
/// failure (not retried).
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput>;
}

/// Key-addressable blob storage for workspace bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Ancestry relation of a run's job instances.
pub trait Lineage: Send + Sync {
    /// Whether `descendant` is reachable from `ancestor` along `requires` edges.
    fn is_ancestor(&self, ancestor: &JobInstanceId, descendant: &JobInstanceId) -> bool;

    /// Topological position of a job, for deterministic ordering.
    fn position(&self, job: &JobInstanceId) -> Option<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(index: u32, total: u32) -> ExecutionRequest {
        ExecutionRequest {
            run_id: RunId::new(),
            job: JobInstanceId::new(format!("test-{}", index)),
            job_name: "test".to_string(),
            steps: vec![
                ResolvedStep::Run {
                    name: "Test".into(),
                    command: "cargo test".into(),
                },
                ResolvedStep::PersistToWorkspace {
                    root: "target".into(),
                    paths: vec!["report.xml".into()],
                },
            ],
            parameters: ParameterBindings::new(),
            parallel_index: index,
            parallel_total: total,
            attempt: 1,
            context: TriggerContext::tag("v1.0.0"),
            resource_class: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_env_exports_shard_and_ref() {
        let env = request(2, 3).env();
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("CONDUIT_NODE_INDEX"), Some("1"));
        assert_eq!(get("CONDUIT_NODE_TOTAL"), Some("3"));
        assert_eq!(get("CONDUIT_TAG"), Some("v1.0.0"));
        assert_eq!(get("CONDUIT_BRANCH"), None);
    }

    #[test]
    fn test_persist_directives() {
        let req = request(1, 1);
        let directives: Vec<_> = req.persist_directives().collect();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].0, "target");
    }

    #[test]
    fn test_worker_output() {
        assert!(WorkerOutput::success().is_success());
        let out = WorkerOutput::failure(3).with_file("a.txt", "x");
        assert!(!out.is_success());
        assert_eq!(out.produced.len(), 1);
    }
}
