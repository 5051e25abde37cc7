//! Span creation for workflow runs and jobs.

use tracing::{Level, Span, span};

/// Attributes recorded on Conduit spans.
#[derive(Debug, Default, Clone)]
pub struct CiAttributes {
    pub workflow: Option<String>,
    pub run_id: Option<String>,
    pub job: Option<String>,
    pub job_name: Option<String>,
    pub shard_index: Option<u32>,
    pub shard_total: Option<u32>,
    pub attempt: Option<u32>,
    pub git_ref: Option<String>,
    pub ref_kind: Option<String>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow(mut self, name: impl Into<String>) -> Self {
        self.workflow = Some(name.into());
        self
    }

    pub fn run(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn job(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.job = Some(id.into());
        self.job_name = Some(name.into());
        self
    }

    pub fn shard(mut self, index: u32, total: u32) -> Self {
        self.shard_index = Some(index);
        self.shard_total = Some(total);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn vcs(mut self, git_ref: impl Into<String>, kind: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self.ref_kind = Some(kind.into());
        self
    }
}

/// Span covering a whole workflow run.
pub fn run_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "run.execute",
        ci.workflow = attrs.workflow.as_deref().unwrap_or(""),
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        vcs.ref = attrs.git_ref.as_deref().unwrap_or(""),
        vcs.ref_kind = attrs.ref_kind.as_deref().unwrap_or(""),
    )
}

/// Span covering one job instance, across its attempts.
pub fn job_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "job.execute",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.job.id = attrs.job.as_deref().unwrap_or(""),
        ci.job.name = attrs.job_name.as_deref().unwrap_or(""),
        ci.job.shard = attrs.shard_index.unwrap_or(1),
        ci.job.shards = attrs.shard_total.unwrap_or(1),
        ci.job.attempt = attrs.attempt.unwrap_or(1),
    )
}

pub fn approval_span(run_id: &str, job: &str) -> Span {
    span!(
        Level::INFO,
        "approval.resolve",
        ci.run.id = run_id,
        ci.job.id = job,
    )
}

/// Span for workspace store operations.
pub fn workspace_span(operation: &str, job: &str) -> Span {
    span!(
        Level::DEBUG,
        "workspace.operation",
        operation = operation,
        ci.job.id = job,
    )
}
