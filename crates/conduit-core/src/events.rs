//! Events emitted while runs progress.

use crate::ids::*;
use crate::run::{JobState, RunStatus};
use crate::trigger::TriggerContext;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events in Conduit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunCreated(RunCreatedPayload),
    RunCancelled(RunCancelledPayload),
    RunCompleted(RunCompletedPayload),

    // Job lifecycle
    JobStateChanged(JobStateChangedPayload),

    // Approval
    ApprovalRequested(ApprovalRequestedPayload),
    ApprovalGranted(ApprovalGrantedPayload),

    // Workspace
    ArtifactPersisted(ArtifactPersistedPayload),
}

/// Subject tokens are dot-separated, so dots inside names are replaced.
fn token(s: &str) -> String {
    s.replace(['.', ' ', '*', '>'], "_")
}

impl Event {
    /// Returns the bus subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::RunCreated(p) => format!("run.created.{}", p.run_id),
            Event::RunCancelled(p) => format!("run.cancelled.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::JobStateChanged(p) => {
                format!("run.{}.job.{}.{}", p.run_id, token(p.job.as_str()), p.state)
            }
            Event::ApprovalRequested(p) => {
                format!("approval.requested.{}.{}", p.run_id, token(p.job.as_str()))
            }
            Event::ApprovalGranted(p) => {
                format!("approval.granted.{}.{}", p.run_id, token(p.job.as_str()))
            }
            Event::ArtifactPersisted(p) => {
                format!("workspace.persisted.{}.{}", p.run_id, token(p.producer.as_str()))
            }
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunCreated(p) => p.run_id,
            Event::RunCancelled(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::JobStateChanged(p) => p.run_id,
            Event::ApprovalRequested(p) => p.run_id,
            Event::ApprovalGranted(p) => p.run_id,
            Event::ArtifactPersisted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCreatedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub context: TriggerContext,
    pub jobs: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub reason: String,
    pub cancelled_jobs: usize,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStateChangedPayload {
    pub run_id: RunId,
    pub job: JobInstanceId,
    pub state: JobState,
    pub attempt: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRequestedPayload {
    pub run_id: RunId,
    pub gate_id: ApprovalGateId,
    pub job: JobInstanceId,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalGrantedPayload {
    pub run_id: RunId,
    pub gate_id: ApprovalGateId,
    pub job: JobInstanceId,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactPersistedPayload {
    pub run_id: RunId,
    pub producer: JobInstanceId,
    pub artifacts: usize,
    pub total_bytes: u64,
}
