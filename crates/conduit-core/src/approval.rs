//! Manual approval gates.

use crate::ids::{ApprovalGateId, JobInstanceId, RunId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Approval gate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    /// The run was cancelled while the gate was open.
    Cancelled,
}

/// An open or resolved gate for one approval job of one run.
///
/// A gate is opened when its job becomes ready and is resolved exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalGate {
    pub id: ApprovalGateId,
    pub run_id: RunId,
    pub job: JobInstanceId,
    pub status: ApprovalStatus,
    pub opened_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ApprovalGate {
    pub fn open(run_id: RunId, job: JobInstanceId) -> Self {
        Self {
            id: ApprovalGateId::new(),
            run_id,
            job,
            status: ApprovalStatus::Pending,
            opened_at: Utc::now(),
            approved_by: None,
            approved_at: None,
            cancelled_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Record an approval. A gate resolves once; later calls fail.
    pub fn approve(&mut self, actor: impl Into<String>) -> Result<()> {
        if !self.is_pending() {
            return Err(Error::GateAlreadyResolved(self.job.to_string()));
        }
        self.status = ApprovalStatus::Approved;
        self.approved_by = Some(actor.into());
        self.approved_at = Some(Utc::now());
        Ok(())
    }

    /// Close a pending gate without approval. Returns whether it was pending.
    pub fn cancel(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ApprovalStatus::Cancelled;
        self.cancelled_at = Some(Utc::now());
        true
    }

    /// Seconds the gate has been (or was) waiting.
    pub fn waited_seconds(&self) -> i64 {
        let end = self
            .approved_at
            .or(self.cancelled_at)
            .unwrap_or_else(Utc::now);
        (end - self.opened_at).num_seconds()
    }
}

/// An open gate as reported to approvers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PendingApproval {
    pub gate_id: ApprovalGateId,
    pub run_id: RunId,
    pub job: JobInstanceId,
    pub opened_at: DateTime<Utc>,
}

impl From<&ApprovalGate> for PendingApproval {
    fn from(gate: &ApprovalGate) -> Self {
        Self {
            gate_id: gate.id,
            run_id: gate.run_id,
            job: gate.job.clone(),
            opened_at: gate.opened_at,
        }
    }
}
