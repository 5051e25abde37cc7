//! Run and job execution state.

use crate::ids::{JobInstanceId, RunId};
use crate::template::JobKind;
use crate::trigger::TriggerContext;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-instance state within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    /// A predecessor did not succeed; about to be skipped.
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Blocked => "blocked",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    /// Overall status from the job table.
    ///
    /// Any non-terminal job keeps the run running. Otherwise a cancelled run
    /// reports `cancelled`, and a run succeeds iff every job that was neither
    /// skipped nor cancelled succeeded.
    pub fn summarize<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>, cancelled: bool) -> Self {
        let mut failed = false;
        for job in jobs {
            match job.state {
                JobState::Succeeded | JobState::Skipped | JobState::Cancelled => {}
                JobState::Failed => failed = true,
                _ => return RunStatus::Running,
            }
        }
        if cancelled {
            RunStatus::Cancelled
        } else if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StateTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Execution record of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub job: JobInstanceId,
    pub job_name: String,
    pub kind: JobKind,
    pub state: JobState,
    pub history: Vec<StateTransition>,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job: JobInstanceId, job_name: impl Into<String>, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            job,
            job_name: job_name.into(),
            kind,
            state: JobState::Pending,
            history: vec![StateTransition {
                state: JobState::Pending,
                at: now,
            }],
            attempts: 0,
            exit_code: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `state`, recording the transition. Terminal states are final.
    pub fn transition(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() || self.state == state {
            return false;
        }
        let now = Utc::now();
        if state == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if state.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = state;
        self.history.push(StateTransition { state, at: now });
        true
    }

    pub fn fail(&mut self, error: impl fmt::Display) -> bool {
        self.error = Some(error.to_string());
        self.transition(JobState::Failed)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Whether the job ever entered `state`.
    pub fn visited(&self, state: JobState) -> bool {
        self.history.iter().any(|t| t.state == state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CancelReason {
    pub message: String,
    pub cancelled_at: DateTime<Utc>,
}

impl CancelReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow: String,
    pub context: TriggerContext,
    pub status: RunStatus,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// In topological order.
    pub jobs: Vec<JobRecord>,
}

impl RunSnapshot {
    pub fn job(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.job.as_str() == id)
    }

    pub fn state_of(&self, id: &str) -> Option<JobState> {
        self.job(id).map(|j| j.state)
    }

    /// All records sharing a logical job name (parallel shards, matrix cells).
    pub fn jobs_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.jobs.iter().filter(move |j| j.job_name == name)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, state: JobState) -> JobRecord {
        let mut r = JobRecord::new(JobInstanceId::new(id), id, JobKind::Build);
        r.transition(state);
        r
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut r = record("build", JobState::Running);
        assert!(r.started_at.is_some());
        assert!(r.transition(JobState::Succeeded));
        assert!(r.completed_at.is_some());
        assert!(!r.transition(JobState::Failed));
        assert_eq!(r.state, JobState::Succeeded);
        let states: Vec<_> = r.history.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![JobState::Pending, JobState::Running, JobState::Succeeded]
        );
    }

    #[test]
    fn test_fail_records_error() {
        let mut r = record("build", JobState::Running);
        r.fail("exit 2");
        assert_eq!(r.state, JobState::Failed);
        assert_eq!(r.error.as_deref(), Some("exit 2"));
    }

    #[test]
    fn test_summarize() {
        let ok = [
            record("a", JobState::Succeeded),
            record("b", JobState::Skipped),
        ];
        assert_eq!(RunStatus::summarize(&ok, false), RunStatus::Succeeded);

        let failed = [
            record("a", JobState::Failed),
            record("b", JobState::Skipped),
        ];
        assert_eq!(RunStatus::summarize(&failed, false), RunStatus::Failed);

        let running = [
            record("a", JobState::Succeeded),
            record("b", JobState::Running),
        ];
        assert_eq!(RunStatus::summarize(&running, false), RunStatus::Running);

        let cancelled = [
            record("a", JobState::Succeeded),
            record("b", JobState::Cancelled),
        ];
        assert_eq!(RunStatus::summarize(&cancelled, true), RunStatus::Cancelled);
    }
}
