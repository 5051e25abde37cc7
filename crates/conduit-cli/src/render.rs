//! Terminal rendering of plans and run summaries.

use conduit_core::run::{JobRecord, JobState, RunSnapshot, RunStatus};
use conduit_core::template::JobKind;
use conduit_core::workflow::JobInstance;
use conduit_scheduler::Workflow;
use console::{StyledObject, style};

pub fn job_state(state: JobState) -> StyledObject<&'static str> {
    let s = style(state.as_str());
    match state {
        JobState::Succeeded => s.green(),
        JobState::Failed => s.red(),
        JobState::Cancelled => s.red().dim(),
        JobState::Skipped | JobState::Blocked => s.dim(),
        JobState::Running => s.cyan(),
        JobState::Pending | JobState::Ready => s,
    }
}

pub fn run_status(status: RunStatus) -> StyledObject<String> {
    let s = style(status.to_string()).bold();
    match status {
        RunStatus::Succeeded => s.green(),
        RunStatus::Failed | RunStatus::Cancelled => s.red(),
        RunStatus::Running => s.cyan(),
    }
}

fn kind_label(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Build => "build",
        JobKind::Approval => "approval",
        JobKind::AlwaysRun => "always-run",
    }
}

pub fn format_duration(ms: i64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

fn plan_line(job: &JobInstance, width: usize) -> String {
    let mark = if job.admitted {
        style("●").green()
    } else {
        style("○").dim()
    };
    let mut line = format!("  {} {:<width$}", mark, job.id.as_str(), width = width);
    if job.kind != JobKind::Build {
        line.push_str(&format!(" [{}]", kind_label(job.kind)));
    }
    if job.parallel_total > 1 {
        line.push_str(&format!(" shard {}/{}", job.parallel_index, job.parallel_total));
    }
    if !job.requires.is_empty() {
        let requires: Vec<_> = job.requires.iter().map(|r| r.as_str()).collect();
        line.push_str(&format!(" <- {}", requires.join(", ")));
    }
    if !job.admitted {
        line.push_str(&format!(" {}", style("(filtered)").dim()));
    }
    line
}

/// Instances in dispatch order, one per line.
pub fn plan(workflow: &Workflow) -> String {
    let width = workflow
        .instances()
        .map(|j| j.id.as_str().len())
        .max()
        .unwrap_or(0);
    let mut out = format!(
        "{} {} ({}, {} of {} jobs admitted)\n",
        style("Workflow").bold(),
        style(workflow.name()).cyan(),
        workflow.context(),
        workflow.admitted_count(),
        workflow.len()
    );
    for job in workflow.instances() {
        out.push_str(&plan_line(job, width));
        out.push('\n');
    }
    out
}

fn summary_line(job: &JobRecord, width: usize) -> String {
    let mut line = format!(
        "  {:<width$} {:<10}",
        job.job.as_str(),
        job_state(job.state).to_string(),
        width = width
    );
    if let Some(ms) = job.duration_ms() {
        line.push_str(&format!(" {:>8}", format_duration(ms)));
    }
    if job.attempts > 1 {
        line.push_str(&format!(" ({} attempts)", job.attempts));
    }
    if let Some(error) = &job.error {
        line.push_str(&format!(" {}", style(error).red()));
    }
    line
}

/// Per-job outcome table followed by the run status.
pub fn summary(snapshot: &RunSnapshot) -> String {
    let width = snapshot
        .jobs
        .iter()
        .map(|j| j.job.as_str().len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for job in &snapshot.jobs {
        out.push_str(&summary_line(job, width));
        out.push('\n');
    }
    out.push_str(&format!(
        "\nRun {} {}",
        style(snapshot.run_id).dim(),
        run_status(snapshot.status)
    ));
    if let Some(reason) = &snapshot.cancel_reason {
        out.push_str(&format!(": {}", reason.message));
    }
    out.push('\n');
    out
}
