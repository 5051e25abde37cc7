//! Run orchestration: job state machine, dispatch, approvals and cancellation.

use crate::config::SchedulerConfig;
use crate::dag::{Workflow, WorkflowGraphBuilder};
use crate::queue::ReadyQueue;
use crate::registry::TemplateRegistry;
use crate::triggers::TriggerEvaluator;

use chrono::{DateTime, Utc};
use conduit_core::approval::{ApprovalGate, PendingApproval};
use conduit_core::artifact::ProducedFile;
use conduit_core::events::{
    ApprovalGrantedPayload, ApprovalRequestedPayload, ArtifactPersistedPayload, Event,
    JobStateChangedPayload, RunCancelledPayload, RunCompletedPayload, RunCreatedPayload,
};
use conduit_core::ids::{JobInstanceId, RunId};
use conduit_core::ports::{EventBus, ExecutionRequest, Lineage, Worker};
use conduit_core::run::{CancelReason, JobRecord, JobState, RunSnapshot, RunStatus};
use conduit_core::template::ResolvedStep;
use conduit_core::trigger::TriggerContext;
use conduit_core::workflow::{JobInstance, WorkflowSpec};
use conduit_core::{Error, Result};
use conduit_trace::{CiAttributes, approval_span, job_span, run_span};
use conduit_workspace::WorkspaceStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// The workflow scheduler.
///
/// Cheap to clone; all clones drive the same run table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<TemplateRegistry>,
    worker: Arc<dyn Worker>,
    workspace: Arc<WorkspaceStore>,
    /// Ordered hand-off to the publisher task.
    events: mpsc::UnboundedSender<Event>,
    evaluator: TriggerEvaluator,
    state: Mutex<SchedulerState>,
}

/// Everything mutable, behind one lock.
struct SchedulerState {
    runs: HashMap<RunId, RunEntry>,
    queue: ReadyQueue,
    /// Events produced under the lock, queued for publishing in order before
    /// it is released.
    outbox: Vec<Event>,
}

struct RunEntry {
    run_id: RunId,
    workflow: Arc<Workflow>,
    context: TriggerContext,
    records: HashMap<JobInstanceId, JobRecord>,
    gates: HashMap<JobInstanceId, ApprovalGate>,
    cancel: CancellationToken,
    cancel_reason: Option<CancelReason>,
    status: RunStatus,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status_tx: watch::Sender<RunStatus>,
}

/// How one job's execution ended.
#[derive(Debug)]
enum JobOutcome {
    Succeeded,
    Failed { exit_code: i32 },
    /// Worker error or timeout; retryable.
    WorkerError(Error),
    /// Workspace errors and other final failures.
    Errored(Error),
    Cancelled,
}

impl RunEntry {
    fn state_of(&self, job: &JobInstanceId) -> Option<JobState> {
        self.records.get(job).map(|r| r.state)
    }

    fn transition(&mut self, job: &JobInstanceId, state: JobState, outbox: &mut Vec<Event>) -> bool {
        let Some(record) = self.records.get_mut(job) else {
            return false;
        };
        if !record.transition(state) {
            return false;
        }
        debug!(run_id = %self.run_id, job = %job, state = %state, "job state changed");
        outbox.push(Event::JobStateChanged(JobStateChangedPayload {
            run_id: self.run_id,
            job: job.clone(),
            state,
            attempt: record.attempts,
            exit_code: record.exit_code,
            error: record.error.clone(),
            at: Utc::now(),
        }));
        true
    }

    fn fail(
        &mut self,
        job: &JobInstanceId,
        error: &Error,
        exit_code: Option<i32>,
        outbox: &mut Vec<Event>,
    ) -> bool {
        match self.records.get_mut(job) {
            Some(record) if !record.state.is_terminal() => {
                record.exit_code = exit_code;
                record.error = Some(error.to_string());
            }
            _ => return false,
        }
        warn!(run_id = %self.run_id, job = %job, error = %error, "job failed");
        self.transition(job, JobState::Failed, outbox)
    }

    /// Re-evaluate every waiting job in topological order.
    ///
    /// One pass is enough: predecessors are decided before their successors.
    fn advance(&mut self, queue: &mut ReadyQueue, outbox: &mut Vec<Event>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let workflow = Arc::clone(&self.workflow);
        for job in workflow.instances() {
            if !matches!(
                self.state_of(&job.id),
                Some(JobState::Pending | JobState::Blocked)
            ) {
                continue;
            }
            let upstream: Vec<JobState> = job
                .requires
                .iter()
                .filter_map(|id| self.state_of(id))
                .collect();

            if job.is_always_run() {
                if upstream.iter().all(JobState::is_terminal) {
                    self.make_ready(job, queue, outbox);
                }
                continue;
            }

            let doomed = upstream.iter().any(|s| {
                matches!(
                    s,
                    JobState::Failed | JobState::Skipped | JobState::Cancelled
                )
            });
            if doomed {
                self.transition(&job.id, JobState::Blocked, outbox);
                self.transition(&job.id, JobState::Skipped, outbox);
            } else if upstream.iter().all(|s| *s == JobState::Succeeded) {
                self.make_ready(job, queue, outbox);
            }
        }
    }

    fn make_ready(&mut self, job: &JobInstance, queue: &mut ReadyQueue, outbox: &mut Vec<Event>) {
        if !self.transition(&job.id, JobState::Ready, outbox) {
            return;
        }
        if !job.is_approval() {
            queue.enqueue(self.run_id, job.id.clone(), job.resource_class.clone());
            return;
        }

        // Gates hold no worker slot.
        let gate = ApprovalGate::open(self.run_id, job.id.clone());
        self.transition(&job.id, JobState::Running, outbox);
        info!(run_id = %self.run_id, job = %job.id, gate_id = %gate.id, "approval requested");
        outbox.push(Event::ApprovalRequested(ApprovalRequestedPayload {
            run_id: self.run_id,
            gate_id: gate.id,
            job: job.id.clone(),
            opened_at: gate.opened_at,
        }));
        self.gates.insert(job.id.clone(), gate);
    }

    fn finish_job(&mut self, job: &JobInstanceId, outcome: JobOutcome, outbox: &mut Vec<Event>) {
        match outcome {
            JobOutcome::Succeeded => {
                if self.transition(job, JobState::Succeeded, outbox) {
                    info!(run_id = %self.run_id, job = %job, "job succeeded");
                }
            }
            JobOutcome::Failed { exit_code } => {
                self.fail(job, &Error::JobFailed { exit_code }, Some(exit_code), outbox);
            }
            JobOutcome::WorkerError(error) | JobOutcome::Errored(error) => {
                self.fail(job, &error, None, outbox);
            }
            JobOutcome::Cancelled => {
                self.transition(job, JobState::Cancelled, outbox);
            }
        }
    }

    fn check_completion(&mut self, outbox: &mut Vec<Event>) {
        if self.status.is_terminal() {
            return;
        }
        let status = RunStatus::summarize(self.records.values(), self.cancel_reason.is_some());
        if !status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.status_tx.send_replace(status);
        info!(run_id = %self.run_id, workflow = %self.workflow.name(), status = %status, "run completed");
        outbox.push(Event::RunCompleted(RunCompletedPayload {
            run_id: self.run_id,
            status,
            completed_at: now,
        }));
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            workflow: self.workflow.name().to_string(),
            context: self.context.clone(),
            status: self.status,
            cancel_reason: self.cancel_reason.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            jobs: self
                .workflow
                .instances()
                .filter_map(|job| self.records.get(&job.id).cloned())
                .collect(),
        }
    }
}

impl Inner {
    /// Dispatch queued jobs while capacity allows.
    fn pump(self: &Arc<Self>, state: &mut SchedulerState) {
        let SchedulerState { runs, queue, outbox } = state;
        while let Some(queued) = queue.dequeue() {
            let Some(run) = runs.get_mut(&queued.run_id) else {
                queue.release(queued.resource_class.as_deref());
                continue;
            };
            let still_ready = run.state_of(&queued.job) == Some(JobState::Ready);
            let instance = run.workflow.get(&queued.job).cloned();
            let (Some(instance), true, false) = (instance, still_ready, run.cancel.is_cancelled())
            else {
                queue.release(queued.resource_class.as_deref());
                continue;
            };

            if let Some(record) = run.records.get_mut(&instance.id) {
                record.attempts = 1;
            }
            run.transition(&instance.id, JobState::Running, outbox);

            let request = ExecutionRequest {
                run_id: run.run_id,
                job: instance.id.clone(),
                job_name: instance.job_name.clone(),
                steps: instance.steps.clone(),
                parameters: instance.parameters.clone(),
                parallel_index: instance.parallel_index,
                parallel_total: instance.parallel_total,
                attempt: 1,
                context: run.context.clone(),
                resource_class: instance.resource_class.clone(),
                attachments: Vec::new(),
            };
            let cancel = run.cancel.child_token();
            tokio::spawn(Arc::clone(self).execute_job(request, cancel));
        }
    }

    /// Queue the outbox for publishing. Called with the state lock held so
    /// events leave in the order they were produced; the bus itself is only
    /// awaited by the publisher task, never under the lock.
    fn flush(&self, state: &mut SchedulerState) {
        for event in state.outbox.drain(..) {
            self.publish(event);
        }
    }

    fn publish(&self, event: Event) {
        if self.events.send(event).is_err() {
            warn!("event publisher stopped, dropping event");
        }
    }

    async fn execute_job(self: Arc<Self>, request: ExecutionRequest, cancel: CancellationToken) {
        let span = job_span(
            &CiAttributes::new()
                .run(request.run_id.to_string())
                .job(request.job.as_str(), request.job_name.as_str())
                .shard(request.parallel_index, request.parallel_total),
        );
        let run_id = request.run_id;
        let job = request.job.clone();
        let resource_class = request.resource_class.clone();

        let outcome = self
            .run_attempts(request, &cancel)
            .instrument(span)
            .await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.queue.release(resource_class.as_deref());
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.finish_job(&job, outcome, &mut state.outbox);
            run.advance(&mut state.queue, &mut state.outbox);
            run.check_completion(&mut state.outbox);
        }
        self.pump(state);
        self.flush(state);
    }

    async fn run_attempts(&self, mut request: ExecutionRequest, cancel: &CancellationToken) -> JobOutcome {
        let roots: Vec<String> = request
            .steps
            .iter()
            .filter_map(|step| match step {
                ResolvedStep::AttachWorkspace { at } => Some(at.clone()),
                _ => None,
            })
            .collect();
        for root in roots {
            match self.workspace.attach(request.run_id, &request.job, &root).await {
                Ok(mut files) => request.attachments.append(&mut files),
                Err(e) => return JobOutcome::Errored(e),
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        loop {
            match self.attempt(&request, cancel).await {
                JobOutcome::WorkerError(error)
                    if request.attempt < max_attempts && !cancel.is_cancelled() =>
                {
                    warn!(
                        attempt = request.attempt,
                        max_attempts,
                        error = %error,
                        "job attempt failed, retrying"
                    );
                    request.attempt += 1;
                    self.record_attempt(request.run_id, &request.job, request.attempt)
                        .await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn record_attempt(&self, run_id: RunId, job: &JobInstanceId, attempt: u32) {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .runs
            .get_mut(&run_id)
            .and_then(|run| run.records.get_mut(job))
        {
            record.attempts = attempt;
        }
    }

    async fn attempt(&self, request: &ExecutionRequest, cancel: &CancellationToken) -> JobOutcome {
        debug!(attempt = request.attempt, steps = request.steps.len(), "dispatching job");
        let timeout = self.config.job_timeout();
        let execution = self.worker.execute(request, cancel.clone());
        tokio::pin!(execution);

        tokio::select! {
            result = tokio::time::timeout(timeout, &mut execution) => match result {
                Ok(Ok(output)) if output.is_success() => self.persist(request, output.produced).await,
                Ok(Ok(output)) => JobOutcome::Failed { exit_code: output.exit_code },
                Ok(Err(e)) => JobOutcome::WorkerError(e),
                Err(_) => JobOutcome::WorkerError(Error::JobTimeout { seconds: timeout.as_secs() }),
            },
            _ = cancel.cancelled() => {
                let grace = self.config.cancel_grace_period();
                if tokio::time::timeout(grace, &mut execution).await.is_err() {
                    warn!(
                        grace_ms = grace.as_millis() as u64,
                        "worker did not stop within the grace period, dropping it"
                    );
                }
                JobOutcome::Cancelled
            }
        }
    }

    async fn persist(&self, request: &ExecutionRequest, produced: Vec<ProducedFile>) -> JobOutcome {
        if produced.is_empty() {
            return JobOutcome::Succeeded;
        }
        match self
            .workspace
            .persist(request.run_id, &request.job, produced)
            .await
        {
            Ok(artifacts) => {
                let event = Event::ArtifactPersisted(ArtifactPersistedPayload {
                    run_id: request.run_id,
                    producer: request.job.clone(),
                    artifacts: artifacts.len(),
                    total_bytes: artifacts.iter().map(|a| a.size_bytes).sum(),
                });
                self.publish(event);
                JobOutcome::Succeeded
            }
            Err(e) => JobOutcome::Errored(e),
        }
    }
}

/// Publish queued events one at a time until the scheduler is dropped.
async fn publish_events(bus: Arc<dyn EventBus>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        if let Err(e) = bus.publish(event).await {
            warn!(error = %e, "failed to publish event");
        }
    }
}

impl Scheduler {
    /// Must be called within a Tokio runtime; spawns the event publisher.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<TemplateRegistry>,
        worker: Arc<dyn Worker>,
        workspace: Arc<WorkspaceStore>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        let mut queue = ReadyQueue::new(config.worker_capacity);
        for (class, limit) in &config.resource_class_limits {
            queue.set_class_limit(class.clone(), *limit);
        }
        let evaluator = TriggerEvaluator::new(config.filter_policy);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_events(events, events_rx));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                worker,
                workspace,
                events: events_tx,
                evaluator,
                state: Mutex::new(SchedulerState {
                    runs: HashMap::new(),
                    queue,
                    outbox: Vec::new(),
                }),
            }),
        }
    }

    /// Expand a workflow specification for a trigger context.
    pub fn build(&self, spec: &WorkflowSpec, context: &TriggerContext) -> Result<Workflow> {
        WorkflowGraphBuilder::new(&self.inner.registry, self.inner.evaluator).build(spec, context)
    }

    /// Build a workflow and start a run for it. `None` when no job is admitted.
    pub async fn trigger(&self, spec: &WorkflowSpec, context: TriggerContext) -> Result<Option<RunId>> {
        let workflow = self.build(spec, &context)?;
        if !self.inner.evaluator.admits_workflow(&workflow, &context) {
            info!(workflow = %spec.name, context = %context, "no job admitted, not starting a run");
            return Ok(None);
        }
        self.start_run(workflow, context).await
    }

    /// Start a run of a built workflow.
    ///
    /// Jobs the trigger filters exclude are skipped up front. Returns `None`
    /// when nothing is admitted.
    pub async fn start_run(&self, workflow: Workflow, context: TriggerContext) -> Result<Option<RunId>> {
        let evaluator = self.inner.evaluator;
        let admitted: Vec<bool> = workflow
            .instances()
            .map(|job| evaluator.admit(job, &context))
            .collect();
        if !admitted.contains(&true) {
            info!(workflow = %workflow.name(), context = %context, "no job admitted, not starting a run");
            return Ok(None);
        }

        let run_id = RunId::new();
        let span = run_span(
            &CiAttributes::new()
                .workflow(workflow.name())
                .run(run_id.to_string())
                .vcs(context.git_ref.as_str(), context.ref_kind.as_str()),
        );
        self.launch(run_id, Arc::new(workflow), context, admitted)
            .instrument(span)
            .await;
        Ok(Some(run_id))
    }

    async fn launch(
        &self,
        run_id: RunId,
        workflow: Arc<Workflow>,
        context: TriggerContext,
        admitted: Vec<bool>,
    ) {
        let lineage: Arc<dyn Lineage> = workflow.clone();
        self.inner.workspace.open_run(run_id, lineage).await;

        let records = workflow
            .instances()
            .map(|job| {
                (
                    job.id.clone(),
                    JobRecord::new(job.id.clone(), job.job_name.as_str(), job.kind),
                )
            })
            .collect();
        let (status_tx, _) = watch::channel(RunStatus::Running);
        let mut run = RunEntry {
            run_id,
            workflow: Arc::clone(&workflow),
            context: context.clone(),
            records,
            gates: HashMap::new(),
            cancel: CancellationToken::new(),
            cancel_reason: None,
            status: RunStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            status_tx,
        };

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        state.outbox.push(Event::RunCreated(RunCreatedPayload {
            run_id,
            workflow: workflow.name().to_string(),
            context: context.clone(),
            jobs: workflow.len(),
            created_at: run.created_at,
        }));
        for (job, admitted) in workflow.instances().zip(admitted) {
            if !admitted {
                debug!(run_id = %run_id, job = %job.id, "job filtered out for {}", context);
                run.transition(&job.id, JobState::Skipped, &mut state.outbox);
            }
        }
        info!(run_id = %run_id, workflow = %workflow.name(), jobs = workflow.len(), "run started");

        run.advance(&mut state.queue, &mut state.outbox);
        run.check_completion(&mut state.outbox);
        state.runs.insert(run_id, run);
        self.inner.pump(state);
        self.inner.flush(state);
    }

    /// Current per-job table of a run.
    pub async fn run_state(&self, run_id: RunId) -> Result<RunSnapshot> {
        let state = self.inner.state.lock().await;
        state
            .runs
            .get(&run_id)
            .map(RunEntry::snapshot)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run is terminal and return its final state.
    pub async fn wait_for_completion(&self, run_id: RunId) -> Result<RunSnapshot> {
        let mut status = {
            let state = self.inner.state.lock().await;
            state
                .runs
                .get(&run_id)
                .map(|run| run.status_tx.subscribe())
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?
        };
        status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|e| Error::Internal(format!("run status channel closed: {}", e)))?;
        self.run_state(run_id).await
    }

    /// Cancel every non-terminal job of a run. No-op for a finished run.
    pub async fn cancel_run(&self, run_id: RunId, reason: impl Into<String>) -> Result<()> {
        let reason = CancelReason::new(reason);
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "run already finished, ignoring cancel");
            return Ok(());
        }

        run.cancel.cancel();
        let purged = state.queue.purge(run_id);
        let workflow = Arc::clone(&run.workflow);
        let mut cancelled = 0;
        for job in workflow.instances() {
            if run.transition(&job.id, JobState::Cancelled, &mut state.outbox) {
                cancelled += 1;
            }
        }
        let closed_gates = run.gates.values_mut().map(|gate| gate.cancel()).filter(|closed| *closed).count();
        info!(
            run_id = %run_id,
            reason = %reason.message,
            cancelled,
            purged,
            closed_gates,
            "run cancelled"
        );
        state.outbox.push(Event::RunCancelled(RunCancelledPayload {
            run_id,
            reason: reason.message.clone(),
            cancelled_jobs: cancelled,
            cancelled_at: reason.cancelled_at,
        }));
        run.cancel_reason = Some(reason);
        run.check_completion(&mut state.outbox);

        self.inner.pump(state);
        self.inner.flush(state);
        Ok(())
    }

    /// Approve an open gate, letting its dependents proceed.
    pub async fn approve(&self, run_id: RunId, job: &str, actor: impl Into<String>) -> Result<()> {
        let span = approval_span(&run_id.to_string(), job);
        self.resolve_gate(run_id, job, actor.into())
            .instrument(span)
            .await
    }

    async fn resolve_gate(&self, run_id: RunId, job: &str, actor: String) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let instance = run
            .workflow
            .get(&JobInstanceId::new(job))
            .cloned()
            .ok_or_else(|| Error::JobNotFound(job.to_string()))?;
        if !instance.is_approval() {
            return Err(Error::NotAnApprovalGate(job.to_string()));
        }
        let job_state = run.state_of(&instance.id);
        let gate = run
            .gates
            .get_mut(&instance.id)
            .ok_or_else(|| Error::GateNotOpen(job.to_string()))?;
        if !gate.is_pending() {
            return Err(Error::GateAlreadyResolved(job.to_string()));
        }
        if job_state != Some(JobState::Running) {
            return Err(Error::GateNotOpen(job.to_string()));
        }
        gate.approve(actor.as_str())?;
        let granted = ApprovalGrantedPayload {
            run_id,
            gate_id: gate.id,
            job: instance.id.clone(),
            approved_by: actor.clone(),
            approved_at: gate.approved_at.unwrap_or_else(Utc::now),
        };
        info!(run_id = %run_id, job = %instance.id, actor = %actor, waited_s = gate.waited_seconds(), "approval granted");

        state.outbox.push(Event::ApprovalGranted(granted));
        run.transition(&instance.id, JobState::Succeeded, &mut state.outbox);
        run.advance(&mut state.queue, &mut state.outbox);
        run.check_completion(&mut state.outbox);
        self.inner.pump(state);
        self.inner.flush(state);
        Ok(())
    }

    /// Gates of a run awaiting approval, oldest first.
    pub async fn list_pending_approvals(&self, run_id: RunId) -> Result<Vec<PendingApproval>> {
        let state = self.inner.state.lock().await;
        let run = state
            .runs
            .get(&run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let mut pending: Vec<PendingApproval> = run
            .gates
            .values()
            .filter(|gate| gate.is_pending() && run.state_of(&gate.job) == Some(JobState::Running))
            .map(PendingApproval::from)
            .collect();
        pending.sort_by(|a, b| {
            a.opened_at
                .cmp(&b.opened_at)
                .then_with(|| a.job.cmp(&b.job))
        });
        Ok(pending)
    }

    /// Forget a finished run and release its workspace blobs.
    /// Returns the number of blobs deleted.
    pub async fn retire_run(&self, run_id: RunId) -> Result<usize> {
        {
            let mut state = self.inner.state.lock().await;
            let run = state
                .runs
                .get(&run_id)
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
            if !run.status.is_terminal() {
                return Err(Error::RunNotTerminal(run_id.to_string()));
            }
            state.runs.remove(&run_id);
        }
        let dropped = self.inner.workspace.retire(run_id).await?;
        info!(run_id = %run_id, blobs = dropped, "run retired");
        Ok(dropped)
    }

    /// Runs that are still in progress.
    pub async fn active_runs(&self) -> Vec<RunId> {
        let state = self.inner.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .map(|run| run.run_id)
            .collect();
        runs.sort();
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastEventBus;
    use async_trait::async_trait;
    use conduit_core::ports::WorkerOutput;
    use conduit_core::template::{JobTemplate, Step};
    use conduit_core::workflow::JobReference;
    use std::time::Duration;

    /// Fails jobs whose id starts with `fail`, succeeds the rest.
    struct PrefixWorker;

    #[async_trait]
    impl Worker for PrefixWorker {
        async fn execute(
            &self,
            request: &ExecutionRequest,
            _cancel: CancellationToken,
        ) -> Result<WorkerOutput> {
            if request.job.as_str().starts_with("fail") {
                Ok(WorkerOutput::failure(2))
            } else {
                Ok(WorkerOutput::success())
            }
        }
    }

    fn scheduler() -> Scheduler {
        scheduler_with_bus(Arc::new(BroadcastEventBus::default()))
    }

    fn scheduler_with_bus(bus: Arc<dyn EventBus>) -> Scheduler {
        let mut registry = TemplateRegistry::new();
        for name in ["build", "fail", "deploy"] {
            registry
                .register_template(JobTemplate::new(name).step(Step::run("true")))
                .unwrap();
        }
        Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(registry),
            Arc::new(PrefixWorker),
            Arc::new(WorkspaceStore::in_memory()),
            bus,
        )
    }

    /// Bus whose `publish` blocks until a permit is released.
    struct StalledBus {
        permits: tokio::sync::Semaphore,
        published: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventBus for StalledBus {
        async fn publish(&self, event: Event) -> Result<()> {
            self.permits
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
            self.published.lock().unwrap().push(event.subject());
            Ok(())
        }

        async fn subscribe(&self, _pattern: &str) -> Result<conduit_core::ports::EventStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    async fn finish(scheduler: &Scheduler, run_id: RunId) -> RunSnapshot {
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_for_completion(run_id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_run_succeeds() {
        let scheduler = scheduler();
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build"))
            .job(JobReference::new("deploy").requires(&["build"]));
        let run_id = scheduler
            .trigger(&spec, TriggerContext::branch("main"))
            .await
            .unwrap()
            .unwrap();

        let snapshot = finish(&scheduler, run_id).await;
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(snapshot.state_of("deploy"), Some(JobState::Succeeded));
        assert_eq!(snapshot.job("build").unwrap().attempts, 1);
        assert!(scheduler.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_skips_successors() {
        let scheduler = scheduler();
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("fail"))
            .job(JobReference::new("deploy").requires(&["fail"]));
        let run_id = scheduler
            .trigger(&spec, TriggerContext::branch("main"))
            .await
            .unwrap()
            .unwrap();

        let snapshot = finish(&scheduler, run_id).await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        let failed = snapshot.job("fail").unwrap();
        assert_eq!(failed.exit_code, Some(2));
        assert!(failed.error.is_some());
        let deploy = snapshot.job("deploy").unwrap();
        assert_eq!(deploy.state, JobState::Skipped);
        assert!(deploy.visited(JobState::Blocked));
        assert!(!deploy.visited(JobState::Running));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let scheduler = scheduler();
        let missing = RunId::new();
        assert!(matches!(
            scheduler.run_state(missing).await,
            Err(Error::RunNotFound(_))
        ));
        assert!(matches!(
            scheduler.cancel_run(missing, "nope").await,
            Err(Error::RunNotFound(_))
        ));
        assert!(matches!(
            scheduler.retire_run(missing).await,
            Err(Error::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_bus_does_not_block_runs() {
        let bus = Arc::new(StalledBus {
            permits: tokio::sync::Semaphore::new(0),
            published: std::sync::Mutex::new(Vec::new()),
        });
        let scheduler = scheduler_with_bus(bus.clone());
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build"))
            .job(JobReference::new("deploy").requires(&["build"]));
        let run_id = scheduler
            .trigger(&spec, TriggerContext::branch("main"))
            .await
            .unwrap()
            .unwrap();

        let snapshot = finish(&scheduler, run_id).await;
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert!(bus.published.lock().unwrap().is_empty());

        // Once the bus moves again, events arrive in the order they happened.
        bus.permits.add_permits(64);
        let completed = format!("run.completed.{}", run_id);
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.published.lock().unwrap().last() != Some(&completed) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let published = bus.published.lock().unwrap().clone();
        assert_eq!(published[0], format!("run.created.{}", run_id));
        assert_eq!(published.iter().filter(|s| s.starts_with("run.completed")).count(), 1);
    }
}
