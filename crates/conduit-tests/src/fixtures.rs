//! Scripted worker and sample pipelines.

use async_trait::async_trait;
use conduit_core::ports::{ExecutionRequest, Worker, WorkerOutput};
use conduit_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the scripted worker does for a job.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// Finish with a nonzero exit code.
    Exit(i32),
    /// Fail every attempt with a worker error.
    WorkerError,
    /// Fail the first `n` attempts with a worker error, then succeed.
    Flaky(u32),
    /// Run until cancelled.
    Hang,
    /// Ignore cancellation and succeed after this long.
    Stubborn(Duration),
    /// Succeed and report these files for persisting.
    Produce(Vec<(String, Vec<u8>)>),
}

/// One call to [`ScriptedWorker::execute`].
#[derive(Debug, Clone)]
pub struct Call {
    pub job: String,
    pub attempt: u32,
    pub parallel_index: u32,
    pub parallel_total: u32,
    pub resource_class: Option<String>,
    /// Paths of the attached workspace files.
    pub attachments: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Default)]
struct Tracker {
    calls: Vec<Call>,
    running: usize,
    peak: usize,
    running_by_class: HashMap<String, usize>,
    peak_by_class: HashMap<String, usize>,
    finished: Vec<String>,
}

/// Worker driven by a per-job script, recording every call.
///
/// Behaviors are looked up by job instance id first, then by logical job
/// name; jobs without one succeed.
pub struct ScriptedWorker {
    behaviors: HashMap<String, Behavior>,
    delay: Duration,
    tracker: Mutex<Tracker>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delay: Duration::ZERO,
            tracker: Mutex::new(Tracker::default()),
        }
    }

    pub fn on(mut self, job: impl Into<String>, behavior: Behavior) -> Self {
        self.behaviors.insert(job.into(), behavior);
        self
    }

    /// Time every call spends "working" before its behavior applies.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn behavior(&self, request: &ExecutionRequest) -> Behavior {
        self.behaviors
            .get(request.job.as_str())
            .or_else(|| self.behaviors.get(&request.job_name))
            .cloned()
            .unwrap_or(Behavior::Succeed)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.tracker.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, job: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.job == job).collect()
    }

    /// Job ids in the order they started (one entry per attempt).
    pub fn started(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.job).collect()
    }

    /// Job ids in the order their attempts returned.
    pub fn finished(&self) -> Vec<String> {
        self.tracker.lock().unwrap().finished.clone()
    }

    /// Most jobs observed executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.tracker.lock().unwrap().peak
    }

    pub fn peak_for_class(&self, class: &str) -> usize {
        self.tracker
            .lock()
            .unwrap()
            .peak_by_class
            .get(class)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, request: &ExecutionRequest) {
        let mut tracker = self.tracker.lock().unwrap();
        tracker.calls.push(Call {
            job: request.job.to_string(),
            attempt: request.attempt,
            parallel_index: request.parallel_index,
            parallel_total: request.parallel_total,
            resource_class: request.resource_class.clone(),
            attachments: request.attachments.iter().map(|a| a.path.clone()).collect(),
            env: request.env(),
        });
        tracker.running += 1;
        tracker.peak = tracker.peak.max(tracker.running);
        if let Some(class) = &request.resource_class {
            let running = {
                let running = tracker.running_by_class.entry(class.clone()).or_insert(0);
                *running += 1;
                *running
            };
            let peak = tracker.peak_by_class.entry(class.clone()).or_insert(0);
            *peak = (*peak).max(running);
        }
    }

    fn exit(&self, request: &ExecutionRequest) {
        let mut tracker = self.tracker.lock().unwrap();
        tracker.running -= 1;
        if let Some(class) = &request.resource_class {
            if let Some(running) = tracker.running_by_class.get_mut(class) {
                *running -= 1;
            }
        }
        tracker.finished.push(request.job.to_string());
    }

    async fn perform(&self, request: &ExecutionRequest, cancel: &CancellationToken) -> Result<WorkerOutput> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::WorkerFailed(format!("{} cancelled", request.job)));
                }
            }
        }
        match self.behavior(request) {
            Behavior::Succeed => Ok(WorkerOutput::success()),
            Behavior::Exit(code) => Ok(WorkerOutput::failure(code)),
            Behavior::WorkerError => Err(Error::WorkerFailed(format!("{} lost its worker", request.job))),
            Behavior::Flaky(failures) if request.attempt <= failures => Err(Error::WorkerFailed(
                format!("{} attempt {} lost its worker", request.job, request.attempt),
            )),
            Behavior::Flaky(_) => Ok(WorkerOutput::success()),
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(Error::WorkerFailed(format!("{} cancelled", request.job)))
            }
            Behavior::Stubborn(duration) => {
                tokio::time::sleep(duration).await;
                Ok(WorkerOutput::success())
            }
            Behavior::Produce(files) => Ok(files
                .into_iter()
                .fold(WorkerOutput::success(), |out, (path, contents)| {
                    out.with_file(path, contents)
                })),
        }
    }
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput> {
        self.enter(request);
        let result = self.perform(request, &cancel).await;
        self.exit(request);
        result
    }
}

/// Sample pipeline documents.
pub struct PipelineFixture;

impl PipelineFixture {
    /// `build -> test (x3) -> deploy`; `checks` pairs `build` with an
    /// unrelated `lint`.
    pub const FAN_OUT: &'static str = r#"
jobs:
  build:
    steps:
      - run: make
      - persist_to_workspace:
          root: out
          paths: [app]
  lint:
    steps:
      - attach_workspace:
          at: ws
      - run: make lint
  test:
    parallelism: 3
    steps:
      - attach_workspace:
          at: ws
      - run: make test
  deploy:
    steps:
      - attach_workspace:
          at: /srv
      - run: make deploy
workflows:
  ci:
    jobs:
      - build
      - test:
          requires: [build]
      - deploy:
          requires: [test]
  checks:
    jobs:
      - build
      - lint
"#;

    /// Branch and tag filters on a release pipeline.
    pub const RELEASE: &'static str = r#"
jobs:
  build:
    steps:
      - run: make
  deploy:
    steps:
      - run: make deploy
  publish:
    steps:
      - run: make publish
workflows:
  release:
    jobs:
      - build
      - deploy:
          requires: [build]
          filters:
            branches:
              only: main
      - publish:
          requires: [build]
          filters:
            tags:
              only: /^v\d+\.\d+\.\d+$/
  tags-only:
    jobs:
      - publish:
          filters:
            tags:
              only: /^v.*/
"#;

    /// `build -> hold (approval) -> deploy`, with an always-run `cleanup`.
    pub const GATED: &'static str = r#"
jobs:
  build:
    steps:
      - run: make
  deploy:
    steps:
      - run: make deploy
  cleanup:
    type: always-run
    steps:
      - run: make clean
  notify:
    steps:
      - run: ./notify.sh
workflows:
  gated:
    jobs:
      - build
      - hold:
          type: approval
          requires: [build]
      - deploy:
          requires: [hold]
  cleanup:
    jobs:
      - build
      - notify:
          requires: [build]
      - cleanup:
          requires: [build]
"#;

    /// Independent jobs sharing resource classes.
    pub const WIDE: &'static str = r#"
jobs:
  small:
    parallelism: 4
    steps:
      - run: make small
  large:
    resource_class: large
    parallelism: 3
    steps:
      - run: make large
workflows:
  wide:
    jobs:
      - small
      - large
"#;
}
