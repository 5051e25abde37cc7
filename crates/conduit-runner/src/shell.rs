//! Shell-based job execution on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig};
use crate::workdir::JobDirectory;
use async_trait::async_trait;
use conduit_core::ports::{ExecutionRequest, Worker, WorkerOutput};
use conduit_core::template::ResolvedStep;
use conduit_core::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs each `run` step with `<shell> -c` in a fresh job directory.
pub struct ShellWorker {
    config: RunnerConfig,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

impl ShellWorker {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            output_tx: None,
        }
    }

    /// Also forward every output line to `tx`.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    fn environment(&self, request: &ExecutionRequest) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env.extend(self.config.env.clone());
        env.extend(request.env());
        env
    }

    async fn run_step(
        &self,
        request: &ExecutionRequest,
        workdir: &JobDirectory,
        env: &HashMap<String, String>,
        name: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let start = std::time::Instant::now();
        info!(step = %name, workspace = %workdir.path().display(), "Executing shell command");

        let mut child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .current_dir(workdir.path())
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::WorkerFailed(format!("failed to spawn '{}': {}", self.config.shell, e)))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| self.stream(request, name, OutputStream::Stdout, out));
        let stderr = child
            .stderr
            .take()
            .map(|err| self.stream(request, name, OutputStream::Stderr, err));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                warn!(step = %name, "cancelled, killing process");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill process");
                }
                return Err(Error::WorkerFailed(format!("step '{}' cancelled", name)));
            }
        };

        for handle in [stdout, stderr].into_iter().flatten() {
            let _ = handle.await;
        }

        let status = status.map_err(|e| Error::WorkerFailed(format!("failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);
        debug!(
            step = %name,
            exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command completed"
        );
        Ok(exit_code)
    }

    fn stream<R>(
        &self,
        request: &ExecutionRequest,
        step: &str,
        stream: OutputStream,
        reader: R,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.output_tx.clone();
        let job = request.job.to_string();
        let step = step.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut line_number = 0u32;
            while let Ok(Some(line)) = lines.next_line().await {
                line_number += 1;
                match stream {
                    OutputStream::Stdout => info!(target: "conduit::job", job = %job, step = %step, "{}", line),
                    OutputStream::Stderr => warn!(target: "conduit::job", job = %job, step = %step, "{}", line),
                }
                if let Some(tx) = &tx {
                    let output = OutputLine {
                        job: job.clone(),
                        step: step.clone(),
                        stream,
                        content: line,
                        line_number,
                        timestamp: chrono::Utc::now(),
                    };
                    if tx.send(output).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

impl Default for ShellWorker {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl Worker for ShellWorker {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput> {
        let workdir = JobDirectory::create(
            self.config.work_root.as_deref(),
            request.run_id,
            &request.job,
            request.attempt,
            self.config.keep_workdirs,
        )
        .await?;
        workdir.materialize(&request.attachments).await?;
        let env = self.environment(request);

        let mut output = WorkerOutput::success();
        for step in &request.steps {
            match step {
                ResolvedStep::Run { name, command } => {
                    let exit_code = self
                        .run_step(request, &workdir, &env, name, command, &cancel)
                        .await?;
                    if exit_code != 0 {
                        warn!(step = %name, exit_code, "step failed");
                        return Ok(WorkerOutput::failure(exit_code));
                    }
                }
                ResolvedStep::PersistToWorkspace { root, paths } => {
                    match workdir.collect(root, paths).await {
                        Ok(files) => output.produced.extend(files),
                        // Missing or escaping paths fail the job, they are not retried.
                        Err(e) => {
                            warn!(root = %root, error = %e, "persist_to_workspace failed");
                            return Ok(WorkerOutput::failure(1));
                        }
                    }
                }
                ResolvedStep::AttachWorkspace { .. } => {}
            }
        }
        Ok(output)
    }
}
