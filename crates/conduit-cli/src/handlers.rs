//! Command handlers.

use crate::commands::{RunArgs, TargetArgs};
use crate::config::{CliConfig, OutputFormat};
use crate::render;
use anyhow::{Context, bail};
use conduit_core::events::Event;
use conduit_core::ids::RunId;
use conduit_core::pipeline::PipelineConfig;
use conduit_core::ports::{EventBus, EventStream};
use conduit_core::run::{JobState, RunSnapshot};
use conduit_core::trigger::{EventKind, TriggerContext};
use conduit_core::workflow::WorkflowSpec;
use conduit_runner::{OutputLine, OutputStream, RunnerConfig, ShellWorker};
use conduit_scheduler::{
    BroadcastEventBus, Scheduler, SchedulerConfig, TemplateRegistry, TriggerEvaluator,
    WorkflowGraphBuilder,
};
use conduit_workspace::{CompressionType, FilesystemBlobStore, MemoryBlobStore, WorkspaceStore};
use console::style;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STARTER_PIPELINE: &str = r#"version: "1"

commands:
  greet:
    parameters:
      who:
        type: string
        default: world
    steps:
      - run: echo "hello << parameters.who >>"

jobs:
  build:
    steps:
      - greet
      - run: mkdir -p dist && echo built > dist/app.txt
      - persist_to_workspace:
          root: .
          paths: [dist]
  test:
    parallelism: 2
    steps:
      - attach_workspace:
          at: .
      - run: cat dist/app.txt && echo "shard $CONDUIT_NODE_INDEX of $CONDUIT_NODE_TOTAL"

workflows:
  ci:
    jobs:
      - build
      - test:
          requires: [build]
"#;

/// Write a starter pipeline.
pub fn init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }
    std::fs::write(path, STARTER_PIPELINE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineConfig> {
    PipelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn load_scheduler_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    match path {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("loading scheduler config {}", path.display())),
        None => Ok(SchedulerConfig::default()),
    }
}

fn select_workflow(pipeline: &PipelineConfig, name: Option<&str>) -> anyhow::Result<WorkflowSpec> {
    if let Some(name) = name {
        return Ok(pipeline.workflow(name)?);
    }
    let mut specs: Vec<_> = pipeline.workflow_specs().collect();
    match specs.len() {
        0 => bail!("the pipeline declares no workflows"),
        1 => Ok(specs.remove(0)),
        _ => {
            let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
            bail!("several workflows declared, pick one with --workflow: {}", names.join(", "))
        }
    }
}

fn trigger_context(target: &TargetArgs) -> TriggerContext {
    let context = match (&target.tag, &target.branch) {
        (Some(tag), _) => TriggerContext::tag(tag.as_str()),
        (None, Some(branch)) => TriggerContext::branch(branch.as_str()),
        (None, None) => TriggerContext::branch("main"),
    };
    context.with_event(EventKind::Manual)
}

/// Validate a pipeline file and every workflow in it.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let registry = TemplateRegistry::from_config(&pipeline)?;
    let builder = WorkflowGraphBuilder::new(&registry, TriggerEvaluator::default());
    let context = TriggerContext::branch("main");

    let mut invalid = 0;
    for spec in pipeline.workflow_specs() {
        match builder.build(&spec, &context) {
            Ok(workflow) => println!(
                "  {} {} ({} jobs)",
                style("✓").green(),
                spec.name,
                workflow.len()
            ),
            Err(e) => {
                invalid += 1;
                println!("  {} {}: {}", style("✗").red(), spec.name, e);
            }
        }
    }
    if invalid > 0 {
        bail!("{} of {} workflows are invalid", invalid, pipeline.workflows.len());
    }

    println!(
        "{} {} is valid: {} commands, {} jobs, {} workflows",
        style("✓").green(),
        path.display(),
        pipeline.commands.len(),
        registry.len(),
        pipeline.workflows.len()
    );
    Ok(())
}

/// Print the expanded job instances of a workflow.
pub fn plan(config: &CliConfig, args: TargetArgs) -> anyhow::Result<()> {
    let pipeline = load_pipeline(&config.pipeline_path(args.file.clone()))?;
    let registry = TemplateRegistry::from_config(&pipeline)?;
    let scheduler_config = load_scheduler_config(config.scheduler_config.as_deref())?;
    let spec = select_workflow(&pipeline, args.workflow.as_deref())?;
    let context = trigger_context(&args);

    let workflow = WorkflowGraphBuilder::new(
        &registry,
        TriggerEvaluator::new(scheduler_config.filter_policy),
    )
    .build(&spec, &context)?;
    print!("{}", render::plan(&workflow));
    Ok(())
}

/// Run a workflow on this machine.
pub async fn run(config: &CliConfig, args: RunArgs) -> anyhow::Result<()> {
    let pipeline = load_pipeline(&config.pipeline_path(args.target.file.clone()))?;
    let registry = Arc::new(TemplateRegistry::from_config(&pipeline)?);
    let spec = select_workflow(&pipeline, args.target.workflow.as_deref())?;
    let context = trigger_context(&args.target);

    let config_path = args
        .scheduler_config
        .as_deref()
        .or(config.scheduler_config.as_deref());
    let mut scheduler_config = load_scheduler_config(config_path)?;
    if let Some(capacity) = args.capacity {
        scheduler_config = scheduler_config.with_worker_capacity(capacity);
        scheduler_config.validate()?;
    }

    let work_root = args.work_root.clone().or_else(|| config.work_root.clone());
    let mut runner_config = RunnerConfig::default();
    if let Some(root) = &work_root {
        runner_config = runner_config.with_work_root(root).keep_workdirs(true);
    }
    let (output_tx, output_rx) = mpsc::channel(1024);
    let worker = Arc::new(ShellWorker::new(runner_config).with_output(output_tx));

    let workspace = match &args.blob_dir {
        Some(dir) => WorkspaceStore::new(Arc::new(
            FilesystemBlobStore::new(dir.clone()).with_compression(CompressionType::Zstd),
        )),
        None => WorkspaceStore::new(Arc::new(MemoryBlobStore::new())),
    };

    let bus = Arc::new(BroadcastEventBus::default());
    let scheduler = Scheduler::new(
        scheduler_config,
        registry,
        worker,
        Arc::new(workspace),
        bus.clone(),
    );

    println!(
        "{} Running {} on {}",
        style("▶").cyan(),
        style(&spec.name).bold(),
        style(&context).dim()
    );

    let events = bus.subscribe(">").await?;
    let printer = tokio::spawn(print_output(output_rx));
    let Some(run_id) = scheduler.trigger(&spec, context).await? else {
        println!("{} No job admitted for this ref, nothing to run", style("i").blue());
        return Ok(());
    };
    let watcher = tokio::spawn(watch_events(scheduler.clone(), run_id, events, args.auto_approve));

    let snapshot = tokio::select! {
        snapshot = scheduler.wait_for_completion(run_id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            println!("{} Interrupted, cancelling run", style("!").yellow());
            scheduler.cancel_run(run_id, "interrupted").await?;
            scheduler.wait_for_completion(run_id).await?
        }
    };
    watcher.abort();
    // Output of the last job may still be in flight.
    let _ = tokio::time::timeout(Duration::from_millis(250), printer).await;

    print_snapshot(config.output_format, &snapshot)?;
    if !snapshot.status.is_success() {
        bail!("run {} {}", run_id, snapshot.status);
    }
    Ok(())
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        let prefix = style(format!("[{}]", line.job)).dim();
        match line.stream {
            OutputStream::Stdout => println!("{} {}", prefix, line.content),
            OutputStream::Stderr => eprintln!("{} {}", prefix, style(line.content).yellow()),
        }
    }
}

async fn watch_events(
    scheduler: Scheduler,
    run_id: RunId,
    mut events: EventStream,
    auto_approve: bool,
) -> anyhow::Result<()> {
    while let Some(event) = events.next().await {
        match event? {
            Event::JobStateChanged(p) if p.run_id == run_id => {
                if p.state.is_terminal() || p.state == JobState::Running {
                    println!("{} {}", render::job_state(p.state), p.job);
                }
            }
            Event::ApprovalRequested(p) if p.run_id == run_id => {
                let job = p.job.to_string();
                let approved = if auto_approve {
                    true
                } else {
                    let prompt = format!("Approve '{}'?", job);
                    tokio::task::spawn_blocking(move || {
                        dialoguer::Confirm::new()
                            .with_prompt(prompt)
                            .default(false)
                            .interact()
                    })
                    .await??
                };
                if approved {
                    scheduler.approve(run_id, &job, whoami()).await?;
                } else {
                    scheduler
                        .cancel_run(run_id, format!("approval of '{}' declined", job))
                        .await?;
                }
            }
            Event::RunCompleted(p) if p.run_id == run_id => break,
            _ => {}
        }
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}

fn print_snapshot(format: OutputFormat, snapshot: &RunSnapshot) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => print!("{}", render::summary(snapshot)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(snapshot)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(snapshot)?),
    }
    Ok(())
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

/// Print the configuration file location.
pub fn config_path() -> anyhow::Result<()> {
    let path: PathBuf = CliConfig::config_path()?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
jobs:
  build:
    steps:
      - run: make
workflows:
  ci:
    jobs: [build]
  nightly:
    jobs: [build]
"#;

    fn target(branch: Option<&str>, tag: Option<&str>) -> TargetArgs {
        TargetArgs {
            file: None,
            workflow: None,
            branch: branch.map(str::to_string),
            tag: tag.map(str::to_string),
        }
    }

    #[test]
    fn test_trigger_context_defaults_to_main() {
        assert_eq!(
            trigger_context(&target(None, None)),
            TriggerContext::branch("main").with_event(EventKind::Manual)
        );
        assert_eq!(
            trigger_context(&target(None, Some("v1.2.0"))).git_ref,
            "v1.2.0"
        );
    }

    #[test]
    fn test_select_workflow() {
        let pipeline = PipelineConfig::from_yaml(PIPELINE).unwrap();
        assert!(select_workflow(&pipeline, None).is_err());
        assert_eq!(select_workflow(&pipeline, Some("nightly")).unwrap().name, "nightly");
        assert!(select_workflow(&pipeline, Some("weekly")).is_err());
    }

    #[test]
    fn test_init_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.yaml");
        init(&path).unwrap();
        validate(&path).unwrap();

        let pipeline = load_pipeline(&path).unwrap();
        assert_eq!(select_workflow(&pipeline, None).unwrap().name, "ci");
    }
}
