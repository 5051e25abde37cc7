//! Conduit CLI entrypoint.

use clap::Parser;

mod commands;
mod config;
mod handlers;
mod render;

use commands::{Commands, ConfigCommands};
use config::CliConfig;
use conduit_trace::{LogFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about = "Conduit workflow runner", long_about = None)]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();

    // Job output is printed by the run handler, not logged.
    let tracing = TracingConfig::default()
        .with_format(cli.log_format.unwrap_or(config.log_format))
        .with_default_filter("warn,conduit::job=off");
    conduit_trace::init_tracing(&tracing)?;

    match cli.command {
        Commands::Init { path } => handlers::init(&path)?,
        Commands::Validate { path } => handlers::validate(&config.pipeline_path(path))?,
        Commands::Plan(args) => handlers::plan(&config, args)?,
        Commands::Run(args) => handlers::run(&config, args).await?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
            ConfigCommands::Path => handlers::config_path()?,
        },
    }

    Ok(())
}
