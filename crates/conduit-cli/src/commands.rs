//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter pipeline file
    Init {
        #[arg(default_value = "conduit.yaml")]
        path: PathBuf,
    },

    /// Validate a pipeline file and every workflow in it
    Validate {
        /// Path to pipeline file
        path: Option<PathBuf>,
    },

    /// Show the job instances a workflow expands to for a ref
    Plan(TargetArgs),

    /// Run a workflow locally
    Run(RunArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Which workflow, for which ref.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Path to pipeline file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Workflow name; optional when the file declares exactly one
    #[arg(short, long)]
    pub workflow: Option<String>,

    /// Branch being built
    #[arg(short, long, conflicts_with = "tag")]
    pub branch: Option<String>,

    /// Tag being built
    #[arg(short, long)]
    pub tag: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Scheduler configuration file
    #[arg(long)]
    pub scheduler_config: Option<PathBuf>,

    /// Concurrent jobs
    #[arg(short = 'j', long)]
    pub capacity: Option<usize>,

    /// Approve every gate without prompting
    #[arg(long)]
    pub auto_approve: bool,

    /// Keep job directories under this path
    #[arg(long)]
    pub work_root: Option<PathBuf>,

    /// Store workspace blobs on disk instead of in memory
    #[arg(long)]
    pub blob_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Print the configuration file location
    Path,
}
