//! Runner configuration and output types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job: String,
    pub step: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for the shell worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Interpreter invoked as `<shell> -c <command>`.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Parent of per-job working directories; a temp dir when unset.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    /// Leave job directories on disk after the job ends.
    #[serde(default)]
    pub keep_workdirs: bool,
    /// Pass the worker's own environment through to steps.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,
    /// Extra variables exported to every step.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_inherit_env() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            work_root: None,
            keep_workdirs: false,
            inherit_env: default_inherit_env(),
            env: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn keep_workdirs(mut self, keep: bool) -> Self {
        self.keep_workdirs = keep;
        self
    }
}
