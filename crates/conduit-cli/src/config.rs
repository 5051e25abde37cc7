//! CLI configuration management.

use anyhow::{Context, anyhow, bail};
use conduit_trace::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Pipeline file used when none is given.
    #[serde(default = "default_pipeline")]
    pub pipeline: PathBuf,
    /// Scheduler configuration applied to local runs.
    #[serde(default)]
    pub scheduler_config: Option<PathBuf>,
    /// Parent directory for job working directories.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_pipeline() -> PathBuf {
    PathBuf::from("conduit.yaml")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            pipeline: default_pipeline(),
            scheduler_config: None,
            work_root: None,
            log_format: LogFormat::default(),
            output_format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "conduit", "conduit")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    pub fn pipeline_path(&self, explicit: Option<PathBuf>) -> PathBuf {
        explicit.unwrap_or_else(|| self.pipeline.clone())
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let optional_path = |value: &str| match value {
            "" | "none" => None,
            v => Some(PathBuf::from(v)),
        };
        match key {
            "pipeline" => self.pipeline = PathBuf::from(value),
            "scheduler_config" => self.scheduler_config = optional_path(value),
            "work_root" => self.work_root = optional_path(value),
            "log_format" => self.log_format = value.parse()?,
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => bail!("Invalid output format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}
