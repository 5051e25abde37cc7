//! Pipeline configuration document.
//!
//! These types represent the user-authored YAML configuration: reusable
//! commands, job templates and the workflows that wire them together.

use crate::template::{Command, CommandDefinition, JobDefinition, JobTemplate};
use crate::workflow::{WorkflowDefinition, WorkflowSpec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandDefinition>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::InvalidDefinition(e.to_string()))
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn commands(&self) -> impl Iterator<Item = Command> + '_ {
        self.commands
            .iter()
            .map(|(id, def)| Command::from_definition(id.as_str(), def.clone()))
    }

    pub fn templates(&self) -> impl Iterator<Item = JobTemplate> + '_ {
        self.jobs
            .iter()
            .map(|(id, def)| JobTemplate::from_definition(id.as_str(), def.clone()))
    }

    pub fn workflow(&self, name: &str) -> Result<WorkflowSpec> {
        self.workflows
            .get(name)
            .map(|def| WorkflowSpec::from_definition(name, def.clone()))
            .ok_or_else(|| Error::InvalidDefinition(format!("workflow not found: {}", name)))
    }

    pub fn workflow_specs(&self) -> impl Iterator<Item = WorkflowSpec> + '_ {
        self.workflows
            .iter()
            .map(|(name, def)| WorkflowSpec::from_definition(name.as_str(), def.clone()))
    }
}
