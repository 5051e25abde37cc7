//! Job templates, reusable commands and their steps.
//!
//! These are the registry's inputs. A template is immutable once registered;
//! resolution binds parameter values and flattens command references into
//! [`ResolvedStep`]s that a worker can execute.

use crate::ids::{CommandId, TemplateId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A concrete parameter value as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Boolean(_) => "boolean",
            ParameterValue::Integer(_) => "integer",
            ParameterValue::String(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(b) => write!(f, "{}", b),
            ParameterValue::Integer(i) => write!(f, "{}", i),
            ParameterValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        ParameterValue::String(s.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(s: String) -> Self {
        ParameterValue::String(s)
    }
}

impl From<bool> for ParameterValue {
    fn from(b: bool) -> Self {
        ParameterValue::Boolean(b)
    }
}

impl From<i64> for ParameterValue {
    fn from(i: i64) -> Self {
        ParameterValue::Integer(i)
    }
}

pub type ParameterBindings = BTreeMap<String, ParameterValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    String,
    Boolean,
    Integer,
    Enum,
}

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub default: Option<ParameterValue>,
    #[serde(default)]
    pub description: Option<String>,
    /// Allowed values for `enum` parameters.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

impl ParameterSpec {
    pub fn string() -> Self {
        Self::default()
    }

    pub fn boolean() -> Self {
        Self {
            kind: ParameterType::Boolean,
            ..Default::default()
        }
    }

    pub fn integer() -> Self {
        Self {
            kind: ParameterType::Integer,
            ..Default::default()
        }
    }

    pub fn one_of(values: &[&str]) -> Self {
        Self {
            kind: ParameterType::Enum,
            allowed: values.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    /// Check a supplied value against the declared type.
    pub fn check(&self, value: &ParameterValue) -> std::result::Result<(), String> {
        match (self.kind, value) {
            (ParameterType::String, ParameterValue::String(_))
            | (ParameterType::Boolean, ParameterValue::Boolean(_))
            | (ParameterType::Integer, ParameterValue::Integer(_)) => Ok(()),
            (ParameterType::Enum, ParameterValue::String(s)) => {
                if self.allowed.iter().any(|a| a == s) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of [{}]", s, self.allowed.join(", ")))
                }
            }
            (kind, other) => Err(format!(
                "expected {:?}, got {}",
                kind,
                other.type_name()
            )
            .to_lowercase()),
        }
    }
}

/// How the scheduler treats a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    #[default]
    Build,
    /// Has no steps; blocks dependents until approved.
    Approval,
    /// Runs once every predecessor is terminal, whatever the outcome.
    AlwaysRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default)]
    pub resource_class: Option<String>,
}

fn default_parallelism() -> u32 {
    1
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            resource_class: None,
        }
    }
}

/// One authored step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum Step {
    Run {
        name: Option<String>,
        command: String,
    },
    Invoke {
        command: CommandId,
        parameters: ParameterBindings,
    },
    PersistToWorkspace {
        root: String,
        paths: Vec<String>,
    },
    AttachWorkspace {
        at: String,
    },
}

impl Step {
    pub fn run(command: impl Into<String>) -> Self {
        Step::Run {
            name: None,
            command: command.into(),
        }
    }

    pub fn invoke(command: impl Into<CommandId>) -> Self {
        Step::Invoke {
            command: command.into(),
            parameters: ParameterBindings::new(),
        }
    }

    pub fn invoke_with(command: impl Into<CommandId>, parameters: ParameterBindings) -> Self {
        Step::Invoke {
            command: command.into(),
            parameters,
        }
    }

    pub fn persist(root: impl Into<String>, paths: &[&str]) -> Self {
        Step::PersistToWorkspace {
            root: root.into(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn attach(at: impl Into<String>) -> Self {
        Step::AttachWorkspace { at: at.into() }
    }

    /// The command this step references, if any.
    pub fn command_ref(&self) -> Option<&CommandId> {
        match self {
            Step::Invoke { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Wire shape of a step: a bare command name or a single-key map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawStep {
    Bare(String),
    Keyed(BTreeMap<String, serde_json::Value>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRun {
    Inline(String),
    Detailed { name: Option<String>, command: String },
}

#[derive(Deserialize)]
struct RawPersist {
    #[serde(default = "default_root")]
    root: String,
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct RawAttach {
    at: String,
}

fn default_root() -> String {
    ".".to_string()
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        let map = match raw {
            RawStep::Bare(name) => return Ok(Step::invoke(name)),
            RawStep::Keyed(map) => map,
        };
        if map.len() != 1 {
            return Err(format!(
                "a step must have exactly one key, found {}",
                map.len()
            ));
        }
        let (key, value) = map.into_iter().next().ok_or("empty step")?;
        match key.as_str() {
            "run" => match serde_json::from_value::<RawRun>(value).map_err(|e| e.to_string())? {
                RawRun::Inline(command) => Ok(Step::Run {
                    name: None,
                    command,
                }),
                RawRun::Detailed { name, command } => Ok(Step::Run { name, command }),
            },
            "persist_to_workspace" => {
                let persist: RawPersist =
                    serde_json::from_value(value).map_err(|e| e.to_string())?;
                Ok(Step::PersistToWorkspace {
                    root: persist.root,
                    paths: persist.paths,
                })
            }
            "attach_workspace" => {
                let attach: RawAttach = serde_json::from_value(value).map_err(|e| e.to_string())?;
                Ok(Step::AttachWorkspace { at: attach.at })
            }
            command => {
                let parameters = if value.is_null() {
                    ParameterBindings::new()
                } else {
                    serde_json::from_value(value).map_err(|e| e.to_string())?
                };
                Ok(Step::Invoke {
                    command: CommandId::new(command),
                    parameters,
                })
            }
        }
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let mut map = BTreeMap::new();
        match step {
            Step::Run { name: None, command } => {
                map.insert("run".to_string(), serde_json::Value::String(command));
            }
            Step::Run {
                name: Some(name),
                command,
            } => {
                map.insert(
                    "run".to_string(),
                    serde_json::json!({ "name": name, "command": command }),
                );
            }
            Step::Invoke {
                command,
                parameters,
            } => {
                if parameters.is_empty() {
                    return RawStep::Bare(command.to_string());
                }
                map.insert(
                    command.to_string(),
                    serde_json::to_value(parameters).unwrap_or(serde_json::Value::Null),
                );
            }
            Step::PersistToWorkspace { root, paths } => {
                map.insert(
                    "persist_to_workspace".to_string(),
                    serde_json::json!({ "root": root, "paths": paths }),
                );
            }
            Step::AttachWorkspace { at } => {
                map.insert(
                    "attach_workspace".to_string(),
                    serde_json::json!({ "at": at }),
                );
            }
        }
        RawStep::Keyed(map)
    }
}

/// Authored body of a job in the `jobs:` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(rename = "type", default)]
    pub kind: JobKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(flatten)]
    pub resources: ResourceProfile,
}

/// A registered job template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: TemplateId,
    #[serde(flatten)]
    pub definition: JobDefinition,
}

impl JobTemplate {
    pub fn new(id: impl Into<TemplateId>) -> Self {
        Self {
            id: id.into(),
            definition: JobDefinition::default(),
        }
    }

    pub fn from_definition(id: impl Into<TemplateId>, definition: JobDefinition) -> Self {
        Self {
            id: id.into(),
            definition,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.definition.steps.push(step);
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.definition.parameters.insert(name.into(), spec);
        self
    }

    pub fn parallelism(mut self, n: u32) -> Self {
        self.definition.resources.parallelism = n;
        self
    }

    pub fn resource_class(mut self, class: impl Into<String>) -> Self {
        self.definition.resources.resource_class = Some(class.into());
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.definition.kind = kind;
        self
    }
}

/// Authored body of a reusable command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandDefinition {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A registered reusable command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    #[serde(flatten)]
    pub definition: CommandDefinition,
}

impl Command {
    pub fn new(id: impl Into<CommandId>) -> Self {
        Self {
            id: id.into(),
            definition: CommandDefinition::default(),
        }
    }

    pub fn from_definition(id: impl Into<CommandId>, definition: CommandDefinition) -> Self {
        Self {
            id: id.into(),
            definition,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.definition.steps.push(step);
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.definition.parameters.insert(name.into(), spec);
        self
    }

    /// Commands referenced directly by this command's steps.
    pub fn references(&self) -> impl Iterator<Item = &CommandId> {
        self.definition.steps.iter().filter_map(Step::command_ref)
    }
}

/// A step after parameter substitution and command flattening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedStep {
    Run { name: String, command: String },
    PersistToWorkspace { root: String, paths: Vec<String> },
    AttachWorkspace { at: String },
}

impl ResolvedStep {
    pub fn is_workspace_directive(&self) -> bool {
        !matches!(self, ResolvedStep::Run { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_steps() {
        let yaml = r#"
- checkout
- run: cargo build
- run:
    name: Test
    command: cargo test
- install:
    version: "1.80"
    locked: true
- persist_to_workspace:
    root: target
    paths: [release/app]
- attach_workspace:
    at: /tmp/ws
"#;
        let steps: Vec<Step> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0], Step::invoke("checkout"));
        assert_eq!(steps[1], Step::run("cargo build"));
        assert_eq!(
            steps[2],
            Step::Run {
                name: Some("Test".to_string()),
                command: "cargo test".to_string()
            }
        );
        let mut params = ParameterBindings::new();
        params.insert("version".to_string(), "1.80".into());
        params.insert("locked".to_string(), true.into());
        assert_eq!(steps[3], Step::invoke_with("install", params));
        assert_eq!(steps[4], Step::persist("target", &["release/app"]));
        assert_eq!(steps[5], Step::attach("/tmp/ws"));
    }

    #[test]
    fn test_step_with_two_keys_is_rejected() {
        let yaml = "- {run: a, checkout: {}}";
        assert!(serde_yaml::from_str::<Vec<Step>>(yaml).is_err());
    }

    #[test]
    fn test_parameter_type_check() {
        let spec = ParameterSpec::one_of(&["staging", "production"]);
        assert!(spec.check(&"staging".into()).is_ok());
        assert!(spec.check(&"dev".into()).is_err());
        assert!(ParameterSpec::integer().check(&"3".into()).is_err());
        assert!(ParameterSpec::boolean().check(&true.into()).is_ok());
    }

    #[test]
    fn test_job_definition_defaults() {
        let def: JobDefinition = serde_yaml::from_str("steps: [checkout]\nparallelism: 4").unwrap();
        assert_eq!(def.kind, JobKind::Build);
        assert_eq!(def.resources.parallelism, 4);
        let def: JobDefinition = serde_yaml::from_str("type: always-run").unwrap();
        assert_eq!(def.kind, JobKind::AlwaysRun);
        assert_eq!(def.resources.parallelism, 1);
    }
}
