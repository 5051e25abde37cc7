//! Workflow specifications and the job instances they expand into.

use crate::ids::{JobInstanceId, TemplateId};
use crate::template::{JobKind, ParameterBindings, ParameterValue, ResolvedStep};
use crate::trigger::{FilterSpec, RefFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Matrix expansion over parameter values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatrixSpec {
    pub parameters: BTreeMap<String, Vec<ParameterValue>>,
    #[serde(default)]
    pub exclude: Vec<ParameterBindings>,
}

/// Authored settings of one job entry in a workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobReferenceBody {
    /// Alias used instead of the template id for naming and `requires`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub filters: Option<FilterSpec>,
    #[serde(rename = "type", default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    /// Everything else is a parameter binding.
    #[serde(flatten)]
    pub parameters: ParameterBindings,
}

/// One job entry of a workflow: a template reference plus its bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJobEntry", into = "RawJobEntry")]
pub struct JobReference {
    pub template: TemplateId,
    pub body: JobReferenceBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawJobEntry {
    Bare(String),
    Configured(BTreeMap<String, JobReferenceBody>),
}

impl TryFrom<RawJobEntry> for JobReference {
    type Error = String;

    fn try_from(raw: RawJobEntry) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawJobEntry::Bare(template) => Ok(JobReference::new(template)),
            RawJobEntry::Configured(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "a workflow job entry must have exactly one key, found {}",
                        map.len()
                    ));
                }
                let (template, body) = map.into_iter().next().ok_or("empty job entry")?;
                Ok(JobReference {
                    template: TemplateId::new(template),
                    body,
                })
            }
        }
    }
}

impl From<JobReference> for RawJobEntry {
    fn from(job: JobReference) -> Self {
        if job.body == JobReferenceBody::default() {
            return RawJobEntry::Bare(job.template.to_string());
        }
        let mut map = BTreeMap::new();
        map.insert(job.template.to_string(), job.body);
        RawJobEntry::Configured(map)
    }
}

impl JobReference {
    pub fn new(template: impl Into<TemplateId>) -> Self {
        Self {
            template: template.into(),
            body: JobReferenceBody::default(),
        }
    }

    /// Name other jobs use to require this one.
    pub fn name(&self) -> &str {
        self.body.name.as_deref().unwrap_or(self.template.as_str())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.body.name = Some(name.into());
        self
    }

    pub fn requires(mut self, names: &[&str]) -> Self {
        self.body.requires = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn filters(mut self, filters: FilterSpec) -> Self {
        self.body.filters = Some(filters);
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.body.kind = Some(kind);
        self
    }

    pub fn approval(self) -> Self {
        self.kind(JobKind::Approval)
    }

    pub fn always_run(self) -> Self {
        self.kind(JobKind::AlwaysRun)
    }

    pub fn parallelism(mut self, n: u32) -> Self {
        self.body.parallelism = Some(n);
        self
    }

    pub fn matrix(mut self, matrix: MatrixSpec) -> Self {
        self.body.matrix = Some(matrix);
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.body.parameters.insert(name.into(), value.into());
        self
    }
}

/// Authored body of a workflow in the `workflows:` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub jobs: Vec<JobReference>,
}

/// A named workflow ready to be built.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSpec {
    pub name: String,
    pub jobs: Vec<JobReference>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
        }
    }

    pub fn from_definition(name: impl Into<String>, definition: WorkflowDefinition) -> Self {
        Self {
            name: name.into(),
            jobs: definition.jobs,
        }
    }

    pub fn job(mut self, job: JobReference) -> Self {
        self.jobs.push(job);
        self
    }
}

/// A concrete, schedulable occurrence of a template within a workflow.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: JobInstanceId,
    /// Logical job name shared by all parallel/matrix expansions.
    pub job_name: String,
    /// `None` for approval gates declared only in the workflow.
    pub template: Option<TemplateId>,
    pub kind: JobKind,
    pub parameters: ParameterBindings,
    pub steps: Vec<ResolvedStep>,
    pub requires: Vec<JobInstanceId>,
    pub filter: RefFilter,
    /// Trigger evaluation result for the workflow's context.
    pub admitted: bool,
    /// 1-based shard index.
    pub parallel_index: u32,
    pub parallel_total: u32,
    pub resource_class: Option<String>,
}

impl JobInstance {
    pub fn is_approval(&self) -> bool {
        self.kind == JobKind::Approval
    }

    pub fn is_always_run(&self) -> bool {
        self.kind == JobKind::AlwaysRun
    }

    /// Root directories this job attaches before running.
    pub fn attach_points(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|s| match s {
            ResolvedStep::AttachWorkspace { at } => Some(at.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_workflow_jobs() {
        let yaml = r#"
jobs:
  - build
  - test:
      requires: [build]
      parallelism: 3
  - hold:
      type: approval
      requires: [test]
  - deploy:
      requires: [hold]
      environment: production
      filters:
        branches:
          only: main
"#;
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.jobs.len(), 4);
        assert_eq!(def.jobs[0], JobReference::new("build"));
        assert_eq!(def.jobs[1].body.parallelism, Some(3));
        assert_eq!(def.jobs[2].body.kind, Some(JobKind::Approval));
        assert_eq!(
            def.jobs[3].body.parameters.get("environment"),
            Some(&ParameterValue::String("production".to_string()))
        );
        assert!(def.jobs[3].body.filters.is_some());
    }

    #[test]
    fn test_alias_is_the_job_name() {
        let job = JobReference::new("build").named("build-arm");
        assert_eq!(job.name(), "build-arm");
        assert_eq!(JobReference::new("lint").name(), "lint");
    }
}
