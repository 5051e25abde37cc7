//! Job template registry and parameter resolution.

use conduit_core::ids::{CommandId, TemplateId};
use conduit_core::interpolation::{InterpolationContext, references};
use conduit_core::pipeline::PipelineConfig;
use conduit_core::template::{
    Command, JobKind, JobTemplate, ParameterBindings, ParameterSpec, ParameterType,
    ParameterValue, ResolvedStep, Step,
};
use conduit_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Maximum depth of nested command references.
pub const MAX_COMMAND_DEPTH: usize = 32;

/// A template bound to concrete parameter values.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub template: Arc<JobTemplate>,
    /// Every declared parameter, supplied or defaulted.
    pub parameters: ParameterBindings,
    pub steps: Vec<ResolvedStep>,
}

/// Registered templates and commands. Entries are immutable once added.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<TemplateId, Arc<JobTemplate>>,
    commands: HashMap<CommandId, Arc<Command>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every command, then every job, of a configuration document.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for command in config.commands() {
            registry.register_command(command)?;
        }
        for template in config.templates() {
            registry.register_template(template)?;
        }
        Ok(registry)
    }

    pub fn register_template(&mut self, template: JobTemplate) -> Result<Arc<JobTemplate>> {
        if self.templates.contains_key(&template.id) {
            return Err(Error::DuplicateTemplate(template.id.to_string()));
        }
        if template.definition.kind == JobKind::Approval && !template.definition.steps.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "approval job '{}' cannot have steps",
                template.id
            )));
        }
        if template.definition.resources.parallelism == 0 {
            return Err(Error::InvalidParameterValue {
                parameter: "parallelism".to_string(),
                reason: format!("job '{}' must run at least once", template.id),
            });
        }
        debug!(template = %template.id, steps = template.definition.steps.len(), "registered template");
        let template = Arc::new(template);
        self.templates
            .insert(template.id.clone(), Arc::clone(&template));
        Ok(template)
    }

    /// Register a reusable command.
    ///
    /// References to commands not registered yet are allowed; a reference
    /// chain that leads back to this command is not.
    pub fn register_command(&mut self, command: Command) -> Result<()> {
        if self.commands.contains_key(&command.id) {
            return Err(Error::DuplicateCommand(command.id.to_string()));
        }
        let mut chain = vec![command.id.clone()];
        let mut explored = HashSet::new();
        self.check_references(&command, &command, &mut chain, &mut explored)?;
        debug!(command = %command.id, "registered command");
        self.commands.insert(command.id.clone(), Arc::new(command));
        Ok(())
    }

    /// Depth-bounded walk from `current` looking for a path back to `root`.
    fn check_references(
        &self,
        root: &Command,
        current: &Command,
        chain: &mut Vec<CommandId>,
        explored: &mut HashSet<CommandId>,
    ) -> Result<()> {
        for next in current.references() {
            if next == &root.id || chain.contains(next) {
                let mut cycle: Vec<String> = chain.iter().map(|c| c.to_string()).collect();
                cycle.push(next.to_string());
                return Err(Error::CyclicCommandReference { chain: cycle });
            }
            if explored.contains(next) {
                continue;
            }
            let Some(command) = self.commands.get(next) else {
                continue;
            };
            if chain.len() >= MAX_COMMAND_DEPTH {
                return Err(Error::CommandNestingTooDeep {
                    command: root.id.to_string(),
                    limit: MAX_COMMAND_DEPTH,
                });
            }
            chain.push(next.clone());
            self.check_references(root, command, chain, explored)?;
            chain.pop();
            explored.insert(next.clone());
        }
        Ok(())
    }

    pub fn template(&self, id: &TemplateId) -> Option<&Arc<JobTemplate>> {
        self.templates.get(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Bind `params` to a template and flatten its steps.
    pub fn resolve(&self, id: &TemplateId, params: &ParameterBindings) -> Result<ResolvedJob> {
        let template = self
            .templates
            .get(id)
            .ok_or_else(|| Error::UnknownTemplate(id.to_string()))?;
        let parameters = bind(id.as_str(), &template.definition.parameters, params)?;
        let mut steps = Vec::new();
        self.expand(
            id.as_str(),
            &template.definition.steps,
            &parameters,
            0,
            &mut steps,
        )?;
        Ok(ResolvedJob {
            template: Arc::clone(template),
            parameters,
            steps,
        })
    }

    fn expand(
        &self,
        scope: &str,
        steps: &[Step],
        values: &ParameterBindings,
        depth: usize,
        out: &mut Vec<ResolvedStep>,
    ) -> Result<()> {
        let ctx = InterpolationContext::new(scope, values);
        for step in steps {
            match step {
                Step::Run { name, command } => {
                    let command = ctx.interpolate(command)?;
                    let name = match name {
                        Some(name) => ctx.interpolate(name)?,
                        None => default_step_name(&command),
                    };
                    out.push(ResolvedStep::Run { name, command });
                }
                Step::PersistToWorkspace { root, paths } => {
                    out.push(ResolvedStep::PersistToWorkspace {
                        root: ctx.interpolate(root)?,
                        paths: ctx.interpolate_all(paths)?,
                    });
                }
                Step::AttachWorkspace { at } => {
                    out.push(ResolvedStep::AttachWorkspace {
                        at: ctx.interpolate(at)?,
                    });
                }
                Step::Invoke {
                    command,
                    parameters,
                } => {
                    if depth >= MAX_COMMAND_DEPTH {
                        return Err(Error::CommandNestingTooDeep {
                            command: command.to_string(),
                            limit: MAX_COMMAND_DEPTH,
                        });
                    }
                    let definition = self
                        .commands
                        .get(command)
                        .ok_or_else(|| Error::UnknownCommand(command.to_string()))?;
                    let declared = &definition.definition.parameters;
                    let supplied = forward(&ctx, declared, parameters)?;
                    let bound = bind(command.as_str(), declared, &supplied)?;
                    self.expand(
                        command.as_str(),
                        &definition.definition.steps,
                        &bound,
                        depth + 1,
                        out,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Check supplied values against declarations and fill in defaults.
fn bind(
    scope: &str,
    declared: &BTreeMap<String, ParameterSpec>,
    supplied: &ParameterBindings,
) -> Result<ParameterBindings> {
    if let Some(name) = supplied.keys().find(|name| !declared.contains_key(*name)) {
        return Err(Error::UnknownParameter {
            scope: scope.to_string(),
            parameter: name.clone(),
        });
    }
    let mut bound = ParameterBindings::new();
    for (name, spec) in declared {
        let value = match (supplied.get(name), &spec.default) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(Error::MissingRequiredParameter {
                    scope: scope.to_string(),
                    parameter: name.clone(),
                });
            }
        };
        spec.check(&value)
            .map_err(|reason| Error::InvalidParameterValue {
                parameter: name.clone(),
                reason,
            })?;
        bound.insert(name.clone(), value);
    }
    Ok(bound)
}

/// Evaluate a command invocation's bindings in the caller's scope.
///
/// A value written as `<< parameters.x >>` takes the declared type of the
/// command's parameter once substituted.
fn forward(
    caller: &InterpolationContext<'_>,
    declared: &BTreeMap<String, ParameterSpec>,
    bindings: &ParameterBindings,
) -> Result<ParameterBindings> {
    let mut out = ParameterBindings::new();
    for (name, value) in bindings {
        let value = match value {
            ParameterValue::String(s) if !references(s).is_empty() => {
                let text = caller.interpolate(s)?;
                let kind = declared.get(name).map(|spec| spec.kind);
                coerce(text, kind)
            }
            other => other.clone(),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn coerce(text: String, kind: Option<ParameterType>) -> ParameterValue {
    match kind {
        Some(ParameterType::Boolean) => match text.as_str() {
            "true" => ParameterValue::Boolean(true),
            "false" => ParameterValue::Boolean(false),
            _ => ParameterValue::String(text),
        },
        Some(ParameterType::Integer) => text
            .parse()
            .map(ParameterValue::Integer)
            .unwrap_or(ParameterValue::String(text)),
        _ => ParameterValue::String(text),
    }
}

fn default_step_name(command: &str) -> String {
    let first = command.lines().next().unwrap_or_default().trim();
    if first.chars().count() > 60 {
        let truncated: String = first.chars().take(57).collect();
        format!("{}...", truncated)
    } else {
        first.to_string()
    }
}
