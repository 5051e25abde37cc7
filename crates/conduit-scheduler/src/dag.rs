//! Workflow graph building: template expansion and DAG resolution.

use crate::matrix::MatrixExpander;
use crate::registry::TemplateRegistry;
use crate::triggers::TriggerEvaluator;
use conduit_core::ids::JobInstanceId;
use conduit_core::ports::Lineage;
use conduit_core::template::{JobKind, ParameterBindings};
use conduit_core::trigger::{RefFilter, TriggerContext};
use conduit_core::workflow::{JobInstance, JobReference, WorkflowSpec};
use conduit_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

/// A built workflow: job instances forming a DAG, kept in topological order.
#[derive(Debug)]
pub struct Workflow {
    name: String,
    context: TriggerContext,
    graph: DiGraph<JobInstance, ()>,
    order: Vec<NodeIndex>,
    index: HashMap<JobInstanceId, NodeIndex>,
    position: HashMap<JobInstanceId, usize>,
    /// Logical job name to its instances (parallel shards, matrix cells).
    by_name: HashMap<String, Vec<JobInstanceId>>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context the trigger decisions were made for.
    pub fn context(&self) -> &TriggerContext {
        &self.context
    }

    /// Instances in topological order; ties keep declaration order.
    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.order.iter().map(|&idx| &self.graph[idx])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &JobInstanceId) -> Option<&JobInstance> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Instances expanded from one logical job name.
    pub fn instances_named(&self, name: &str) -> Vec<&JobInstance> {
        self.by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Jobs with no `requires`.
    pub fn roots(&self) -> Vec<&JobInstance> {
        self.instances().filter(|j| j.requires.is_empty()).collect()
    }

    pub fn predecessors(&self, id: &JobInstanceId) -> Vec<&JobInstance> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn successors(&self, id: &JobInstanceId) -> Vec<&JobInstance> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &JobInstanceId, direction: Direction) -> Vec<&JobInstance> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<_> = self.graph.neighbors_directed(idx, direction).collect();
        nodes.sort_by_key(|n| self.position.get(&self.graph[*n].id).copied());
        nodes.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Whether `descendant` transitively requires `ancestor`.
    pub fn is_ancestor(&self, ancestor: &JobInstanceId, descendant: &JobInstanceId) -> bool {
        match (self.index.get(ancestor), self.index.get(descendant)) {
            (Some(&a), Some(&d)) if a != d => has_path_connecting(&self.graph, a, d, None),
            _ => false,
        }
    }

    pub fn admitted_count(&self) -> usize {
        self.instances().filter(|j| j.admitted).count()
    }
}

impl Lineage for Workflow {
    fn is_ancestor(&self, ancestor: &JobInstanceId, descendant: &JobInstanceId) -> bool {
        Workflow::is_ancestor(self, ancestor, descendant)
    }

    fn position(&self, job: &JobInstanceId) -> Option<usize> {
        self.position.get(job).copied()
    }
}

/// Expands a workflow specification against the registry into a [`Workflow`].
pub struct WorkflowGraphBuilder<'a> {
    registry: &'a TemplateRegistry,
    evaluator: TriggerEvaluator,
    matrix: MatrixExpander,
}

impl<'a> WorkflowGraphBuilder<'a> {
    pub fn new(registry: &'a TemplateRegistry, evaluator: TriggerEvaluator) -> Self {
        Self {
            registry,
            evaluator,
            matrix: MatrixExpander::new(),
        }
    }

    pub fn build(&self, spec: &WorkflowSpec, context: &TriggerContext) -> Result<Workflow> {
        if spec.jobs.is_empty() {
            return Err(Error::EmptyWorkflow(spec.name.clone()));
        }

        let mut graph: DiGraph<JobInstance, ()> = DiGraph::new();
        let mut index = HashMap::new();
        let mut by_name: HashMap<String, Vec<JobInstanceId>> = HashMap::new();

        // A job may only require jobs declared before it.
        for job in &spec.jobs {
            let name = job.name().to_string();
            if by_name.contains_key(&name) {
                return Err(Error::DuplicateJob(name));
            }

            let mut requires: Vec<JobInstanceId> = Vec::new();
            for dependency in &job.body.requires {
                let upstream = by_name.get(dependency.as_str()).ok_or_else(|| {
                    Error::UnresolvedDependency {
                        job: name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                for id in upstream {
                    if !requires.contains(id) {
                        requires.push(id.clone());
                    }
                }
            }

            let mut ids = Vec::new();
            for mut instance in self.expand(job, context)? {
                if index.contains_key(&instance.id) {
                    return Err(Error::DuplicateJob(instance.id.to_string()));
                }
                instance.requires = requires.clone();
                let id = instance.id.clone();
                let node = graph.add_node(instance);
                for dep in &requires {
                    graph.add_edge(index[dep], node, ());
                }
                index.insert(id.clone(), node);
                ids.push(id);
            }
            by_name.insert(name, ids);
        }

        let order = topological_order(&graph)?;
        let position = order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (graph[idx].id.clone(), pos))
            .collect();

        debug!(
            workflow = %spec.name,
            instances = order.len(),
            context = %context,
            "built workflow graph"
        );

        Ok(Workflow {
            name: spec.name.clone(),
            context: context.clone(),
            graph,
            order,
            index,
            position,
            by_name,
        })
    }

    /// Instances for one job reference: one per matrix cell and shard.
    fn expand(&self, job: &JobReference, context: &TriggerContext) -> Result<Vec<JobInstance>> {
        let name = job.name();
        let template_id = job.template.clone();
        let template = self.registry.template(&template_id);
        let kind = job
            .body
            .kind
            .or_else(|| template.map(|t| t.definition.kind))
            .unwrap_or_default();
        if template.is_none() && kind != JobKind::Approval {
            return Err(Error::UnknownTemplate(template_id.to_string()));
        }

        let filter = match &job.body.filters {
            Some(spec) => RefFilter::compile(spec)?,
            None => RefFilter::default(),
        };
        let admitted = self.evaluator.admits(&filter, context);

        let parallelism = match kind {
            JobKind::Approval => 1,
            _ => job
                .body
                .parallelism
                .or_else(|| template.map(|t| t.definition.resources.parallelism))
                .unwrap_or(1),
        };
        if parallelism == 0 {
            return Err(Error::InvalidParameterValue {
                parameter: "parallelism".to_string(),
                reason: format!("job '{}' must run at least once", name),
            });
        }

        let cells = match &job.body.matrix {
            Some(matrix) => self
                .matrix
                .expand(name, matrix)?
                .into_iter()
                .map(|cell| (self.matrix.instance_name(name, &cell), cell))
                .collect(),
            None => vec![(name.to_string(), ParameterBindings::new())],
        };

        let mut instances = Vec::new();
        for (base, cell) in cells {
            let mut bindings = job.body.parameters.clone();
            bindings.extend(cell);

            let (parameters, steps) = match kind {
                JobKind::Approval => (bindings, Vec::new()),
                _ => {
                    let resolved = self.registry.resolve(&template_id, &bindings)?;
                    (resolved.parameters, resolved.steps)
                }
            };

            for shard in 1..=parallelism {
                let id = if parallelism > 1 {
                    format!("{}-{}", base, shard)
                } else {
                    base.clone()
                };
                instances.push(JobInstance {
                    id: JobInstanceId::new(id),
                    job_name: name.to_string(),
                    template: template.map(|t| t.id.clone()),
                    kind,
                    parameters: parameters.clone(),
                    steps: steps.clone(),
                    requires: Vec::new(),
                    filter: filter.clone(),
                    admitted,
                    parallel_index: shard,
                    parallel_total: parallelism,
                    resource_class: template.and_then(|t| t.definition.resources.resource_class.clone()),
                });
            }
        }
        Ok(instances)
    }
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn topological_order(graph: &DiGraph<JobInstance, ()>) -> Result<Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < graph.node_count() {
        return Err(Error::CycleDetected {
            jobs: cycle_members(graph),
        });
    }
    Ok(order)
}

/// Logical job names that sit on a cycle, sorted.
fn cycle_members(graph: &DiGraph<JobInstance, ()>) -> Vec<String> {
    let mut names = BTreeSet::new();
    for component in tarjan_scc(graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if cyclic {
            names.extend(component.iter().map(|&n| graph[n].job_name.clone()));
        }
    }
    names.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::template::{JobTemplate, ParameterSpec, ParameterValue, Step};
    use conduit_core::trigger::FilterSpec;
    use conduit_core::workflow::MatrixSpec;
    use pretty_assertions::assert_eq;

    fn registry() -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        for name in ["build", "lint", "deploy", "package"] {
            registry
                .register_template(JobTemplate::new(name).step(Step::run(format!("make {}", name))))
                .unwrap();
        }
        registry
            .register_template(
                JobTemplate::new("test")
                    .parameter("toolchain", ParameterSpec::string().with_default("stable"))
                    .step(Step::run("cargo +<< parameters.toolchain >> test")),
            )
            .unwrap();
        registry
            .register_template(
                JobTemplate::new("shard")
                    .parallelism(3)
                    .step(Step::run("run-shard")),
            )
            .unwrap();
        registry
    }

    fn build(spec: &WorkflowSpec) -> Result<Workflow> {
        let registry = registry();
        WorkflowGraphBuilder::new(&registry, TriggerEvaluator::default())
            .build(spec, &TriggerContext::branch("main"))
    }

    fn ids(jobs: Vec<&JobInstance>) -> Vec<String> {
        jobs.into_iter().map(|j| j.id.to_string()).collect()
    }

    fn order(workflow: &Workflow) -> Vec<String> {
        workflow.instances().map(|j| j.id.to_string()).collect()
    }

    #[test]
    fn test_linear_dag() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build"))
            .job(JobReference::new("test").requires(&["build"]))
            .job(JobReference::new("deploy").requires(&["test"]));
        let workflow = build(&spec).unwrap();

        assert_eq!(ids(workflow.roots()), vec!["build"]);
        assert_eq!(order(&workflow), vec!["build", "test", "deploy"]);
        let build_id = JobInstanceId::new("build");
        let deploy_id = JobInstanceId::new("deploy");
        assert!(workflow.is_ancestor(&build_id, &deploy_id));
        assert!(!workflow.is_ancestor(&deploy_id, &build_id));
        assert!(!workflow.is_ancestor(&build_id, &build_id));
    }

    #[test]
    fn test_requires_must_name_an_earlier_job() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("deploy").requires(&["build"]))
            .job(JobReference::new("build"));
        match build(&spec) {
            Err(Error::UnresolvedDependency { job, dependency }) => {
                assert_eq!((job.as_str(), dependency.as_str()), ("deploy", "build"));
            }
            other => panic!("expected unresolved dependency, got {:?}", other.map(|w| w.len())),
        }

        let spec = WorkflowSpec::new("ci").job(JobReference::new("build").requires(&["build"]));
        assert!(matches!(build(&spec), Err(Error::UnresolvedDependency { .. })));
    }

    #[test]
    fn test_stable_order_follows_declaration() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("lint"))
            .job(JobReference::new("build"))
            .job(JobReference::new("deploy").requires(&["build", "lint"]));
        let workflow = build(&spec).unwrap();
        assert_eq!(order(&workflow), vec!["lint", "build", "deploy"]);
        assert_eq!(
            ids(workflow.predecessors(&JobInstanceId::new("deploy"))),
            vec!["lint", "build"]
        );

        let again = build(&spec).unwrap();
        assert_eq!(order(&again), order(&workflow));
    }

    #[test]
    fn test_parallel_shards_share_edges() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build"))
            .job(JobReference::new("shard").requires(&["build"]))
            .job(JobReference::new("deploy").requires(&["shard"]));
        let workflow = build(&spec).unwrap();

        let shards = workflow.instances_named("shard");
        assert_eq!(ids(shards.clone()), vec!["shard-1", "shard-2", "shard-3"]);
        for shard in &shards {
            assert_eq!(shard.requires, vec![JobInstanceId::new("build")]);
            assert_eq!(shard.parallel_total, 3);
        }
        let deploy = workflow.get(&JobInstanceId::new("deploy")).unwrap();
        assert_eq!(deploy.requires.len(), 3);
        assert_eq!(
            ids(workflow.successors(&JobInstanceId::new("build"))),
            vec!["shard-1", "shard-2", "shard-3"]
        );
    }

    #[test]
    fn test_reference_overrides_parallelism() {
        let spec = WorkflowSpec::new("ci").job(JobReference::new("build").parallelism(2));
        let workflow = build(&spec).unwrap();
        assert_eq!(order(&workflow), vec!["build-1", "build-2"]);

        let spec = WorkflowSpec::new("ci").job(JobReference::new("build").parallelism(0));
        assert!(matches!(
            build(&spec),
            Err(Error::InvalidParameterValue { .. })
        ));
    }

    #[test]
    fn test_matrix_expansion() {
        let mut matrix = MatrixSpec::default();
        matrix.parameters.insert(
            "toolchain".into(),
            vec![ParameterValue::from("stable"), ParameterValue::from("nightly")],
        );
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("test").matrix(matrix))
            .job(JobReference::new("package").requires(&["test"]));
        let workflow = build(&spec).unwrap();

        assert_eq!(
            order(&workflow),
            vec!["test-stable", "test-nightly", "package"]
        );
        let nightly = workflow.get(&JobInstanceId::new("test-nightly")).unwrap();
        assert_eq!(nightly.steps.len(), 1);
        assert!(matches!(
            &nightly.steps[0],
            conduit_core::template::ResolvedStep::Run { command, .. } if command == "cargo +nightly test"
        ));
        assert_eq!(
            workflow.get(&JobInstanceId::new("package")).unwrap().requires.len(),
            2
        );
    }

    #[test]
    fn test_definition_errors() {
        let spec = WorkflowSpec::new("ci").job(JobReference::new("test").requires(&["biuld"]));
        assert!(matches!(
            build(&spec),
            Err(Error::UnresolvedDependency { ref dependency, .. }) if dependency == "biuld"
        ));

        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build"))
            .job(JobReference::new("build"));
        assert!(matches!(build(&spec), Err(Error::DuplicateJob(_))));

        assert!(matches!(
            build(&WorkflowSpec::new("empty")),
            Err(Error::EmptyWorkflow(_))
        ));

        let spec = WorkflowSpec::new("ci").job(JobReference::new("nope"));
        assert!(matches!(build(&spec), Err(Error::UnknownTemplate(_))));
    }

    #[test]
    fn test_aliases_allow_reusing_a_template() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build").named("build-a"))
            .job(JobReference::new("build").named("build-b"))
            .job(JobReference::new("deploy").requires(&["build-a", "build-b"]));
        let workflow = build(&spec).unwrap();
        assert_eq!(order(&workflow), vec!["build-a", "build-b", "deploy"]);
    }

    #[test]
    fn test_cycle_reports_members() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("lint"))
            .job(JobReference::new("build").requires(&["lint"]))
            .job(JobReference::new("test").requires(&["build"]))
            .job(JobReference::new("deploy").requires(&["test"]));
        let workflow = build(&spec).unwrap();
        assert!(topological_order(&workflow.graph).is_ok());

        let mut graph = workflow.graph.clone();
        let node = |name: &str| workflow.index[&JobInstanceId::new(name)];
        graph.add_edge(node("deploy"), node("build"), ());
        match topological_order(&graph) {
            Err(Error::CycleDetected { jobs }) => {
                assert_eq!(jobs, vec!["build", "deploy", "test"]);
            }
            other => panic!("expected a cycle, got {:?}", other.map(|o| o.len())),
        }
    }

    #[test]
    fn test_approval_jobs_need_no_template() {
        let spec = WorkflowSpec::new("ci")
            .job(JobReference::new("build"))
            .job(JobReference::new("hold").approval().requires(&["build"]))
            .job(JobReference::new("deploy").requires(&["hold"]));
        let workflow = build(&spec).unwrap();
        let hold = workflow.get(&JobInstanceId::new("hold")).unwrap();
        assert!(hold.is_approval());
        assert!(hold.steps.is_empty());
        assert!(hold.template.is_none());
    }

    #[test]
    fn test_trigger_decisions_are_recorded() {
        let registry = registry();
        let spec = WorkflowSpec::new("release")
            .job(JobReference::new("build"))
            .job(
                JobReference::new("deploy")
                    .requires(&["build"])
                    .filters(FilterSpec::tags_only(&["v*"])),
            );
        let builder = WorkflowGraphBuilder::new(&registry, TriggerEvaluator::default());

        let on_branch = builder.build(&spec, &TriggerContext::branch("main")).unwrap();
        let admitted: Vec<_> = on_branch.instances().map(|j| j.admitted).collect();
        assert_eq!(admitted, vec![true, false]);

        let on_tag = builder.build(&spec, &TriggerContext::tag("v2.0.0")).unwrap();
        assert_eq!(on_tag.admitted_count(), 2);

        let bad = WorkflowSpec::new("ci")
            .job(JobReference::new("build").filters(FilterSpec::branches_only(&["/(/"])));
        assert!(matches!(
            builder.build(&bad, &TriggerContext::branch("main")),
            Err(Error::InvalidPattern { .. })
        ));
    }
}
