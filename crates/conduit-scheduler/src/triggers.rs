//! Branch/tag trigger evaluation.

use crate::dag::Workflow;
use conduit_core::trigger::{FilterPolicy, RefFilter, RefKind, TriggerContext};
use conduit_core::workflow::JobInstance;

/// Decides whether a job runs for a trigger context.
///
/// A pure function of the job's filter, the context and the policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerEvaluator {
    policy: FilterPolicy,
}

impl TriggerEvaluator {
    pub fn new(policy: FilterPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FilterPolicy {
        self.policy
    }

    pub fn admit(&self, job: &JobInstance, context: &TriggerContext) -> bool {
        self.admits(&job.filter, context)
    }

    pub fn admits(&self, filter: &RefFilter, context: &TriggerContext) -> bool {
        let git_ref = context.git_ref.as_str();
        match context.ref_kind {
            RefKind::Branch => match &filter.branches {
                Some(branches) => branches.passes(git_ref),
                None => !(self.policy.tag_filters_exclude_branches && filter.allows_tags()),
            },
            RefKind::Tag => {
                if filter.is_unrestricted() {
                    return self.policy.unfiltered_jobs_run_on_tags;
                }
                match &filter.tags {
                    Some(tags) if !tags.only.is_empty() => tags.passes(git_ref),
                    Some(tags) => !self.policy.tags_require_opt_in && tags.passes(git_ref),
                    None => !self.policy.tags_require_opt_in,
                }
            }
        }
    }

    /// Whether any job of the workflow runs for this context.
    pub fn admits_workflow(&self, workflow: &Workflow, context: &TriggerContext) -> bool {
        workflow.instances().any(|job| self.admit(job, context))
    }
}
