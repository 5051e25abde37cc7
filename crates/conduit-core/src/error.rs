//! Error types for Conduit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Template already registered: {0}")]
    DuplicateTemplate(String),

    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    #[error("Template not found: {0}")]
    UnknownTemplate(String),

    #[error("Command not found: {0}")]
    UnknownCommand(String),

    #[error("Cyclic command reference: {}", .chain.join(" -> "))]
    CyclicCommandReference { chain: Vec<String> },

    #[error("Command nesting deeper than {limit} levels: {command}")]
    CommandNestingTooDeep { command: String, limit: usize },

    #[error("Unknown parameter '{parameter}' in {scope}")]
    UnknownParameter { scope: String, parameter: String },

    #[error("Missing required parameter '{parameter}' for {scope}")]
    MissingRequiredParameter { scope: String, parameter: String },

    #[error("Invalid value for parameter '{parameter}': {reason}")]
    InvalidParameterValue { parameter: String, reason: String },

    #[error("Job '{job}' requires '{dependency}', which is not declared before it")]
    UnresolvedDependency { job: String, dependency: String },

    #[error("Cycle detected between jobs: {}", .jobs.join(", "))]
    CycleDetected { jobs: Vec<String> },

    #[error("Job declared twice in workflow: {0}")]
    DuplicateJob(String),

    #[error("Workflow has no jobs: {0}")]
    EmptyWorkflow(String),

    #[error("Invalid filter pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    // Execution errors
    #[error("Job exited with status {exit_code}")]
    JobFailed { exit_code: i32 },

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Job timeout after {seconds} seconds")]
    JobTimeout { seconds: u64 },

    // Artifact errors
    #[error("Artifact already exists: {producer}:{path}")]
    ArtifactAlreadyExists { producer: String, path: String },

    #[error("No workspace artifacts visible to job '{consumer}'")]
    ArtifactNotVisible { consumer: String },

    #[error("Invalid artifact path: {0}")]
    InvalidArtifactPath(String),

    #[error("Job '{consumer}' would attach '{path}' from several jobs: {}", .producers.join(", "))]
    ArtifactConflict {
        consumer: String,
        path: String,
        producers: Vec<String>,
    },

    // Gate errors
    #[error("Approval gate already resolved: {0}")]
    GateAlreadyResolved(String),

    #[error("Approval gate is not open: {0}")]
    GateNotOpen(String),

    #[error("Job is not an approval gate: {0}")]
    NotAnApprovalGate(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Job not found in run: {0}")]
    JobNotFound(String),

    #[error("Run still in progress: {0}")]
    RunNotTerminal(String),

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Where an error belongs in the failure taxonomy, which decides who sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected before a run exists; nothing is started.
    Definition,
    /// Localized to one job instance.
    Execution,
    /// Surfaced to the offending job as a failure.
    Artifact,
    /// Returned to the approval caller, never to the run.
    Gate,
    Run,
    Infrastructure,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::DuplicateTemplate(_)
            | Error::DuplicateCommand(_)
            | Error::UnknownTemplate(_)
            | Error::UnknownCommand(_)
            | Error::CyclicCommandReference { .. }
            | Error::CommandNestingTooDeep { .. }
            | Error::UnknownParameter { .. }
            | Error::MissingRequiredParameter { .. }
            | Error::InvalidParameterValue { .. }
            | Error::UnresolvedDependency { .. }
            | Error::CycleDetected { .. }
            | Error::DuplicateJob(_)
            | Error::EmptyWorkflow(_)
            | Error::InvalidPattern { .. }
            | Error::InvalidDefinition(_) => ErrorCategory::Definition,
            Error::JobFailed { .. } | Error::WorkerFailed(_) | Error::JobTimeout { .. } => {
                ErrorCategory::Execution
            }
            Error::ArtifactAlreadyExists { .. }
            | Error::ArtifactNotVisible { .. }
            | Error::InvalidArtifactPath(_)
            | Error::ArtifactConflict { .. } => ErrorCategory::Artifact,
            Error::GateAlreadyResolved(_) | Error::GateNotOpen(_) | Error::NotAnApprovalGate(_) => {
                ErrorCategory::Gate
            }
            Error::RunNotFound(_) | Error::JobNotFound(_) | Error::RunNotTerminal(_) => {
                ErrorCategory::Run
            }
            Error::Storage(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Definition errors are fatal before start.
    pub fn is_definition_error(&self) -> bool {
        self.category() == ErrorCategory::Definition
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_jobs() {
        let err = Error::CycleDetected {
            jobs: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Cycle detected between jobs: a, b");
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::GateAlreadyResolved("hold".into()).category(),
            ErrorCategory::Gate
        );
        assert_eq!(
            Error::ArtifactNotVisible {
                consumer: "deploy".into()
            }
            .category(),
            ErrorCategory::Artifact
        );
        assert_eq!(Error::JobFailed { exit_code: 1 }.category(), ErrorCategory::Execution);
    }

    #[test]
    fn test_conflict_message_names_producers() {
        let err = Error::ArtifactConflict {
            consumer: "deploy".into(),
            path: "report.xml".into(),
            producers: vec!["test-1".into(), "test-2".into()],
        };
        assert_eq!(
            err.to_string(),
            "Job 'deploy' would attach 'report.xml' from several jobs: test-1, test-2"
        );
        assert_eq!(err.category(), ErrorCategory::Artifact);
    }
}
