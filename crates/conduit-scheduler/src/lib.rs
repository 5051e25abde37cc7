//! Workflow graph building and run scheduling for Conduit.

pub mod bus;
pub mod config;
pub mod dag;
pub mod matrix;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod triggers;

pub use bus::BroadcastEventBus;
pub use config::SchedulerConfig;
pub use dag::{Workflow, WorkflowGraphBuilder};
pub use matrix::MatrixExpander;
pub use queue::ReadyQueue;
pub use registry::{ResolvedJob, TemplateRegistry};
pub use scheduler::Scheduler;
pub use triggers::TriggerEvaluator;
