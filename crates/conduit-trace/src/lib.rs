//! Logging setup for Conduit.
//!
//! Installs a `tracing-subscriber` with an env filter and a pretty, compact
//! or JSON formatter, and builds spans carrying CI attributes for runs and
//! jobs.

pub mod spans;
pub mod subscriber;

pub use spans::{CiAttributes, approval_span, job_span, run_span, workspace_span};
pub use subscriber::{LogFormat, TracerError, TracingConfig, init_tracing};
