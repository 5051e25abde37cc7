//! Integration test infrastructure for Conduit.
//!
//! Provides a scripted worker whose per-job behavior is set by the test, and
//! a harness that wires it to a real scheduler, workspace store and event bus.
//!
//! # Usage
//!
//! ```ignore
//! use conduit_tests::{Behavior, ScriptedWorker, TestHarness};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let worker = ScriptedWorker::new().on("build", Behavior::Exit(1));
//!     let harness = TestHarness::new(PIPELINE, worker);
//!     let snapshot = harness.run("ci", TriggerContext::branch("main")).await;
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,conduit_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
