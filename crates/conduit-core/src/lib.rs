//! Conduit Core
//!
//! Core domain types, traits, and error handling for Conduit.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the workspace store, workers and the CLI.

pub mod approval;
pub mod artifact;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod template;
pub mod trigger;
pub mod workflow;

pub use error::{Error, ErrorCategory, Result};
pub use ids::*;
