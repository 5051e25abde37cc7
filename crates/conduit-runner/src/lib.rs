//! Step execution on the host for Conduit.

pub mod runner;
pub mod shell;
pub mod workdir;

pub use runner::{OutputLine, OutputStream, RunnerConfig};
pub use shell::ShellWorker;
pub use workdir::JobDirectory;
