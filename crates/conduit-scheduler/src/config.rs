//! Scheduler configuration.

use conduit_core::trigger::FilterPolicy;
use conduit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs executing at once, across all runs.
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,
    /// How long a cancelled worker may keep its slot before it is dropped.
    #[serde(default = "default_cancel_grace_period_ms")]
    pub cancel_grace_period_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Attempts per job for worker errors and timeouts. Nonzero exits are final.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Concurrent jobs per resource class; classes not listed share only the
    /// global capacity.
    #[serde(default)]
    pub resource_class_limits: HashMap<String, usize>,
    #[serde(default)]
    pub filter_policy: FilterPolicy,
}

fn default_worker_capacity() -> usize {
    4
}

fn default_cancel_grace_period_ms() -> u64 {
    5_000
}

fn default_job_timeout_secs() -> u64 {
    3_600
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_capacity: default_worker_capacity(),
            cancel_grace_period_ms: default_cancel_grace_period_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            max_attempts: default_max_attempts(),
            resource_class_limits: HashMap::new(),
            filter_policy: FilterPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_capacity == 0 {
            return Err(Error::Config("worker_capacity must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if let Some((class, _)) = self.resource_class_limits.iter().find(|(_, l)| **l == 0) {
            return Err(Error::Config(format!(
                "resource class '{}' has a limit of 0",
                class
            )));
        }
        Ok(())
    }

    pub fn with_worker_capacity(mut self, capacity: usize) -> Self {
        self.worker_capacity = capacity;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_resource_class_limit(mut self, class: impl Into<String>, limit: usize) -> Self {
        self.resource_class_limits.insert(class.into(), limit);
        self
    }

    pub fn with_filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.filter_policy = policy;
        self
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
