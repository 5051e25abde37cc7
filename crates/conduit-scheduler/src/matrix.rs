//! Matrix expansion for parameterized job instances.

use conduit_core::template::ParameterBindings;
use conduit_core::workflow::MatrixSpec;
use conduit_core::{Error, Result};

/// Expander for matrix configurations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Cartesian product of the matrix parameters minus excluded
    /// combinations, in sorted parameter order.
    pub fn expand(&self, job: &str, matrix: &MatrixSpec) -> Result<Vec<ParameterBindings>> {
        if matrix.parameters.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "matrix of job '{}' declares no parameters",
                job
            )));
        }

        let mut combinations = vec![ParameterBindings::new()];
        for (name, values) in &matrix.parameters {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combo in &combinations {
                for value in values {
                    let mut combo = combo.clone();
                    combo.insert(name.clone(), value.clone());
                    next.push(combo);
                }
            }
            combinations = next;
        }

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| matches_exclude(combo, exclude))
        });

        if combinations.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "matrix of job '{}' expands to no jobs",
                job
            )));
        }
        Ok(combinations)
    }

    /// `<job>-<v1>-<v2>`, values in sorted parameter order.
    pub fn instance_name(&self, job: &str, combo: &ParameterBindings) -> String {
        let mut name = job.to_string();
        for value in combo.values() {
            name.push('-');
            name.push_str(&value.to_string());
        }
        name
    }
}

fn matches_exclude(combo: &ParameterBindings, exclude: &ParameterBindings) -> bool {
    !exclude.is_empty()
        && exclude
            .iter()
            .all(|(key, value)| combo.get(key) == Some(value))
}
