//! `<< parameters.name >>` substitution.

use crate::template::ParameterBindings;
use crate::{Error, Result};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PARAMETER_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<<\s*parameters\.([A-Za-z_][A-Za-z0-9_\-]*)\s*>>").expect("static pattern")
});

/// Parameter names referenced by `input`, in order of appearance.
pub fn references(input: &str) -> Vec<&str> {
    PARAMETER_REF
        .captures_iter(input)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Substitutes parameter values within one scope (a template or a command).
#[derive(Debug, Clone, Copy)]
pub struct InterpolationContext<'a> {
    scope: &'a str,
    values: &'a ParameterBindings,
}

impl<'a> InterpolationContext<'a> {
    pub fn new(scope: &'a str, values: &'a ParameterBindings) -> Self {
        Self { scope, values }
    }

    /// Replace every reference; a name without a value is `UnknownParameter`.
    pub fn interpolate(&self, input: &str) -> Result<String> {
        if let Some(missing) = references(input)
            .into_iter()
            .find(|name| !self.values.contains_key(*name))
        {
            return Err(Error::UnknownParameter {
                scope: self.scope.to_string(),
                parameter: missing.to_string(),
            });
        }
        Ok(PARAMETER_REF
            .replace_all(input, |caps: &Captures| {
                let name = caps.get(1).map_or("", |m| m.as_str());
                self.values
                    .get(name)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            })
            .into_owned())
    }

    pub fn interpolate_all(&self, inputs: &[String]) -> Result<Vec<String>> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ParameterValue;

    fn values() -> ParameterBindings {
        let mut v = ParameterBindings::new();
        v.insert("toolchain".into(), "stable".into());
        v.insert("jobs".into(), ParameterValue::Integer(4));
        v.insert("locked".into(), true.into());
        v
    }

    #[test]
    fn test_interpolate() {
        let values = values();
        let ctx = InterpolationContext::new("build", &values);
        assert_eq!(
            ctx.interpolate("rustup default << parameters.toolchain >>").unwrap(),
            "rustup default stable"
        );
        assert_eq!(
            ctx.interpolate("cargo build -j<<parameters.jobs>> --locked=<< parameters.locked >>")
                .unwrap(),
            "cargo build -j4 --locked=true"
        );
        assert_eq!(ctx.interpolate("no refs here").unwrap(), "no refs here");
    }

    #[test]
    fn test_unknown_reference() {
        let values = values();
        let ctx = InterpolationContext::new("build", &values);
        let err = ctx.interpolate("echo << parameters.target >>").unwrap_err();
        match err {
            Error::UnknownParameter { scope, parameter } => {
                assert_eq!(scope, "build");
                assert_eq!(parameter, "target");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_references() {
        assert_eq!(
            references("<< parameters.a >> and << parameters.b-c >> and <<pipeline.x>>"),
            vec!["a", "b-c"]
        );
    }
}
