//! `${{ ... }}` interpolation.
//!
//! Only plain references are supported: `matrix.<axis>`, `env.<NAME>` and
//! `runner.label`. Anything else is an error rather than an empty string.

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::error::{Result, WorkflowError};
use crate::workflow::MatrixCell;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_][A-Za-z0-9_\-]*)$")
            .expect("reference pattern is valid")
    })
}

/// Values visible to expressions.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub matrix: &'a MatrixCell,
    pub env: &'a IndexMap<String, String>,
    pub runner_label: Option<&'a str>,
}

impl<'a> Context<'a> {
    pub fn new(matrix: &'a MatrixCell, env: &'a IndexMap<String, String>) -> Self {
        Self {
            matrix,
            env,
            runner_label: None,
        }
    }

    pub fn with_runner_label(mut self, label: &'a str) -> Self {
        self.runner_label = Some(label);
        self
    }

    fn lookup(&self, namespace: &str, key: &str) -> Option<&'a str> {
        match namespace {
            "matrix" => self.matrix.get(key),
            "env" => self.env.get(key).map(String::as_str),
            "runner" if key == "label" => self.runner_label,
            _ => None,
        }
    }
}

/// Substitute every `${{ ns.key }}` in `template`.
pub fn interpolate(template: &str, ctx: &Context<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| WorkflowError::Expression {
                template: template.to_string(),
                reason: "unterminated `${{`".to_string(),
            })?;

        let inner = after_open[..end].trim();
        let caps = reference_pattern()
            .captures(inner)
            .ok_or_else(|| WorkflowError::Expression {
                template: template.to_string(),
                reason: format!("unsupported expression `{inner}`"),
            })?;

        let value = ctx
            .lookup(&caps[1], &caps[2])
            .ok_or_else(|| WorkflowError::UnknownReference {
                reference: inner.to_string(),
            })?;
        out.push_str(value);
        rest = &after_open[end + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell() -> MatrixCell {
        let mut values = IndexMap::new();
        values.insert("os".to_string(), "ubuntu-22.04".to_string());
        values.insert("python-version".to_string(), "3.8".to_string());
        MatrixCell::new(values)
    }

    #[test]
    fn test_matrix_and_env_references() {
        let cell = cell();
        let mut env = IndexMap::new();
        env.insert("REGION".to_string(), "cn".to_string());
        let ctx = Context::new(&cell, &env);

        let out = interpolate(
            "Set up Python ${{ matrix.python-version }} on ${{matrix.os}} (${{ env.REGION }})",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "Set up Python 3.8 on ubuntu-22.04 (cn)");
    }

    #[test]
    fn test_plain_text_untouched() {
        let cell = cell();
        let env = IndexMap::new();
        let ctx = Context::new(&cell, &env);
        assert_eq!(interpolate("echo $HOME }}", &ctx).unwrap(), "echo $HOME }}");
    }

    #[test]
    fn test_runner_label() {
        let cell = cell();
        let env = IndexMap::new();
        let ctx = Context::new(&cell, &env).with_runner_label("ubuntu-22.04");
        assert_eq!(interpolate("${{ runner.label }}", &ctx).unwrap(), "ubuntu-22.04");
    }

    #[test]
    fn test_unknown_reference() {
        let cell = cell();
        let env = IndexMap::new();
        let ctx = Context::new(&cell, &env);
        assert!(matches!(
            interpolate("${{ matrix.arch }}", &ctx),
            Err(WorkflowError::UnknownReference { .. })
        ));
        assert!(matches!(
            interpolate("${{ secrets.TOKEN }}", &ctx),
            Err(WorkflowError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_malformed_expressions() {
        let cell = cell();
        let env = IndexMap::new();
        let ctx = Context::new(&cell, &env);
        assert!(matches!(
            interpolate("${{ matrix.os", &ctx),
            Err(WorkflowError::Expression { .. })
        ));
        assert!(matches!(
            interpolate("${{ contains(matrix.os, 'macos') }}", &ctx),
            Err(WorkflowError::Expression { .. })
        ));
    }
}
