//! Step definitions as written in a workflow file.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::matrix::{MatrixCell, MatrixValue};
use crate::error::{Result, WorkflowError};

/// Actions implemented by the runner itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BuiltinAction {
    /// Clean copy of the source tree into the cell workspace.
    Checkout,

    /// Resolve an interpreter for the cell and put it first on PATH.
    SetupInterpreter,
}

impl BuiltinAction {
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinAction::Checkout => "checkout",
            BuiltinAction::SetupInterpreter => "setup-interpreter",
        }
    }

    /// Parse a `uses:` reference.
    ///
    /// Hosted-CI style references (`actions/checkout@v4`,
    /// `actions/setup-python@v5`) map onto the builtins; the version suffix
    /// is ignored.
    pub fn parse(reference: &str) -> Option<(Self, Option<&'static str>)> {
        let name = reference.split('@').next().unwrap_or(reference).trim();
        match name {
            "checkout" | "actions/checkout" => Some((BuiltinAction::Checkout, None)),
            "setup-interpreter" => Some((BuiltinAction::SetupInterpreter, None)),
            "actions/setup-python" => Some((BuiltinAction::SetupInterpreter, Some("python"))),
            _ => None,
        }
    }
}

/// Restricts a step to cells whose matrix values match glob patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(default)]
    pub matrix: IndexMap<String, String>,
}

impl StepCondition {
    /// Every listed axis must be present and match its pattern.
    pub fn holds_for(&self, cell: &MatrixCell) -> bool {
        self.matrix.iter().all(|(axis, pattern)| {
            cell.get(axis)
                .map(|value| glob_match::glob_match(pattern, value))
                .unwrap_or(false)
        })
    }
}

/// One entry of `steps:`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Shell script; mutually exclusive with `uses`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Builtin action reference; mutually exclusive with `run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    /// Action inputs.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub with: IndexMap<String, MatrixValue>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, MatrixValue>,

    /// Relative to the cell workspace.
    #[serde(
        default,
        alias = "working-directory",
        skip_serializing_if = "Option::is_none"
    )]
    pub working_directory: Option<String>,

    #[serde(
        default,
        alias = "timeout-minutes",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_minutes: Option<f64>,

    /// A failure of this step is recorded but does not stop the cell.
    #[serde(default, alias = "continue-on-error")]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<StepCondition>,
}

impl StepSpec {
    /// Validate shape; `index` is the zero-based position for messages.
    pub fn validate(&self, index: usize) -> Result<()> {
        match (&self.run, &self.uses) {
            (Some(_), Some(_)) => {
                return Err(WorkflowError::InvalidStep {
                    index,
                    reason: "`run` and `uses` are mutually exclusive".to_string(),
                })
            }
            (None, None) => {
                return Err(WorkflowError::InvalidStep {
                    index,
                    reason: "one of `run` or `uses` is required".to_string(),
                })
            }
            (Some(script), None) if script.trim().is_empty() => {
                return Err(WorkflowError::InvalidStep {
                    index,
                    reason: "`run` script is empty".to_string(),
                })
            }
            (None, Some(reference)) if BuiltinAction::parse(reference).is_none() => {
                return Err(WorkflowError::UnknownAction {
                    index,
                    action: reference.clone(),
                })
            }
            _ => {}
        }

        if let Some(minutes) = self.timeout_minutes {
            super::check_timeout(minutes)
                .map_err(|reason| WorkflowError::InvalidStep { index, reason })?;
        }
        Ok(())
    }

    /// Name shown in logs: explicit name, the action name, or the first script line.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(reference) = &self.uses {
            return reference.clone();
        }
        self.run
            .as_deref()
            .and_then(|script| script.lines().map(str::trim).find(|l| !l.is_empty()))
            .map(|line| format!("Run {line}"))
            .unwrap_or_else(|| "step".to_string())
    }
}
