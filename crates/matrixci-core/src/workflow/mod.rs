//! Workflow definitions: triggers, matrix strategy and steps.
//!
//! A workflow file is YAML shaped like a single hosted-CI job:
//!
//! ```yaml
//! name: Test package from index
//! on:
//!   push:
//!     branches: [main]
//!   pull_request:
//!     branches: [main]
//! timeout_minutes: 120
//! runs_on: ${{ matrix.os }}
//! strategy:
//!   matrix:
//!     os: [ubuntu-22.04, macos-13]
//!     python-version: ["3.8", "3.9"]
//! steps:
//!   - uses: checkout
//!   - run: python -m pip install --upgrade pip
//! ```

pub mod matrix;
pub mod step;
pub mod trigger;

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::MAX_TIMEOUT_MINUTES;
use crate::error::{Result, WorkflowError};
use crate::ledger::ContentDigest;

pub use matrix::{MatrixCell, MatrixSpec, MatrixValue, MAX_CELLS};
pub use step::{BuiltinAction, StepCondition, StepSpec};
pub use trigger::{BranchFilter, Event, EventKind, TriggerRule, TriggerSet, TriggerSpec};

/// Matrix strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: MatrixSpec,

    /// Per-workflow cap on concurrently running cells.
    #[serde(default, alias = "max-parallel", skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

/// A parsed workflow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,

    #[serde(rename = "on", alias = "triggers")]
    pub on: TriggerSpec,

    /// Environment for every step; values may reference `matrix.*`.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, MatrixValue>,

    /// Wall-clock budget for one cell.
    #[serde(default, alias = "timeout-minutes", skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<f64>,

    /// Runner label template; defaults to `${{ matrix.os }}` when an `os` axis exists.
    #[serde(default, alias = "runs-on", skip_serializing_if = "Option::is_none")]
    pub runs_on: Option<String>,

    #[serde(default)]
    pub strategy: Strategy,

    pub steps: Vec<StepSpec>,
}

impl Workflow {
    /// Parse and validate YAML source.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let workflow: Workflow = serde_yml::from_str(source)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Read, parse and validate a workflow file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    /// Structural checks that do not depend on an event.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::Invalid("workflow name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::Invalid("workflow has no steps".to_string()));
        }
        if let Some(minutes) = self.timeout_minutes {
            check_timeout(minutes).map_err(WorkflowError::Invalid)?;
        }
        if self.strategy.max_parallel == Some(0) {
            return Err(WorkflowError::Invalid(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.triggers().rules().is_empty() {
            return Err(WorkflowError::Invalid("workflow has no triggers".to_string()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate(index)?;
        }
        self.strategy.matrix.expand()?;
        Ok(())
    }

    pub fn triggers(&self) -> TriggerSet {
        TriggerSet::from(&self.on)
    }

    /// Runner label template for cells.
    pub fn runs_on_template(&self) -> String {
        match &self.runs_on {
            Some(template) => template.clone(),
            None if self.strategy.matrix.axes.contains_key("os") => {
                "${{ matrix.os }}".to_string()
            }
            None => "local".to_string(),
        }
    }

    /// Content digest of the canonical JSON form.
    pub fn digest(&self) -> Result<ContentDigest> {
        let canonical = serde_json::to_vec(self)
            .map_err(|e| WorkflowError::Invalid(format!("cannot serialize workflow: {e}")))?;
        Ok(ContentDigest::from_bytes(&canonical))
    }
}

/// `timeout_minutes` must be positive and at most [`MAX_TIMEOUT_MINUTES`].
pub(crate) fn check_timeout(minutes: f64) -> std::result::Result<(), String> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(format!("timeout_minutes must be positive, got {minutes}"));
    }
    if minutes > MAX_TIMEOUT_MINUTES {
        return Err(format!(
            "timeout_minutes must be at most {MAX_TIMEOUT_MINUTES}, got {minutes}"
        ));
    }
    Ok(())
}
