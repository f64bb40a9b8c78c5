//! Run planning: (workflow, event) → independent cell plans.
//!
//! Planning is pure. It decides whether the event triggers the workflow,
//! expands the matrix, and resolves every `${{ }}` reference per cell so the
//! runner only deals with concrete commands.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_TIMEOUT_MINUTES;
use crate::error::{Result, WorkflowError};
use crate::expr::{interpolate, Context};
use crate::ledger::ContentDigest;
use crate::workflow::{
    check_timeout, BuiltinAction, Event, MatrixCell, MatrixValue, StepSpec, Workflow,
};

/// What a planned step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Shell script.
    Run { script: String },

    /// Copy of the source tree into the workspace (optionally at `reference`).
    Checkout {
        reference: Option<String>,
        path: Option<String>,
    },

    /// Interpreter `<name><version>` (or an explicit `path`) first on PATH.
    SetupInterpreter {
        name: String,
        version: String,
        path: Option<String>,
    },
}

/// A step with every expression resolved for one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Zero-based position in the workflow.
    pub index: usize,
    pub name: String,
    pub action: StepAction,
    /// Workflow env overlaid with the step's own env.
    pub env: IndexMap<String, String>,
    pub working_directory: Option<String>,
    pub timeout: Option<Duration>,
    pub continue_on_error: bool,
    /// False when the step's `when` condition rejects this cell.
    pub enabled: bool,
}

/// Everything needed to execute one matrix cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPlan {
    pub index: usize,
    pub cell: MatrixCell,
    pub runner_label: String,
    pub timeout: Duration,
    pub env: IndexMap<String, String>,
    pub steps: Vec<PlannedStep>,
    /// Digest of the workflow digest plus the cell assignment.
    pub spec_digest: ContentDigest,
}

impl CellPlan {
    pub fn label(&self) -> String {
        self.cell.label()
    }
}

/// The set of independent cell runs created by one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub workflow: String,
    pub workflow_digest: ContentDigest,
    pub event: Event,
    pub max_parallel: Option<usize>,
    pub cells: Vec<CellPlan>,
}

impl RunPlan {
    /// Keep only cells whose values match every `(axis, glob)` filter.
    pub fn retain_matching(&mut self, filters: &[(String, String)]) {
        self.cells.retain(|plan| {
            filters.iter().all(|(axis, pattern)| {
                plan.cell
                    .get(axis)
                    .map(|value| glob_match::glob_match(pattern, value))
                    .unwrap_or(false)
            })
        });
    }
}

fn minutes(value: f64) -> Result<Duration> {
    check_timeout(value).map_err(WorkflowError::Invalid)?;
    Duration::try_from_secs_f64(value * 60.0)
        .map_err(|e| WorkflowError::Invalid(format!("timeout_minutes {value}: {e}")))
}

fn resolve_map(
    map: &IndexMap<String, MatrixValue>,
    ctx: &Context<'_>,
) -> Result<IndexMap<String, String>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), interpolate(&v.to_string(), ctx)?)))
        .collect()
}

fn resolve_action(
    index: usize,
    step: &StepSpec,
    with: &IndexMap<String, String>,
    ctx: &Context<'_>,
) -> Result<StepAction> {
    if let Some(script) = &step.run {
        return Ok(StepAction::Run {
            script: interpolate(script, ctx)?,
        });
    }

    let reference = step.uses.as_deref().unwrap_or_default();
    let (action, default_name) =
        BuiltinAction::parse(reference).ok_or_else(|| WorkflowError::UnknownAction {
            index,
            action: reference.to_string(),
        })?;

    match action {
        BuiltinAction::Checkout => Ok(StepAction::Checkout {
            reference: with.get("ref").cloned(),
            path: with.get("path").cloned(),
        }),
        BuiltinAction::SetupInterpreter => {
            let name = with
                .get("name")
                .cloned()
                .or_else(|| default_name.map(str::to_string))
                .ok_or_else(|| WorkflowError::InvalidStep {
                    index,
                    reason: "setup-interpreter requires a `name` input".to_string(),
                })?;
            let version = with
                .get("version")
                .or_else(|| with.get(&format!("{name}-version")))
                .cloned()
                .ok_or_else(|| WorkflowError::InvalidStep {
                    index,
                    reason: format!("setup-interpreter requires `version` or `{name}-version`"),
                })?;
            Ok(StepAction::SetupInterpreter {
                name,
                version,
                path: with.get("path").cloned(),
            })
        }
    }
}

fn plan_step(
    index: usize,
    step: &StepSpec,
    cell: &MatrixCell,
    workflow_env: &IndexMap<String, String>,
    runner_label: &str,
) -> Result<PlannedStep> {
    let outer = Context::new(cell, workflow_env).with_runner_label(runner_label);
    let mut env = workflow_env.clone();
    env.extend(resolve_map(&step.env, &outer)?);

    let ctx = Context::new(cell, &env).with_runner_label(runner_label);
    let with = resolve_map(&step.with, &ctx)?;

    Ok(PlannedStep {
        index,
        name: interpolate(&step.display_name(), &ctx)?,
        action: resolve_action(index, step, &with, &ctx)?,
        working_directory: step
            .working_directory
            .as_deref()
            .map(|dir| interpolate(dir, &ctx))
            .transpose()?,
        timeout: step.timeout_minutes.map(minutes).transpose()?,
        continue_on_error: step.continue_on_error,
        enabled: step.when.as_ref().map(|w| w.holds_for(cell)).unwrap_or(true),
        env,
    })
}

fn plan_cell(
    workflow: &Workflow,
    workflow_digest: &ContentDigest,
    index: usize,
    cell: MatrixCell,
) -> Result<CellPlan> {
    let no_env = IndexMap::new();
    let env = resolve_map(&workflow.env, &Context::new(&cell, &no_env))?;
    let runner_label = interpolate(&workflow.runs_on_template(), &Context::new(&cell, &env))?;

    let steps = workflow
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| plan_step(i, step, &cell, &env, &runner_label))
        .collect::<Result<Vec<_>>>()?;

    let assignment = cell.values().iter().map(|(k, v)| format!("{k}={v}"));
    let spec_digest = ContentDigest::from_parts(
        std::iter::once(workflow_digest.as_str().to_string()).chain(assignment),
    );

    Ok(CellPlan {
        index,
        timeout: minutes(workflow.timeout_minutes.unwrap_or(DEFAULT_TIMEOUT_MINUTES))?,
        cell,
        runner_label,
        env,
        steps,
        spec_digest,
    })
}

/// Plan every cell for `workflow` regardless of triggers.
pub fn plan_all(workflow: &Workflow, event: &Event) -> Result<RunPlan> {
    let workflow_digest = workflow.digest()?;
    let cells = workflow
        .strategy
        .matrix
        .expand()?
        .into_iter()
        .enumerate()
        .map(|(index, cell)| plan_cell(workflow, &workflow_digest, index, cell))
        .collect::<Result<Vec<_>>>()?;

    Ok(RunPlan {
        workflow: workflow.name.clone(),
        workflow_digest,
        event: event.clone(),
        max_parallel: workflow.strategy.max_parallel,
        cells,
    })
}

/// Plan the run an event starts, or `None` when no trigger rule matches.
pub fn plan(workflow: &Workflow, event: &Event) -> Result<Option<RunPlan>> {
    if !workflow.triggers().matches(event) {
        tracing::debug!(
            workflow = %workflow.name,
            event = %event.kind,
            branch = %event.branch,
            "event does not match any trigger"
        );
        return Ok(None);
    }
    plan_all(workflow, event).map(Some)
}
