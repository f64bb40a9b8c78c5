//! matrixci core library
//!
//! Workflow model and the pure half of a matrix CI run:
//! - Load and validate workflow files (triggers, matrix strategy, steps)
//! - Decide whether an event triggers a run
//! - Expand the matrix and resolve `${{ }}` references per cell
//! - Persist cell runs and their events in a run ledger

pub mod config;
pub mod error;
pub mod expr;
pub mod git;
pub mod ledger;
pub mod plan;
pub mod telemetry;
pub mod workflow;

pub use config::RunnerConfig;
pub use error::{GitError, StorageError, WorkflowError};
pub use git::{capture_head_sha, current_branch, is_git_repo, toplevel};
pub use ledger::{
    ContentDigest, FsRunLedger, MemoryRunLedger, RunEvent, RunId, RunLedger, RunMetadata,
    RunRecord, RunStatus, RunSummary, StorageResult,
};
pub use plan::{plan, plan_all, CellPlan, PlannedStep, RunPlan, StepAction};
pub use telemetry::init_tracing;
pub use workflow::{
    BranchFilter, BuiltinAction, Event, EventKind, MatrixCell, MatrixSpec, MatrixValue,
    StepCondition, StepSpec, Strategy, TriggerRule, TriggerSet, TriggerSpec, Workflow,
};
