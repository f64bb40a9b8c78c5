//! matrixci runner
//!
//! Executes planned matrix runs on the local host:
//! - Spawn each step as its own process group with a deadline
//! - Provide the `checkout` and `setup-interpreter` builtin actions
//! - Run each cell's steps fail-fast and record them in a run ledger
//! - Schedule cells as independent tasks and aggregate their verdicts

pub mod actions;
pub mod error;
pub mod gate;
pub mod obs;
pub mod pipeline;
pub mod recording;
pub mod runner;
pub mod scheduler;
pub mod workspace;

pub use error::{Result, RunnerError};
pub use gate::{CiGate, GateVerdict};
pub use pipeline::{
    CellPipeline, CellResult, CellVerdict, FailureKind, RunContext, StepReport, StepStatus,
};
pub use recording::{CellEvent, CellRunRecorder};
pub use runner::{StepCommand, StepOutcome, StepRunner};
pub use scheduler::{MatrixReport, Scheduler};
pub use workspace::CellWorkspace;
