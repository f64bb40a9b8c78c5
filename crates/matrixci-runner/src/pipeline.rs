//! Fail-fast execution of one matrix cell and its run recording.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use matrixci_core::{
    CellPlan, ContentDigest, Event, MatrixCell, PlannedStep, RunId, RunLedger, RunMetadata,
    RunStatus, RunnerConfig, StepAction,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn, Instrument};

use crate::actions;
use crate::error::RunnerError;
use crate::obs;
use crate::recording::{CellEvent, CellRunRecorder};
use crate::runner::{StepCommand, StepOutcome, StepRunner};
use crate::workspace::CellWorkspace;

/// Run-wide facts shared by every cell of one trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub workflow: String,
    pub workflow_digest: ContentDigest,
    pub event: Event,
    /// HEAD of the source tree, when it is a git repository.
    pub git_sha: Option<String>,
}

/// Why a cell failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Checkout, interpreter setup or an unserved runner label.
    Provisioning,
    /// A step exited non-zero.
    Step,
    /// A step's process could not be started.
    Spawn,
    /// A step exceeded its own `timeout_minutes`.
    Timeout,
    /// The runner itself failed (ledger, task panic).
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Provisioning => "provisioning",
            FailureKind::Step => "step",
            FailureKind::Spawn => "spawn",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CellVerdict {
    Success,
    Failure {
        kind: FailureKind,
        step: Option<String>,
        message: String,
    },
    /// The cell's wall-clock timeout expired.
    TimedOut {
        step: Option<String>,
        timeout_secs: u64,
    },
}

impl CellVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, CellVerdict::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CellVerdict::Success => "completed",
            CellVerdict::Failure { .. } => "failed",
            CellVerdict::TimedOut { .. } => "timed_out",
        }
    }

    /// Ledger status for this verdict.
    pub fn run_status(&self) -> RunStatus {
        match self {
            CellVerdict::Success => RunStatus::Completed,
            CellVerdict::Failure { .. } => RunStatus::Failed,
            CellVerdict::TimedOut { .. } => RunStatus::TimedOut,
        }
    }

    /// Step that decided the verdict, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            CellVerdict::Success => None,
            CellVerdict::Failure { step, .. } | CellVerdict::TimedOut { step, .. } => {
                step.as_deref()
            }
        }
    }
}

impl std::fmt::Display for CellVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellVerdict::Success => write!(f, "success"),
            CellVerdict::Failure { kind, message, .. } => write!(f, "{kind} failure: {message}"),
            CellVerdict::TimedOut { step, timeout_secs } => match step {
                Some(step) => write!(f, "timed out after {timeout_secs}s in '{step}'"),
                None => write!(f, "timed out after {timeout_secs}s"),
            },
        }
    }
}

/// How a single step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// Per-step entry of a [`CellResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    /// Failure tolerated through `continue_on_error`.
    pub continued: bool,
}

impl StepReport {
    fn skipped(step: &PlannedStep) -> Self {
        Self {
            index: step.index,
            name: step.name.clone(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            continued: false,
        }
    }
}

/// Outcome of one cell run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellResult {
    pub index: usize,
    /// Ledger run, absent only when the run could not be created.
    pub run_id: Option<RunId>,
    pub cell: MatrixCell,
    pub runner_label: String,
    pub verdict: CellVerdict,
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
    /// Kept workspace directory.
    pub workspace: Option<PathBuf>,
}

impl CellResult {
    pub fn passed(&self) -> bool {
        self.verdict.is_success()
    }

    pub fn label(&self) -> String {
        self.cell.label()
    }

    /// Result for a cell whose run never got going.
    pub fn internal_failure(plan: &CellPlan, message: String) -> Self {
        Self {
            index: plan.index,
            run_id: None,
            cell: plan.cell.clone(),
            runner_label: plan.runner_label.clone(),
            verdict: CellVerdict::Failure {
                kind: FailureKind::Internal,
                step: None,
                message,
            },
            steps: plan.steps.iter().map(StepReport::skipped).collect(),
            duration_ms: 0,
            workspace: None,
        }
    }
}

/// How a step that did not pass failed.
struct StepFailure {
    kind: FailureKind,
    message: String,
    outcome: Option<StepOutcome>,
}

impl StepFailure {
    fn from_error(err: RunnerError) -> Self {
        let kind = match &err {
            RunnerError::Provisioning(_) | RunnerError::Workspace(_) => FailureKind::Provisioning,
            RunnerError::Spawn { .. } | RunnerError::EmptyCommand { .. } => FailureKind::Spawn,
            RunnerError::Wait { .. } | RunnerError::Storage(_) => FailureKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
            outcome: None,
        }
    }

    fn from_outcome(outcome: StepOutcome, step_timeout: Option<Duration>) -> Self {
        let (kind, message) = if outcome.timed_out {
            let secs = step_timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
            (FailureKind::Timeout, format!("timed out after {secs:.0}s"))
        } else {
            (
                FailureKind::Step,
                format!("exited with code {}", outcome.exit_code),
            )
        };
        Self {
            kind,
            message,
            outcome: Some(outcome),
        }
    }
}

/// Executes one cell: fail-fast over its steps under the cell deadline.
pub struct CellPipeline;

impl CellPipeline {
    /// Execute a cell plan and record it as one ledger run.
    ///
    /// Each step produces:
    /// - `step_started`, then `step_finished` or `step_failed`
    /// - or only `step_skipped` when a condition, an earlier failure or the
    ///   timeout keeps it from running
    ///
    /// The run ends with `cell_finished` and is finalized as Completed, Failed
    /// or TimedOut. Step failures are verdicts, not errors; `Err` means the
    /// ledger could not be written.
    pub async fn run(
        ledger: Arc<dyn RunLedger>,
        ctx: &RunContext,
        plan: &CellPlan,
        config: &RunnerConfig,
    ) -> anyhow::Result<CellResult> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + plan.timeout;
        let label = plan.label();

        let metadata = RunMetadata {
            workflow: ctx.workflow.clone(),
            cell: label.clone(),
            runner_label: plan.runner_label.clone(),
            git_sha: ctx.git_sha.clone(),
            tags: json!({
                "event": ctx.event.kind.as_str(),
                "branch": &ctx.event.branch,
                "matrix": &plan.cell,
                "workflow_digest": ctx.workflow_digest.as_str(),
            }),
        };

        let recorder = CellRunRecorder::start(ledger, &plan.spec_digest, metadata).await?;
        let run_id = recorder.run_id().clone();
        let span = obs::cell_span(&run_id.to_string(), &label);

        Self::execute(recorder, ctx, plan, config, started, deadline)
            .instrument(span)
            .await
    }

    async fn execute(
        mut recorder: CellRunRecorder,
        ctx: &RunContext,
        plan: &CellPlan,
        config: &RunnerConfig,
        started: Instant,
        deadline: tokio::time::Instant,
    ) -> anyhow::Result<CellResult> {
        let run_id = recorder.run_id().clone();
        let run_id_str = run_id.to_string();
        let label = plan.label();

        obs::emit_cell_started(&run_id_str, &label, &plan.runner_label);
        recorder
            .record(&CellEvent::CellStarted {
                runner_label: plan.runner_label.clone(),
                event: ctx.event.kind.to_string(),
                branch: ctx.event.branch.clone(),
                timeout_secs: plan.timeout.as_secs(),
            })
            .await?;

        let mut verdict = CellVerdict::Success;
        let mut halted: Option<String> = None;
        let mut reports = Vec::with_capacity(plan.steps.len());

        let mut workspace = None;
        if !config.serves_label(&plan.runner_label) {
            let message = format!(
                "runner label '{}' is not served by this host",
                plan.runner_label
            );
            warn!(runner_label = %plan.runner_label, "no runner for cell");
            halted = Some(message.clone());
            verdict = CellVerdict::Failure {
                kind: FailureKind::Provisioning,
                step: None,
                message,
            };
        } else {
            match CellWorkspace::create(config, &run_id, &ctx.event, plan) {
                Ok(ws) => workspace = Some(ws),
                Err(e) => {
                    let message = format!("cannot create cell workspace: {e}");
                    halted = Some(message.clone());
                    verdict = CellVerdict::Failure {
                        kind: FailureKind::Provisioning,
                        step: None,
                        message,
                    };
                }
            }
        }

        let runner = StepRunner::from_config(config);

        for step in &plan.steps {
            if halted.is_none() && tokio::time::Instant::now() >= deadline {
                verdict = CellVerdict::TimedOut {
                    step: None,
                    timeout_secs: plan.timeout.as_secs(),
                };
                halted = Some("cell timed out".to_string());
            }

            let skip_reason = halted
                .clone()
                .or_else(|| (!step.enabled).then(|| "condition not met".to_string()));
            let ws = match (skip_reason, workspace.as_mut()) {
                (None, Some(ws)) => ws,
                (reason, _) => {
                    recorder
                        .record(&CellEvent::StepSkipped {
                            index: step.index,
                            step: step.name.clone(),
                            reason: reason.unwrap_or_else(|| "no workspace".to_string()),
                        })
                        .await?;
                    reports.push(StepReport::skipped(step));
                    continue;
                }
            };

            info!(step = %step.name, "executing step");
            recorder
                .record(&CellEvent::StepStarted {
                    index: step.index,
                    step: step.name.clone(),
                    action: action_name(&step.action).to_string(),
                })
                .await?;

            let step_deadline = match step.timeout {
                Some(timeout) => deadline.min(tokio::time::Instant::now() + timeout),
                None => deadline,
            };

            let failure = match Self::execute_step(&runner, config, ws, step, step_deadline).await {
                Ok(outcome) if outcome.passed() => {
                    recorder
                        .record(&CellEvent::StepFinished {
                            index: step.index,
                            step: step.name.clone(),
                            exit_code: outcome.exit_code,
                            duration_ms: outcome.duration_ms,
                            stdout: outcome.stdout.clone(),
                            stderr: outcome.stderr.clone(),
                        })
                        .await?;
                    reports.push(StepReport {
                        index: step.index,
                        name: step.name.clone(),
                        status: StepStatus::Passed,
                        exit_code: Some(outcome.exit_code),
                        duration_ms: outcome.duration_ms,
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        continued: false,
                    });
                    continue;
                }
                Ok(outcome) => StepFailure::from_outcome(outcome, step.timeout),
                Err(e) => StepFailure::from_error(e),
            };

            // Whatever failed, a passed cell deadline makes the cell time out.
            let cell_timed_out = tokio::time::Instant::now() >= deadline;
            let continued = step.continue_on_error && !cell_timed_out;
            let timed_out = cell_timed_out
                || failure.outcome.as_ref().map(|o| o.timed_out).unwrap_or(false);
            let message = if cell_timed_out {
                format!("cell timed out after {}s", plan.timeout.as_secs())
            } else {
                failure.message.clone()
            };

            let (exit_code, duration_ms, stdout, stderr) = match failure.outcome {
                Some(o) => (o.exit_code, o.duration_ms, o.stdout, o.stderr),
                None => (-1, 0, String::new(), failure.message.clone()),
            };

            recorder
                .record(&CellEvent::StepFailed {
                    index: step.index,
                    step: step.name.clone(),
                    exit_code,
                    duration_ms,
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                    error: message.clone(),
                    timed_out,
                    continued,
                })
                .await?;
            reports.push(StepReport {
                index: step.index,
                name: step.name.clone(),
                status: if timed_out {
                    StepStatus::TimedOut
                } else {
                    StepStatus::Failed
                },
                exit_code: Some(exit_code),
                duration_ms,
                stdout,
                stderr,
                continued,
            });

            if continued {
                warn!(step = %step.name, error = %message, "step failed, continuing");
                continue;
            }

            info!(step = %step.name, error = %message, "step failed, halting cell");
            if cell_timed_out {
                verdict = CellVerdict::TimedOut {
                    step: Some(step.name.clone()),
                    timeout_secs: plan.timeout.as_secs(),
                };
                halted = Some("cell timed out".to_string());
            } else {
                verdict = CellVerdict::Failure {
                    kind: failure.kind,
                    step: Some(step.name.clone()),
                    message: message.clone(),
                };
                halted = Some(format!("step '{}' failed", step.name));
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        recorder
            .record(&CellEvent::CellFinished {
                status: verdict.as_str().to_string(),
                duration_ms,
            })
            .await?;

        let failed_step = verdict.step().map(str::to_string);
        if let Err(e) = recorder
            .finish(verdict.run_status(), duration_ms, failed_step)
            .await
        {
            obs::emit_run_finalize_error(&run_id_str, &e);
            return Err(e.into());
        }

        let workspace = workspace.and_then(|ws| ws.finish(config.keep_workspaces));
        obs::emit_cell_finished(&run_id_str, &label, verdict.as_str(), duration_ms);

        Ok(CellResult {
            index: plan.index,
            run_id: Some(run_id),
            cell: plan.cell.clone(),
            runner_label: plan.runner_label.clone(),
            verdict,
            steps: reports,
            duration_ms,
            workspace,
        })
    }

    async fn execute_step(
        runner: &StepRunner,
        config: &RunnerConfig,
        workspace: &mut CellWorkspace,
        step: &PlannedStep,
        deadline: tokio::time::Instant,
    ) -> crate::error::Result<StepOutcome> {
        match &step.action {
            StepAction::Run { script } => {
                let mut argv = config.shell.clone();
                argv.push(script.clone());
                let cmd = StepCommand::new(
                    step.name.clone(),
                    argv,
                    workspace.resolve_dir(step.working_directory.as_deref()),
                )
                .with_env(workspace.step_env(&step.env));
                runner.execute(&cmd, Some(deadline)).await
            }
            StepAction::Checkout { reference, path } => {
                actions::checkout(
                    runner,
                    config,
                    workspace,
                    &step.name,
                    reference.as_deref(),
                    path.as_deref(),
                    Some(deadline),
                )
                .await
            }
            StepAction::SetupInterpreter {
                name,
                version,
                path,
            } => {
                actions::setup_interpreter(
                    runner,
                    workspace,
                    &step.name,
                    name,
                    version,
                    path.as_deref(),
                    Some(deadline),
                )
                .await
            }
        }
    }
}

fn action_name(action: &StepAction) -> &'static str {
    match action {
        StepAction::Run { .. } => "run",
        StepAction::Checkout { .. } => "checkout",
        StepAction::SetupInterpreter { .. } => "setup-interpreter",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use matrixci_core::{plan_all, MemoryRunLedger, Workflow};
    use pretty_assertions::assert_eq;

    fn context(workflow: &Workflow) -> RunContext {
        RunContext {
            workflow: workflow.name.clone(),
            workflow_digest: workflow.digest().unwrap(),
            event: Event::push("main"),
            git_sha: None,
        }
    }

    async fn run_single(yaml: &str, config: &RunnerConfig) -> (CellResult, Arc<MemoryRunLedger>) {
        let workflow = Workflow::from_yaml(yaml).unwrap();
        let plan = plan_all(&workflow, &Event::push("main")).unwrap();
        let ledger = Arc::new(MemoryRunLedger::new());
        let result = CellPipeline::run(ledger.clone(), &context(&workflow), &plan.cells[0], config)
            .await
            .unwrap();
        (result, ledger)
    }

    fn statuses(result: &CellResult) -> Vec<StepStatus> {
        result.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_all_steps_pass() {
        let yaml = "name: ok\non: push\nsteps:\n  - run: echo one\n  - run: echo two\n";
        let (result, ledger) = run_single(yaml, &RunnerConfig::default()).await;

        assert!(result.passed());
        assert_eq!(statuses(&result), vec![StepStatus::Passed, StepStatus::Passed]);
        assert!(result.steps[1].stdout.contains("two"));
        assert!(result.workspace.is_none());

        let run_id = result.run_id.unwrap();
        let record = ledger.get_run(&run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        let kinds: Vec<_> = ledger
            .get_events(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                "cell_started",
                "step_started",
                "step_finished",
                "step_started",
                "step_finished",
                "cell_finished"
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let yaml = "name: ff\non: push\nsteps:\n  - run: echo one\n  - name: Broken\n    run: exit 4\n  - run: echo three\n";
        let (result, ledger) = run_single(yaml, &RunnerConfig::default()).await;

        assert_eq!(
            result.verdict,
            CellVerdict::Failure {
                kind: FailureKind::Step,
                step: Some("Broken".to_string()),
                message: "exited with code 4".to_string(),
            }
        );
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
        );

        let run_id = result.run_id.unwrap();
        let record = ledger.get_run(&run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.summary.unwrap().failed_step.as_deref(), Some("Broken"));
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_going() {
        let yaml = "name: coe\non: push\nsteps:\n  - run: exit 1\n    continue_on_error: true\n  - run: echo after\n";
        let (result, _) = run_single(yaml, &RunnerConfig::default()).await;

        assert!(result.passed());
        assert!(result.steps[0].continued);
        assert_eq!(result.steps[1].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_disabled_step_is_skipped() {
        let yaml = "name: when\non: push\nstrategy:\n  matrix:\n    os: [linux]\nsteps:\n  - run: exit 1\n    when:\n      matrix:\n        os: \"macos-*\"\n  - run: echo ok\n";
        let (result, _) = run_single(yaml, &RunnerConfig::default()).await;

        assert!(result.passed());
        assert_eq!(statuses(&result), vec![StepStatus::Skipped, StepStatus::Passed]);
    }

    #[tokio::test]
    async fn test_unserved_label_is_provisioning_failure() {
        let yaml = "name: label\non: push\nruns_on: windows-latest\nsteps:\n  - run: echo hi\n";
        let config = RunnerConfig::default().with_host_labels(vec!["ubuntu-*".to_string()]);
        let (result, _) = run_single(yaml, &config).await;

        assert!(matches!(
            result.verdict,
            CellVerdict::Failure {
                kind: FailureKind::Provisioning,
                ..
            }
        ));
        assert_eq!(statuses(&result), vec![StepStatus::Skipped]);
    }

    #[tokio::test]
    async fn test_step_timeout_is_failure_not_cell_timeout() {
        let yaml = "name: st\non: push\nsteps:\n  - run: sleep 30\n    timeout_minutes: 0.005\n  - run: echo never\n";
        let mut config = RunnerConfig::default();
        config.kill_grace = Duration::from_millis(200);
        let (result, _) = run_single(yaml, &config).await;

        assert!(matches!(
            result.verdict,
            CellVerdict::Failure {
                kind: FailureKind::Timeout,
                ..
            }
        ));
        assert_eq!(
            statuses(&result),
            vec![StepStatus::TimedOut, StepStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn test_cell_timeout() {
        let yaml = "name: ct\non: push\ntimeout_minutes: 0.005\nsteps:\n  - name: Slow\n    run: sleep 30\n    continue_on_error: true\n  - run: echo never\n";
        let mut config = RunnerConfig::default();
        config.kill_grace = Duration::from_millis(200);
        let (result, ledger) = run_single(yaml, &config).await;

        assert_eq!(
            result.verdict,
            CellVerdict::TimedOut {
                step: Some("Slow".to_string()),
                timeout_secs: 0,
            }
        );
        assert!(!result.steps[0].continued);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);

        let record = ledger.get_run(result.run_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(record.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_keep_workspace() {
        let yaml = "name: keep\non: push\nsteps:\n  - run: echo kept > marker.txt\n";
        let config = RunnerConfig::default().with_keep_workspaces(true);
        let (result, _) = run_single(yaml, &config).await;

        let root = result.workspace.unwrap();
        assert!(root.join("workspace/marker.txt").is_file());
        std::fs::remove_dir_all(root).unwrap();
    }
}
