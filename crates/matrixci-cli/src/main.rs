//! matrixci - run matrix CI workflows locally
//!
//! ## Commands
//!
//! - `validate`: Check a workflow file and show its matrix size
//! - `plan`: Show which cells an event would start
//! - `run`: Execute the cells an event starts; exit status is the verdict
//! - `runs`: Inspect recorded cell runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use matrixci_core::{
    current_branch, plan, plan_all, Event, EventKind, FsRunLedger, RunId, RunLedger, RunPlan,
    RunnerConfig, StepAction, Workflow,
};
use matrixci_runner::{CellVerdict, CiGate, MatrixReport, Scheduler, StepStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "matrixci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run matrix CI workflows on the local host", long_about = None)]
struct Cli {
    /// Enable verbose output (step output is logged at debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding the run ledger
    #[arg(long, global = true, env = "MATRIXCI_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug, Clone)]
struct TriggerArgs {
    /// Event type: push, pull_request or workflow_dispatch
    #[arg(short, long, default_value = "push")]
    event: EventKind,

    /// Branch pushed to, or targeted by the pull request (default: current git branch)
    #[arg(short, long)]
    branch: Option<String>,

    /// Only cells whose axis matches the glob, e.g. `os=ubuntu-*` (repeatable)
    #[arg(long = "cell", value_name = "AXIS=GLOB", value_parser = parse_cell_filter)]
    cells: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file
    Validate {
        /// Workflow file (YAML)
        workflow: PathBuf,
    },

    /// Show the cells an event would start, without running anything
    Plan {
        /// Workflow file (YAML)
        workflow: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Plan every cell even if no trigger rule matches
        #[arg(long)]
        ignore_triggers: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run every cell an event starts
    Run {
        /// Workflow file (YAML)
        workflow: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Source tree copied or cloned by the `checkout` action
        #[arg(long, env = "MATRIXCI_SOURCE_DIR")]
        source: Option<PathBuf>,

        /// Maximum cells running at once
        #[arg(short = 'j', long, env = "MATRIXCI_MAX_PARALLEL")]
        max_parallel: Option<usize>,

        /// Runner labels this host serves, as globs (comma separated or repeated)
        #[arg(long = "host-label", value_delimiter = ',')]
        host_labels: Vec<String>,

        /// Parent directory for cell workspaces
        #[arg(long, env = "MATRIXCI_WORK_ROOT")]
        work_root: Option<PathBuf>,

        /// Keep cell workspaces after the run
        #[arg(long)]
        keep_workspaces: bool,

        /// Let cells share the host HOME, cache and temp directories
        #[arg(long)]
        shared_home: bool,

        /// Output format for the final report
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recorded cell runs, newest first
    List {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one run with its events and gate verdict
    Show {
        /// Run ID
        run_id: String,
    },
}

fn parse_cell_filter(value: &str) -> std::result::Result<(String, String), String> {
    let (axis, pattern) = value
        .split_once('=')
        .ok_or_else(|| format!("expected AXIS=GLOB, got '{value}'"))?;
    let axis = axis.trim();
    if axis.is_empty() {
        return Err(format!("empty axis in '{value}'"));
    }
    Ok((axis.to_string(), pattern.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    matrixci_core::init_tracing(cli.json, level);

    let mut config = RunnerConfig::from_env();
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }

    match cli.command {
        Commands::Validate { workflow } => cmd_validate(&workflow),
        Commands::Plan {
            workflow,
            trigger,
            ignore_triggers,
            format,
        } => cmd_plan(&workflow, &trigger, ignore_triggers, format, &config),
        Commands::Run {
            workflow,
            trigger,
            source,
            max_parallel,
            host_labels,
            work_root,
            keep_workspaces,
            shared_home,
            format,
        } => {
            if let Some(source) = source {
                config = config.with_source_dir(source);
            }
            if let Some(n) = max_parallel {
                config = config.with_max_parallel(n);
            }
            if !host_labels.is_empty() {
                config = config.with_host_labels(host_labels);
            }
            if let Some(root) = work_root {
                config = config.with_work_root(root);
            }
            if keep_workspaces {
                config = config.with_keep_workspaces(true);
            }
            if shared_home {
                config = config.with_shared_home(true);
            }
            cmd_run(&workflow, &trigger, format, config).await
        }
        Commands::Runs { action } => match action {
            RunsAction::List { limit } => cmd_runs_list(&config, limit).await,
            RunsAction::Show { run_id } => cmd_runs_show(&config, &run_id).await,
        },
    }
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let workflow = Workflow::load(path)
        .with_context(|| format!("Failed to load workflow {}", path.display()))?;
    workflow
        .validate()
        .with_context(|| format!("Invalid workflow {}", path.display()))?;
    Ok(workflow)
}

fn resolve_event(trigger: &TriggerArgs, config: &RunnerConfig) -> Result<Event> {
    let branch = match &trigger.branch {
        Some(branch) => branch.clone(),
        None => current_branch(&config.source_dir)
            .context("Cannot determine the current git branch; pass --branch")?,
    };
    Ok(Event::new(trigger.event, branch))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let workflow = load_workflow(path)?;
    let cells = workflow.strategy.matrix.expand()?;

    println!("✓ {} is valid", path.display());
    println!("  Name:     {}", workflow.name);
    println!("  Digest:   {}", workflow.digest()?.short());
    for rule in workflow.triggers().rules() {
        println!("  Trigger:  {}", describe_rule(rule));
    }
    println!("  Cells:    {}", cells.len());
    println!("  Steps:    {}", workflow.steps.len());
    Ok(())
}

fn describe_rule(rule: &matrixci_core::TriggerRule) -> String {
    let mut text = rule.kind.to_string();
    if let Some(branches) = &rule.filter.branches {
        text.push_str(&format!(" on [{}]", branches.join(", ")));
    }
    if !rule.filter.branches_ignore.is_empty() {
        text.push_str(&format!(
            " except [{}]",
            rule.filter.branches_ignore.join(", ")
        ));
    }
    text
}

/// Plan for an event, after applying `--cell` filters. `None` when nothing triggers.
fn build_plan(
    workflow: &Workflow,
    event: &Event,
    filters: &[(String, String)],
    ignore_triggers: bool,
) -> Result<Option<RunPlan>> {
    let planned = if ignore_triggers {
        Some(plan_all(workflow, event)?)
    } else {
        plan(workflow, event)?
    };
    Ok(planned.map(|mut run_plan| {
        run_plan.retain_matching(filters);
        run_plan
    }))
}

fn cmd_plan(
    path: &Path,
    trigger: &TriggerArgs,
    ignore_triggers: bool,
    format: OutputFormat,
    config: &RunnerConfig,
) -> Result<()> {
    let workflow = load_workflow(path)?;
    let event = resolve_event(trigger, config)?;

    let Some(run_plan) = build_plan(&workflow, &event, &trigger.cells, ignore_triggers)? else {
        if format == OutputFormat::Json {
            return print_json(&serde_json::Value::Null);
        }
        println!(
            "No trigger of '{}' matches {} on '{}'; nothing would run.",
            workflow.name, event.kind, event.branch
        );
        return Ok(());
    };

    if format == OutputFormat::Json {
        return print_json(&run_plan);
    }

    println!(
        "Workflow '{}' ({}) for {} on '{}': {} cell(s)",
        run_plan.workflow,
        run_plan.workflow_digest.short(),
        event.kind,
        event.branch,
        run_plan.cells.len()
    );
    for cell in &run_plan.cells {
        println!();
        println!(
            "[{}] {}  (runs on {}, timeout {}s)",
            cell.index,
            cell.label(),
            cell.runner_label,
            cell.timeout.as_secs()
        );
        for step in &cell.steps {
            let marker = if step.enabled { "-" } else { "~" };
            println!("  {} {}: {}", marker, step.name, describe_action(&step.action));
        }
    }
    Ok(())
}

fn describe_action(action: &StepAction) -> String {
    match action {
        StepAction::Run { script } => {
            let first = script.lines().next().unwrap_or_default();
            if script.lines().count() > 1 {
                format!("{first} ...")
            } else {
                first.to_string()
            }
        }
        StepAction::Checkout { reference, path } => format!(
            "checkout{}{}",
            reference
                .as_deref()
                .map(|r| format!(" @{r}"))
                .unwrap_or_default(),
            path.as_deref()
                .map(|p| format!(" into {p}"))
                .unwrap_or_default()
        ),
        StepAction::SetupInterpreter {
            name,
            version,
            path,
        } => match path {
            Some(path) => format!("setup {name} {version} from {path}"),
            None => format!("setup {name} {version}"),
        },
    }
}

/// Plan and execute; `None` when the event triggers nothing.
async fn execute_run(
    path: &Path,
    trigger: &TriggerArgs,
    config: RunnerConfig,
) -> Result<Option<MatrixReport>> {
    let workflow = load_workflow(path)?;
    let event = resolve_event(trigger, &config)?;

    let Some(run_plan) = build_plan(&workflow, &event, &trigger.cells, false)? else {
        info!(
            workflow = %workflow.name,
            event = %event.kind,
            branch = %event.branch,
            "No trigger matched; nothing to run"
        );
        return Ok(None);
    };
    if run_plan.cells.is_empty() {
        anyhow::bail!("No matrix cell matches the --cell filters");
    }

    let ledger = Arc::new(
        FsRunLedger::new(&config.state_dir).with_context(|| {
            format!("Failed to open run ledger at {}", config.state_dir.display())
        })?,
    );
    let report = Scheduler::run(ledger, run_plan, Arc::new(config))
        .await
        .context("Matrix run failed to execute")?;
    Ok(Some(report))
}

async fn cmd_run(
    path: &Path,
    trigger: &TriggerArgs,
    format: OutputFormat,
    config: RunnerConfig,
) -> Result<()> {
    let Some(report) = execute_run(path, trigger, config).await? else {
        if format == OutputFormat::Json {
            return print_json(&serde_json::Value::Null);
        }
        println!("No trigger matched; nothing to run.");
        return Ok(());
    };

    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if report.success() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} of {} cell(s) failed",
            report.failed_count(),
            report.cells.len()
        )
    }
}

fn print_report(report: &MatrixReport) {
    println!(
        "Workflow '{}' for {} on '{}'",
        report.workflow, report.event.kind, report.event.branch
    );
    if let Some(sha) = &report.git_sha {
        println!("Git SHA: {}", sha);
    }
    println!();

    for cell in &report.cells {
        let status = match &cell.verdict {
            CellVerdict::Success => "✓",
            CellVerdict::Failure { .. } => "✗",
            CellVerdict::TimedOut { .. } => "⏱",
        };
        println!(
            "{} {} ({}ms) {}",
            status,
            cell.label(),
            cell.duration_ms,
            cell.run_id
                .as_ref()
                .map(|id| format!("run {}", id))
                .unwrap_or_default()
        );
        for step in &cell.steps {
            let mark = match step.status {
                StepStatus::Passed => "✓",
                StepStatus::Failed if step.continued => "!",
                StepStatus::Failed => "✗",
                StepStatus::TimedOut => "⏱",
                StepStatus::Skipped => "-",
            };
            match step.exit_code {
                Some(code) => println!(
                    "    {} {} ({}ms, exit code: {})",
                    mark, step.name, step.duration_ms, code
                ),
                None => println!("    {} {}", mark, step.name),
            }
        }
        if !cell.verdict.is_success() {
            println!("    → {}", cell.verdict);
            if let Some(failed) = cell
                .steps
                .iter()
                .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::TimedOut) && !s.continued)
            {
                let tail: Vec<&str> = failed.stderr.lines().rev().take(10).collect();
                for line in tail.into_iter().rev() {
                    println!("      {}", line);
                }
            }
        }
        if let Some(dir) = &cell.workspace {
            println!("    workspace kept at {}", dir.display());
        }
    }

    println!();
    println!(
        "Summary: {}/{} cells passed, {} timed out ({}ms)",
        report.passed_count(),
        report.cells.len(),
        report.timed_out_count(),
        report.duration_ms
    );
}

fn open_ledger(config: &RunnerConfig) -> Result<FsRunLedger> {
    FsRunLedger::new(&config.state_dir)
        .with_context(|| format!("Failed to open run ledger at {}", config.state_dir.display()))
}

async fn cmd_runs_list(config: &RunnerConfig, limit: usize) -> Result<()> {
    let ledger = open_ledger(config)?;
    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No runs recorded in {}", config.state_dir.display());
        return Ok(());
    }
    for run in runs.into_iter().take(limit) {
        println!(
            "{}  {:<9} {}  {} [{}]",
            run.run_id,
            format!("{:?}", run.status),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.metadata.workflow,
            run.metadata.cell
        );
    }
    Ok(())
}

async fn cmd_runs_show(config: &RunnerConfig, run_id: &str) -> Result<()> {
    let ledger = open_ledger(config)?;
    let run_id = RunId(run_id.to_string());
    let run = ledger
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run {} not found", run_id))?;
    let events = ledger.get_events(&run_id).await?;

    println!("Run:      {}", run.run_id);
    println!("Workflow: {}", run.metadata.workflow);
    println!("Cell:     {}", run.metadata.cell);
    println!("Runner:   {}", run.metadata.runner_label);
    if let Some(sha) = &run.metadata.git_sha {
        println!("Git SHA:  {}", sha);
    }
    println!("Status:   {:?}", run.status);
    if let Some(summary) = &run.summary {
        println!("Duration: {}ms", summary.duration_ms);
        if let Some(step) = &summary.failed_step {
            println!("Failed:   {}", step);
        }
    }
    println!();

    for event in &events {
        let step = event.payload["step"].as_str().unwrap_or_default();
        println!(
            "  #{:<3} {:<14} {}",
            event.seq,
            event.kind,
            if step.is_empty() {
                event.payload["status"].as_str().unwrap_or_default()
            } else {
                step
            }
        );
    }

    let verdict = CiGate::evaluate(&events);
    println!();
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(())
}
