//! Matrix scheduling: every cell as an independent tokio task.
//!
//! Cells share nothing but the ledger. Concurrency is bounded by a semaphore;
//! a failing or panicking cell only ever changes its own verdict.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use matrixci_core::{git, ContentDigest, Event, RunLedger, RunPlan, RunnerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::obs;
use crate::pipeline::{CellPipeline, CellResult, CellVerdict, RunContext};

/// Aggregate outcome of one triggered run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    pub workflow: String,
    pub workflow_digest: ContentDigest,
    pub event: Event,
    pub git_sha: Option<String>,
    /// Cell results in matrix order.
    pub cells: Vec<CellResult>,
    pub duration_ms: u64,
}

impl MatrixReport {
    /// True when every cell succeeded.
    pub fn success(&self) -> bool {
        self.cells.iter().all(CellResult::passed)
    }

    pub fn passed_count(&self) -> usize {
        self.cells.iter().filter(|c| c.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.cells.len() - self.passed_count()
    }

    pub fn timed_out_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| matches!(c.verdict, CellVerdict::TimedOut { .. }))
            .count()
    }
}

/// Runs all cells of a [`RunPlan`].
pub struct Scheduler;

impl Scheduler {
    /// Effective concurrency: the workflow's `max_parallel` never raises the host limit.
    pub fn concurrency(plan: &RunPlan, config: &RunnerConfig) -> usize {
        plan.max_parallel
            .map(|n| n.min(config.max_parallel))
            .unwrap_or(config.max_parallel)
            .max(1)
    }

    /// Execute every cell and collect their verdicts.
    ///
    /// Only failing to set up the run is an error; cell failures, including
    /// panics and ledger errors inside a cell, become that cell's verdict.
    pub async fn run(
        ledger: Arc<dyn RunLedger>,
        plan: RunPlan,
        config: Arc<RunnerConfig>,
    ) -> anyhow::Result<MatrixReport> {
        let started = Instant::now();
        let git_sha = if git::is_git_repo(&config.source_dir) {
            git::capture_head_sha(&config.source_dir).ok()
        } else {
            None
        };

        let ctx = Arc::new(RunContext {
            workflow: plan.workflow.clone(),
            workflow_digest: plan.workflow_digest.clone(),
            event: plan.event.clone(),
            git_sha: git_sha.clone(),
        });

        let limit = Self::concurrency(&plan, &config);
        let semaphore = Arc::new(Semaphore::new(limit));
        info!(
            workflow = %plan.workflow,
            cells = plan.cells.len(),
            max_parallel = limit,
            "Starting matrix run"
        );

        let handles: Vec<_> = plan
            .cells
            .iter()
            .cloned()
            .map(|cell| {
                let ledger = Arc::clone(&ledger);
                let ctx = Arc::clone(&ctx);
                let config = Arc::clone(&config);
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await?;
                    CellPipeline::run(ledger, &ctx, &cell, &config).await
                })
            })
            .collect();

        let mut cells = Vec::with_capacity(handles.len());
        for (cell, joined) in plan.cells.iter().zip(join_all(handles).await) {
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(cell = %cell.label(), error = %e, "cell run failed internally");
                    CellResult::internal_failure(cell, format!("{e:#}"))
                }
                Err(e) => {
                    warn!(cell = %cell.label(), error = %e, "cell task aborted");
                    CellResult::internal_failure(cell, format!("cell task aborted: {e}"))
                }
            };
            cells.push(result);
        }
        cells.sort_by_key(|c| c.index);

        let report = MatrixReport {
            workflow: plan.workflow,
            workflow_digest: plan.workflow_digest,
            event: plan.event,
            git_sha,
            cells,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        obs::emit_matrix_finished(
            &report.workflow,
            report.cells.len(),
            report.failed_count(),
            report.duration_ms,
        );
        Ok(report)
    }
}
