//! Structured observability hooks for cell run lifecycle events.
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered or aggregated when `--json` logging is on.

use tracing::info;

/// Span covering one cell run; attach with `Instrument::instrument`.
pub fn cell_span(run_id: &str, cell: &str) -> tracing::Span {
    tracing::info_span!("matrixci.cell", run_id = %run_id, cell = %cell)
}

pub fn emit_cell_started(run_id: &str, cell: &str, runner_label: &str) {
    info!(
        event = "cell.started",
        run_id = %run_id,
        cell = %cell,
        runner_label = %runner_label,
    );
}

pub fn emit_cell_finished(run_id: &str, cell: &str, status: &str, duration_ms: u64) {
    info!(
        event = "cell.finished",
        run_id = %run_id,
        cell = %cell,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_event_appended(run_id: &str, event_kind: &str, seq: u64) {
    tracing::debug!(event = "run.event_appended", run_id = %run_id, kind = %event_kind, seq = seq);
}

pub fn emit_matrix_finished(workflow: &str, cells: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "matrix.finished",
        workflow = %workflow,
        cells = cells,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}
