//! Cell lifecycle adapter: turns [`CellEvent`]s into [`RunLedger`] records.

use std::sync::Arc;

use chrono::Utc;
use matrixci_core::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunStatus, RunSummary, StorageResult,
};
use serde::{Deserialize, Serialize};

use crate::obs;

/// Things that happen while a cell runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellEvent {
    CellStarted {
        runner_label: String,
        event: String,
        branch: String,
        timeout_secs: u64,
    },
    StepStarted {
        index: usize,
        step: String,
        action: String,
    },
    StepFinished {
        index: usize,
        step: String,
        exit_code: i32,
        duration_ms: u64,
        stdout: String,
        stderr: String,
    },
    StepFailed {
        index: usize,
        step: String,
        exit_code: i32,
        duration_ms: u64,
        stdout: String,
        stderr: String,
        error: String,
        timed_out: bool,
        /// `continue_on_error` let the cell go on.
        continued: bool,
    },
    StepSkipped {
        index: usize,
        step: String,
        reason: String,
    },
    CellFinished {
        status: String,
        duration_ms: u64,
    },
}

impl CellEvent {
    /// snake_case kind, as stored in [`RunEvent::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            CellEvent::CellStarted { .. } => "cell_started",
            CellEvent::StepStarted { .. } => "step_started",
            CellEvent::StepFinished { .. } => "step_finished",
            CellEvent::StepFailed { .. } => "step_failed",
            CellEvent::StepSkipped { .. } => "step_skipped",
            CellEvent::CellFinished { .. } => "cell_finished",
        }
    }

    fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
        }
        value
    }
}

/// Records the events of one cell run into a [`RunLedger`].
///
/// Usage:
/// 1. [`CellRunRecorder::start`] creates the run.
/// 2. [`CellRunRecorder::record`] appends each event with the next sequence number.
/// 3. [`CellRunRecorder::finish`] moves the run to its terminal status.
pub struct CellRunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
}

impl CellRunRecorder {
    /// Start a new run in the ledger, returning a recorder bound to it.
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let run_id = ledger.create_run(spec_digest, metadata).await?;
        Ok(Self {
            ledger,
            run_id,
            seq: 0,
        })
    }

    /// Append an event to the run.
    pub async fn record(&mut self, event: &CellEvent) -> StorageResult<()> {
        self.seq += 1;
        let kind = event.kind();
        let run_event = RunEvent {
            seq: self.seq,
            kind: kind.to_string(),
            payload: event.payload(),
            timestamp: Utc::now(),
        };
        obs::emit_event_appended(&self.run_id.to_string(), kind, self.seq);
        self.ledger.append_event(&self.run_id, run_event).await
    }

    /// Finalize the run.
    pub async fn finish(
        self,
        status: RunStatus,
        duration_ms: u64,
        failed_step: Option<String>,
    ) -> StorageResult<()> {
        let summary = RunSummary {
            total_events: self.seq,
            duration_ms,
            success: status == RunStatus::Completed,
            failed_step,
        };
        self.ledger.finish_run(&self.run_id, status, summary).await
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixci_core::MemoryRunLedger;
    use serde_json::json;

    fn metadata() -> RunMetadata {
        RunMetadata {
            workflow: "wf".to_string(),
            cell: "os=ubuntu-22.04".to_string(),
            runner_label: "ubuntu-22.04".to_string(),
            git_sha: None,
            tags: json!({}),
        }
    }

    #[test]
    fn test_payload_drops_type_tag() {
        let event = CellEvent::StepSkipped {
            index: 3,
            step: "Install".to_string(),
            reason: "previous step failed".to_string(),
        };
        assert_eq!(event.kind(), "step_skipped");
        assert_eq!(
            event.payload(),
            json!({"index": 3, "step": "Install", "reason": "previous step failed"})
        );
    }

    #[tokio::test]
    async fn test_recorder_sequences_and_finishes() {
        let ledger = Arc::new(MemoryRunLedger::new());
        let digest = ContentDigest::from_bytes(b"cell");
        let mut recorder = CellRunRecorder::start(ledger.clone(), &digest, metadata())
            .await
            .unwrap();
        let run_id = recorder.run_id().clone();

        recorder
            .record(&CellEvent::StepStarted {
                index: 0,
                step: "Checkout".to_string(),
                action: "checkout".to_string(),
            })
            .await
            .unwrap();
        recorder
            .record(&CellEvent::CellFinished {
                status: "completed".to_string(),
                duration_ms: 5,
            })
            .await
            .unwrap();
        recorder
            .finish(RunStatus::Completed, 5, None)
            .await
            .unwrap();

        let events = ledger.get_events(&run_id).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(events[0].kind, "step_started");

        let record = ledger.get_run(&run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.summary.unwrap().total_events, 2);
    }
}
