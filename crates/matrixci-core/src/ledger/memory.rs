//! In-memory run ledger.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
use crate::error::StorageError;

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(run_id: &RunId) -> StorageError {
    StorageError::RunNotFound {
        run_id: run_id.0.clone(),
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let record = RunRecord::new(spec_digest, metadata);
        let run_id = record.run_id.clone();
        let mut runs = self.runs.lock().await;
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().await;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        state.record.ensure_running()?;
        state.events.push(event);
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().await;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        state.record.finish(status, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().await;
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| not_found(run_id))
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().await;
        let state = runs.get(&run_id.0).ok_or_else(|| not_found(run_id))?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().await;
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| spec_digest.map(|d| s.record.spec_digest == *d).unwrap_or(true))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
