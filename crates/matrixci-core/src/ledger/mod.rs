//! Run ledger: persistence for cell runs and their events.
//!
//! Every matrix cell execution is one run. The trait is async and
//! backend-agnostic; [`MemoryRunLedger`] backs tests and dry runs,
//! [`FsRunLedger`] keeps history on disk.

mod fs;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub use fs::FsRunLedger;
pub use memory::MemoryRunLedger;

/// Result type for ledger operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex produced
/// by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of ordered parts, NUL-separated so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_ref());
            hasher.update(b"\0");
        }
        ContentDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a cell run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Workflow name
    pub workflow: String,
    /// Human-readable cell label (`os=..., python-version=...`)
    pub cell: String,
    /// Runner label the cell was scheduled on
    pub runner_label: String,
    /// Git SHA of the source at run time
    pub git_sha: Option<String>,
    /// Arbitrary key-value tags (event, matrix values, ...)
    pub tags: serde_json::Value,
}

/// A single event in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "cell_started", "step_started", "step_failed")
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_events: u64,
    pub duration_ms: u64,
    pub success: bool,
    /// Name of the step that decided a failure, if any
    pub failed_step: Option<String>,
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub spec_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    fn new(spec_digest: &ContentDigest, metadata: RunMetadata) -> Self {
        Self {
            run_id: RunId::new(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move a running record into a terminal status.
    fn finish(&mut self, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        self.ensure_running()?;
        self.status = status;
        self.summary = Some(summary);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_running(&self) -> StorageResult<()> {
        if self.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: self.run_id.0.clone(),
                status: format!("{:?}", self.status),
                expected: "Running".to_string(),
            });
        }
        Ok(())
    }
}

/// Cell run ledger.
///
/// Guarantees:
/// - Events are returned ordered by `seq`.
/// - A run transitions Running → Completed | Failed | TimedOut (terminal).
/// - Terminal runs reject further events.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run, returning its unique ID.
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Move a run to a terminal status with a summary.
    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()>;

    /// Mark a run as completed.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish_run(run_id, RunStatus::Completed, summary).await
    }

    /// Mark a run as failed.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish_run(run_id, RunStatus::Failed, summary).await
    }

    /// Mark a run as timed out.
    async fn time_out_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish_run(run_id, RunStatus::TimedOut, summary).await
    }

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs newest first, optionally filtered by spec digest.
    async fn list_runs(&self, spec_digest: Option<&ContentDigest>)
        -> StorageResult<Vec<RunRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_from_bytes() {
        let d = ContentDigest::from_bytes(b"hello");
        assert_eq!(d.as_str().len(), 64);
        assert_eq!(d.short().len(), 12);
        assert_eq!(d, ContentDigest::from_bytes(b"hello"));
    }

    #[test]
    fn test_digest_parts_are_separated() {
        let a = ContentDigest::from_parts(["ab", "c"]);
        let b = ContentDigest::from_parts(["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_try_from_validates() {
        assert!(ContentDigest::try_from("xyz".to_string()).is_err());
        let upper = "A".repeat(64);
        let d = ContentDigest::try_from(upper).unwrap();
        assert_eq!(d.as_str(), "a".repeat(64));
    }

    #[test]
    fn test_digest_serde_roundtrip_rejects_garbage() {
        let d = ContentDigest::from_bytes(b"x");
        let json = serde_json::to_string(&d).unwrap();
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        assert!(serde_json::from_str::<ContentDigest>("\"nothex\"").is_err());
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
