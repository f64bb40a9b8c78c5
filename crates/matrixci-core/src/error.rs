//! Error taxonomy for matrixci-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, validating or planning a workflow.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("failed to read workflow {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("invalid workflow: {0}")]
    Invalid(String),

    #[error("matrix axis '{axis}' has no values")]
    EmptyAxis { axis: String },

    #[error("matrix expands to no cells")]
    EmptyMatrix,

    #[error("matrix expands to {count} cells, limit is {max}")]
    TooManyCells { count: usize, max: usize },

    #[error("step {index}: unknown action '{action}'")]
    UnknownAction { index: usize, action: String },

    #[error("step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("malformed expression in '{template}': {reason}")]
    Expression { template: String, reason: String },

    #[error("unknown reference '{reference}'")]
    UnknownReference { reference: String },
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors that can occur in the run ledger.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from git helpers.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("git {command} returned empty output")]
    EmptyOutput { command: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = WorkflowError::TooManyCells { count: 300, max: 256 };
        assert_eq!(err.to_string(), "matrix expands to 300 cells, limit is 256");

        let err = StorageError::InvalidRunState {
            run_id: "r1".to_string(),
            status: "Completed".to_string(),
            expected: "Running".to_string(),
        };
        assert!(err.to_string().contains("expected Running"));
    }
}
