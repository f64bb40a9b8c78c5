//! Error types for cell execution.

use matrixci_core::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("step '{step}' has an empty command")]
    EmptyCommand { step: String },

    #[error("failed to spawn step '{step}': {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for step '{step}': {source}")]
    Wait {
        step: String,
        #[source]
        source: std::io::Error,
    },

    /// Checkout, interpreter or runner-label setup failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
