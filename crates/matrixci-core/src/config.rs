//! Runner configuration.
//!
//! Defaults are overridden by `MATRIXCI_*` environment variables and then by
//! command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cell timeout when a workflow does not set `timeout_minutes`.
pub const DEFAULT_TIMEOUT_MINUTES: f64 = 360.0;

/// Largest accepted `timeout_minutes` (35 days).
pub const MAX_TIMEOUT_MINUTES: f64 = 35.0 * 24.0 * 60.0;

/// Default number of cells allowed to run at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default bytes of stdout/stderr kept per step.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Settings for executing a planned run on the local host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Directory holding the run ledger.
    pub state_dir: PathBuf,

    /// Source tree copied into each cell by the `checkout` action.
    pub source_dir: PathBuf,

    /// Parent directory for per-cell workspaces (system temp dir when `None`).
    pub work_root: Option<PathBuf>,

    /// Maximum number of cells running at once.
    pub max_parallel: usize,

    /// Runner labels this host serves, as glob patterns. Empty serves every label.
    pub host_labels: Vec<String>,

    /// Shell used for `run` steps; the script is appended as the last argument.
    pub shell: Vec<String>,

    /// Keep cell workspaces after the run instead of deleting them.
    pub keep_workspaces: bool,

    /// Let cells use the host's `HOME`, `XDG_CACHE_HOME` and `TMPDIR` instead
    /// of per-cell directories. Cells and reruns then share caches.
    pub shared_home: bool,

    /// Bytes of stdout/stderr kept per step (tail).
    pub output_limit: usize,

    /// Grace period between SIGTERM and SIGKILL when terminating a step.
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".matrixci"),
            source_dir: PathBuf::from("."),
            work_root: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            host_labels: Vec::new(),
            shell: default_shell(),
            keep_workspaces: false,
            shared_home: false,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(unix)]
fn default_shell() -> Vec<String> {
    vec!["sh".to_string(), "-e".to_string(), "-c".to_string()]
}

#[cfg(not(unix))]
fn default_shell() -> Vec<String> {
    vec!["cmd".to_string(), "/C".to_string()]
}

impl RunnerConfig {
    /// Create from environment variables on top of the defaults.
    ///
    /// Reads:
    /// - MATRIXCI_STATE_DIR (optional, default: ".matrixci")
    /// - MATRIXCI_SOURCE_DIR (optional, default: ".")
    /// - MATRIXCI_WORK_ROOT (optional)
    /// - MATRIXCI_MAX_PARALLEL (optional, default: 4)
    /// - MATRIXCI_HOST_LABELS (optional, comma-separated globs)
    /// - MATRIXCI_SHELL (optional, whitespace-separated argv prefix)
    /// - MATRIXCI_KEEP_WORKSPACES (optional, "true" to keep)
    /// - MATRIXCI_SHARED_HOME (optional, "true" to share the host HOME)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RunnerConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("MATRIXCI_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MATRIXCI_SOURCE_DIR") {
            config.source_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MATRIXCI_WORK_ROOT") {
            config.work_root = Some(PathBuf::from(dir));
        }
        if let Some(n) = lookup("MATRIXCI_MAX_PARALLEL").and_then(|v| v.trim().parse().ok()) {
            config.max_parallel = n;
        }
        if let Some(labels) = lookup("MATRIXCI_HOST_LABELS") {
            config.host_labels = split_list(&labels);
        }
        if let Some(shell) = lookup("MATRIXCI_SHELL") {
            let argv: Vec<String> = shell.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                config.shell = argv;
            }
        }
        if let Some(v) = lookup("MATRIXCI_KEEP_WORKSPACES") {
            config.keep_workspaces = v.to_lowercase() == "true";
        }
        if let Some(v) = lookup("MATRIXCI_SHARED_HOME") {
            config.shared_home = v.to_lowercase() == "true";
        }

        config
    }

    /// Set the ledger directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the checkout source.
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    /// Set the parent directory for cell workspaces.
    pub fn with_work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_root = Some(dir.into());
        self
    }

    /// Set the concurrency limit (at least 1).
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    /// Restrict the labels served by this host.
    pub fn with_host_labels(mut self, labels: Vec<String>) -> Self {
        self.host_labels = labels;
        self
    }

    /// Keep workspaces after the run.
    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    /// Share the host's home and cache directories across cells.
    pub fn with_shared_home(mut self, shared: bool) -> Self {
        self.shared_home = shared;
        self
    }

    /// Whether this host serves the given runner label.
    pub fn serves_label(&self, label: &str) -> bool {
        self.host_labels.is_empty()
            || self
                .host_labels
                .iter()
                .any(|pattern| glob_match::glob_match(pattern, label))
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
