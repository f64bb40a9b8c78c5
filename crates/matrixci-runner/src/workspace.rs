//! Per-cell workspace on disk.
//!
//! Layout under a fresh temp directory:
//!
//! ```text
//! matrixci-cell-XXXX/
//!   workspace/    checkout target and default working directory
//!   tools/bin/    interpreter shims
//!   home/         HOME (and USERPROFILE on Windows)
//!   cache/        XDG_CACHE_HOME
//!   tmp/          TMPDIR
//! ```
//!
//! The last three are skipped when `shared_home` is set.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use matrixci_core::{CellPlan, Event, RunId, RunnerConfig};
use tempfile::TempDir;

use crate::error::{Result, RunnerError};

/// Environment variable name for a matrix axis (`python-version` → `MATRIX_PYTHON_VERSION`).
pub fn axis_env_name(axis: &str) -> String {
    let upper: String = axis
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MATRIX_{upper}")
}

/// Isolated directory tree and runtime environment for one cell run.
#[derive(Debug)]
pub struct CellWorkspace {
    root: TempDir,
    dir: PathBuf,
    tools_bin: PathBuf,
    env: IndexMap<String, String>,
}

impl CellWorkspace {
    /// Create the directory tree and seed the runtime environment.
    pub fn create(
        config: &RunnerConfig,
        run_id: &RunId,
        event: &Event,
        plan: &CellPlan,
    ) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("matrixci-cell-");
            b
        };
        let root = match &config.work_root {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        let dir = root.path().join("workspace");
        let tools_bin = root.path().join("tools").join("bin");
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(&tools_bin)?;

        let mut env = IndexMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("MATRIXCI".to_string(), "true".to_string());
        env.insert("MATRIXCI_WORKSPACE".to_string(), path_string(&dir));
        env.insert("MATRIXCI_RUN_ID".to_string(), run_id.to_string());
        env.insert("MATRIXCI_CELL".to_string(), plan.label());
        env.insert("MATRIXCI_RUNNER_LABEL".to_string(), plan.runner_label.clone());
        env.insert("MATRIXCI_EVENT".to_string(), event.kind.to_string());
        env.insert("MATRIXCI_BRANCH".to_string(), event.branch.clone());
        for (axis, value) in plan.cell.values() {
            env.insert(axis_env_name(axis), value.clone());
        }

        if !config.shared_home {
            let home = root.path().join("home");
            let cache = root.path().join("cache");
            let tmp = root.path().join("tmp");
            for d in [&home, &cache, &tmp] {
                std::fs::create_dir_all(d)?;
            }
            env.insert("HOME".to_string(), path_string(&home));
            env.insert("XDG_CACHE_HOME".to_string(), path_string(&cache));
            env.insert("TMPDIR".to_string(), path_string(&tmp));
            #[cfg(windows)]
            {
                env.insert("USERPROFILE".to_string(), path_string(&home));
                env.insert("TEMP".to_string(), path_string(&tmp));
                env.insert("TMP".to_string(), path_string(&tmp));
            }
        }

        Ok(Self {
            root,
            dir,
            tools_bin,
            env,
        })
    }

    /// Checkout target and default working directory for steps.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Directory that interpreter shims are linked into.
    pub fn tools_bin(&self) -> &Path {
        &self.tools_bin
    }

    /// Runtime variables layered over each step's env.
    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// PATH as steps of this cell see it.
    pub fn search_path(&self) -> OsString {
        match self.env.get("PATH") {
            Some(path) => OsString::from(path),
            None => std::env::var_os("PATH").unwrap_or_default(),
        }
    }

    /// Put `dir` first on PATH for every following step.
    pub fn prepend_path(&mut self, dir: &Path) -> Result<()> {
        let current = self.search_path();
        let entries = std::iter::once(dir.to_path_buf())
            .chain(std::env::split_paths(&current).filter(|p| p != dir));
        let joined = std::env::join_paths(entries)
            .map_err(|e| RunnerError::Provisioning(format!("cannot extend PATH: {e}")))?;
        self.env
            .insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        Ok(())
    }

    /// Resolve a step's working directory relative to the workspace.
    pub fn resolve_dir(&self, working_directory: Option<&str>) -> PathBuf {
        match working_directory {
            Some(sub) => self.dir.join(sub),
            None => self.dir.clone(),
        }
    }

    /// Environment for one step: its resolved env, then the runtime env on top.
    pub fn step_env(&self, step_env: &IndexMap<String, String>) -> IndexMap<String, String> {
        let mut env = step_env.clone();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Delete the tree, or keep it and return where it lives.
    pub fn finish(self, keep: bool) -> Option<PathBuf> {
        if keep {
            Some(self.root.into_path())
        } else {
            if let Err(e) = self.root.close() {
                tracing::warn!(error = %e, "failed to remove cell workspace");
            }
            None
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixci_core::{plan_all, Workflow};

    fn cell_plan() -> CellPlan {
        let wf = Workflow::from_yaml(
            "name: ws\non: push\nstrategy:\n  matrix:\n    os: [ubuntu-22.04]\n    python-version: [\"3.8\"]\nsteps:\n  - run: 'true'\n",
        )
        .unwrap();
        plan_all(&wf, &Event::push("main")).unwrap().cells.remove(0)
    }

    #[test]
    fn test_axis_env_name() {
        assert_eq!(axis_env_name("python-version"), "MATRIX_PYTHON_VERSION");
        assert_eq!(axis_env_name("os"), "MATRIX_OS");
    }

    #[test]
    fn test_create_layout_and_env() {
        let parent = tempfile::tempdir().unwrap();
        let config = RunnerConfig::default().with_work_root(parent.path());
        let run_id = RunId::new();
        let ws = CellWorkspace::create(&config, &run_id, &Event::push("main"), &cell_plan())
            .unwrap();

        assert!(ws.dir().is_dir());
        assert!(ws.tools_bin().is_dir());
        assert!(ws.root().starts_with(parent.path()));
        assert_eq!(ws.env()["MATRIX_OS"], "ubuntu-22.04");
        assert_eq!(ws.env()["MATRIX_PYTHON_VERSION"], "3.8");
        assert_eq!(ws.env()["MATRIXCI_RUN_ID"], run_id.to_string());
        assert_eq!(ws.env()["MATRIXCI_EVENT"], "push");
        assert_eq!(ws.env()["HOME"], path_string(&ws.root().join("home")));
        assert_eq!(ws.env()["XDG_CACHE_HOME"], path_string(&ws.root().join("cache")));
        assert_eq!(ws.env()["TMPDIR"], path_string(&ws.root().join("tmp")));
        assert!(ws.root().join("home").is_dir());
    }

    #[test]
    fn test_shared_home_leaves_host_dirs() {
        let config = RunnerConfig::default().with_shared_home(true);
        let ws = CellWorkspace::create(&config, &RunId::new(), &Event::push("main"), &cell_plan())
            .unwrap();
        assert!(!ws.env().contains_key("HOME"));
        assert!(!ws.env().contains_key("TMPDIR"));
        assert!(!ws.root().join("home").exists());
    }

    #[test]
    fn test_prepend_path_puts_dir_first() {
        let config = RunnerConfig::default();
        let mut ws =
            CellWorkspace::create(&config, &RunId::new(), &Event::push("main"), &cell_plan())
                .unwrap();
        ws.set_env("PATH", "/usr/bin");
        let tools = ws.tools_bin().to_path_buf();
        ws.prepend_path(&tools).unwrap();
        ws.prepend_path(&tools).unwrap();

        let entries: Vec<_> = std::env::split_paths(&ws.search_path()).collect();
        assert_eq!(entries, vec![tools, PathBuf::from("/usr/bin")]);
    }

    #[test]
    fn test_runtime_env_wins_over_step_env() {
        let config = RunnerConfig::default();
        let ws = CellWorkspace::create(&config, &RunId::new(), &Event::push("main"), &cell_plan())
            .unwrap();
        let mut step = IndexMap::new();
        step.insert("CI".to_string(), "false".to_string());
        step.insert("OWN".to_string(), "1".to_string());
        let env = ws.step_env(&step);
        assert_eq!(env["CI"], "true");
        assert_eq!(env["OWN"], "1");
    }

    #[test]
    fn test_finish_removes_or_keeps() {
        let config = RunnerConfig::default();
        let ws = CellWorkspace::create(&config, &RunId::new(), &Event::push("main"), &cell_plan())
            .unwrap();
        let root = ws.root().to_path_buf();
        assert!(ws.finish(false).is_none());
        assert!(!root.exists());

        let ws = CellWorkspace::create(&config, &RunId::new(), &Event::push("main"), &cell_plan())
            .unwrap();
        let kept = ws.finish(true).unwrap();
        assert!(kept.is_dir());
        std::fs::remove_dir_all(kept).unwrap();
    }
}
