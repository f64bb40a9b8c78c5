//! Builtin step actions: `checkout` and `setup-interpreter`.
//!
//! Both run inside the cell's deadline and report problems as
//! [`RunnerError::Provisioning`], which fails the cell before any `run` step
//! that depends on them.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use matrixci_core::{git, RunnerConfig};
use tracing::{debug, info};

use crate::error::{Result, RunnerError};
use crate::runner::{StepCommand, StepOutcome, StepRunner};
use crate::workspace::CellWorkspace;

/// Directory names never copied by a plain-directory checkout.
const COPY_SKIP: &[&str] = &[".git", "target", "node_modules", ".matrixci"];

/// Populate the cell workspace (or `path` inside it) from the configured source.
///
/// A git source is cloned, so only committed content is visible to the cell;
/// `reference` is checked out afterwards. Any other directory is copied.
pub async fn checkout(
    runner: &StepRunner,
    config: &RunnerConfig,
    workspace: &CellWorkspace,
    step_name: &str,
    reference: Option<&str>,
    path: Option<&str>,
    deadline: Option<tokio::time::Instant>,
) -> Result<StepOutcome> {
    let started = Instant::now();
    let dest = workspace.resolve_dir(path);
    let source = &config.source_dir;

    if !source.is_dir() {
        return Err(RunnerError::Provisioning(format!(
            "checkout source {} is not a directory",
            source.display()
        )));
    }

    if git::is_git_repo(source) {
        let top = git::toplevel(source)
            .map_err(|e| RunnerError::Provisioning(format!("checkout: {e}")))?;
        let dest_arg = dest.to_string_lossy().into_owned();
        let mut stdout = String::new();

        let clone = git_command(
            step_name,
            workspace.dir(),
            ["clone", "--quiet", top.as_str(), dest_arg.as_str()],
        );
        let outcome = run_provisioning(runner, &clone, deadline).await?;
        if outcome.timed_out {
            return Ok(outcome);
        }
        stdout.push_str(&format!("cloned {top} into {}\n", dest.display()));

        if let Some(reference) = reference {
            let co = git_command(step_name, &dest, ["checkout", "--quiet", reference]);
            let outcome = run_provisioning(runner, &co, deadline).await?;
            if outcome.timed_out {
                return Ok(outcome);
            }
            stdout.push_str(&format!("checked out {reference}\n"));
        }

        info!(source = %top, dest = %dest.display(), reference, "checked out git source");
        return Ok(StepOutcome::in_process(step_name, stdout, started));
    }

    if let Some(reference) = reference {
        return Err(RunnerError::Provisioning(format!(
            "checkout ref '{reference}' requested but {} is not a git repository",
            source.display()
        )));
    }

    if deadline.is_some_and(|d| d <= tokio::time::Instant::now()) {
        return Ok(copy_timed_out(step_name, started));
    }

    let from = source.clone();
    let to = dest.clone();
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let copy = tokio::task::spawn_blocking(move || copy_tree(&from, &to, &flag));
    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, copy).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                info!(source = %source.display(), "checkout copy reached its deadline");
                return Ok(copy_timed_out(step_name, started));
            }
        },
        None => copy.await,
    };
    let copied = joined
        .map_err(|e| RunnerError::Provisioning(format!("checkout copy task failed: {e}")))??;

    info!(source = %source.display(), dest = %dest.display(), files = copied, "copied source tree");
    Ok(StepOutcome::in_process(
        step_name,
        format!("copied {copied} files from {}\n", source.display()),
        started,
    ))
}

fn copy_timed_out(step_name: &str, started: Instant) -> StepOutcome {
    StepOutcome {
        exit_code: -1,
        success: false,
        timed_out: true,
        ..StepOutcome::in_process(step_name, String::new(), started)
    }
}

fn git_command<'a>(
    step_name: &str,
    cwd: &Path,
    args: impl IntoIterator<Item = &'a str>,
) -> StepCommand {
    let argv = std::iter::once("git")
        .chain(args)
        .map(str::to_string)
        .collect();
    StepCommand::new(step_name, argv, cwd)
}

/// Run a helper command, turning a non-zero exit into a provisioning error.
async fn run_provisioning(
    runner: &StepRunner,
    cmd: &StepCommand,
    deadline: Option<tokio::time::Instant>,
) -> Result<StepOutcome> {
    let outcome = runner.execute(cmd, deadline).await.map_err(|e| match e {
        RunnerError::Spawn { step, source } => {
            RunnerError::Provisioning(format!("{step}: cannot start {}: {source}", cmd.argv[0]))
        }
        other => other,
    })?;
    if !outcome.timed_out && !outcome.passed() {
        return Err(RunnerError::Provisioning(format!(
            "`{}` exited with {}: {}",
            cmd.argv.join(" "),
            outcome.exit_code,
            outcome.stderr.trim()
        )));
    }
    Ok(outcome)
}

/// Recursively copy `from` into `to`, returning the number of files copied.
///
/// Stops with a provisioning error once `cancel` is set.
fn copy_tree(from: &Path, to: &Path, cancel: &AtomicBool) -> Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        if cancel.load(Ordering::Relaxed) {
            return Err(RunnerError::Provisioning("checkout copy cancelled".to_string()));
        }
        let entry = entry?;
        let name = entry.file_name();
        if COPY_SKIP.iter().any(|skip| OsStr::new(skip) == name) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copied += copy_tree(&src, &dst, cancel)?;
        } else if file_type.is_file() {
            std::fs::copy(&src, &dst)?;
            copied += 1;
        } else if file_type.is_symlink() {
            copy_symlink(&src, &dst)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

/// A located interpreter executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub name: String,
    pub version: String,
    pub executable: PathBuf,
}

impl Interpreter {
    /// Find `<name><version>`, `<name>-<version>` or an explicit `path`.
    ///
    /// When neither versioned name exists, a bare `<name>` is accepted only if
    /// its `--version` output mentions the requested version.
    pub async fn locate(
        runner: &StepRunner,
        name: &str,
        version: &str,
        explicit: Option<&str>,
        search_path: &OsStr,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Self> {
        let found = |executable: PathBuf| Self {
            name: name.to_string(),
            version: version.to_string(),
            executable,
        };

        if let Some(path) = explicit {
            let path = PathBuf::from(path);
            if !is_executable(&path) {
                return Err(RunnerError::Provisioning(format!(
                    "interpreter path {} is not an executable file",
                    path.display()
                )));
            }
            return Ok(found(path));
        }

        let versioned = [format!("{name}{version}"), format!("{name}-{version}")];
        for candidate in &versioned {
            if let Some(path) = which(candidate, search_path) {
                debug!(candidate = %candidate, path = %path.display(), "found versioned interpreter");
                return Ok(found(path));
            }
        }

        if let Some(path) = which(name, search_path) {
            let reported = version_output(runner, &path, name, deadline).await?;
            if reports_version(&reported, version) {
                return Ok(found(path));
            }
            debug!(path = %path.display(), reported = %reported.trim(), "bare interpreter has a different version");
        }

        Err(RunnerError::Provisioning(format!(
            "no {name} {version} interpreter on PATH (tried {}, {}, {name})",
            versioned[0], versioned[1]
        )))
    }

    /// Major component of the version (`3.8` → `3`).
    pub fn major(&self) -> &str {
        self.version.split('.').next().unwrap_or(&self.version)
    }
}

/// Locate the interpreter, link it into the cell's tools dir and put that
/// dir first on PATH.
pub async fn setup_interpreter(
    runner: &StepRunner,
    workspace: &mut CellWorkspace,
    step_name: &str,
    name: &str,
    version: &str,
    explicit: Option<&str>,
    deadline: Option<tokio::time::Instant>,
) -> Result<StepOutcome> {
    let started = Instant::now();
    let search_path = workspace.search_path();
    let interpreter =
        Interpreter::locate(runner, name, version, explicit, &search_path, deadline).await?;

    let bin = workspace.tools_bin().to_path_buf();
    let mut aliases = vec![name.to_string(), format!("{name}{}", interpreter.major())];
    aliases.dedup();
    for alias in &aliases {
        create_shim(&bin, alias, &interpreter.executable)?;
    }
    workspace.prepend_path(&bin)?;
    workspace.set_env("INTERPRETER", interpreter.executable.to_string_lossy());
    workspace.set_env("INTERPRETER_VERSION", version);

    // The shim must actually run before later steps rely on it.
    let reported = version_output(runner, &interpreter.executable, step_name, deadline).await?;
    info!(
        interpreter = %interpreter.executable.display(),
        version,
        reported = %reported.trim(),
        "interpreter ready"
    );

    Ok(StepOutcome::in_process(
        step_name,
        format!(
            "{name} {version} -> {}\n{}",
            interpreter.executable.display(),
            reported
        ),
        started,
    ))
}

async fn version_output(
    runner: &StepRunner,
    executable: &Path,
    step_name: &str,
    deadline: Option<tokio::time::Instant>,
) -> Result<String> {
    let cwd = std::env::temp_dir();
    let cmd = StepCommand::new(
        step_name,
        vec![
            executable.to_string_lossy().into_owned(),
            "--version".to_string(),
        ],
        cwd,
    );
    let outcome = run_provisioning(runner, &cmd, deadline).await?;
    if outcome.timed_out {
        return Err(RunnerError::Provisioning(format!(
            "{} --version did not finish before the deadline",
            executable.display()
        )));
    }
    // Some interpreters print their version on stderr.
    Ok(format!("{}{}", outcome.stdout, outcome.stderr))
}

fn reports_version(output: &str, version: &str) -> bool {
    output.split_whitespace().any(|word| {
        word == version
            || word
                .strip_prefix(version)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false)
    })
}

fn which(program: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .flat_map(|dir| executable_names(program).map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn executable_names(program: &str) -> impl Iterator<Item = String> {
    std::iter::once(program.to_string())
}

#[cfg(not(unix))]
fn executable_names(program: &str) -> impl Iterator<Item = String> {
    [format!("{program}.exe"), format!("{program}.cmd"), program.to_string()].into_iter()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn create_shim(bin: &Path, alias: &str, target: &Path) -> Result<()> {
    let link = bin.join(alias);
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(target, &link)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_shim(bin: &Path, alias: &str, target: &Path) -> Result<()> {
    let shim = bin.join(format!("{alias}.cmd"));
    std::fs::write(shim, format!("@\"{}\" %*\r\n", target.display()))?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use matrixci_core::{plan_all, Event, RunId, Workflow};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn runner() -> StepRunner {
        StepRunner::new(64 * 1024, Duration::from_millis(200))
    }

    fn workspace(config: &RunnerConfig) -> CellWorkspace {
        let wf = Workflow::from_yaml("name: a\non: push\nsteps:\n  - run: 'true'\n").unwrap();
        let plan = plan_all(&wf, &Event::push("main")).unwrap();
        CellWorkspace::create(config, &RunId::new(), &Event::push("main"), &plan.cells[0])
            .unwrap()
    }

    fn fake_interpreter(dir: &Path, file: &str, reports: &str) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(&path, format!("#!/bin/sh\necho \"FakeLang {reports}\"\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_reports_version() {
        assert!(reports_version("Python 3.8.10\n", "3.8"));
        assert!(reports_version("Python 3.8\n", "3.8"));
        assert!(!reports_version("Python 3.81.0\n", "3.8"));
        assert!(!reports_version("Python 3.9.1\n", "3.8"));
    }

    #[test]
    fn test_copy_tree_skips_vcs_and_build_dirs() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("pkg/sub")).unwrap();
        std::fs::create_dir_all(src.path().join(".git")).unwrap();
        std::fs::create_dir_all(src.path().join("target")).unwrap();
        std::fs::write(src.path().join("pkg/sub/a.txt"), "a").unwrap();
        std::fs::write(src.path().join("top.txt"), "t").unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let copied = copy_tree(src.path(), dst.path(), &AtomicBool::new(false)).unwrap();
        assert_eq!(copied, 2);
        assert!(dst.path().join("pkg/sub/a.txt").is_file());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("target").exists());
    }

    #[test]
    fn test_copy_tree_stops_when_cancelled() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        let dst = tempfile::tempdir().unwrap();

        let err = copy_tree(src.path(), dst.path(), &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, RunnerError::Provisioning(_)));
        assert!(!dst.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_checkout_copy_respects_deadline() {
        let src = tempfile::tempdir().unwrap();
        for i in 0..200 {
            let dir = src.path().join(format!("d{i}"));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("f.txt"), "x").unwrap();
        }
        let config = RunnerConfig::default().with_source_dir(src.path());
        let ws = workspace(&config);

        let outcome = checkout(
            &runner(),
            &config,
            &ws,
            "Checkout",
            None,
            None,
            Some(tokio::time::Instant::now()),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.passed());
    }

    #[tokio::test]
    async fn test_checkout_copies_plain_directory() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("setup.py"), "print('hi')").unwrap();
        let config = RunnerConfig::default().with_source_dir(src.path());
        let ws = workspace(&config);

        let outcome = checkout(&runner(), &config, &ws, "Checkout", None, None, None)
            .await
            .unwrap();
        assert!(outcome.passed());
        assert!(ws.dir().join("setup.py").is_file());
    }

    #[tokio::test]
    async fn test_checkout_ref_requires_git() {
        let src = tempfile::tempdir().unwrap();
        let config = RunnerConfig::default().with_source_dir(src.path());
        let ws = workspace(&config);

        let err = checkout(&runner(), &config, &ws, "Checkout", Some("v1"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_locate_prefers_versioned_name() {
        let bin = tempfile::tempdir().unwrap();
        let versioned = fake_interpreter(bin.path(), "fakelang3.8", "3.8.1");
        fake_interpreter(bin.path(), "fakelang", "3.11.0");

        let found = Interpreter::locate(
            &runner(),
            "fakelang",
            "3.8",
            None,
            bin.path().as_os_str(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(found.executable, versioned);
        assert_eq!(found.major(), "3");
    }

    #[tokio::test]
    async fn test_locate_accepts_bare_name_with_matching_version() {
        let bin = tempfile::tempdir().unwrap();
        let bare = fake_interpreter(bin.path(), "fakelang", "3.7.4");

        let found = Interpreter::locate(
            &runner(),
            "fakelang",
            "3.7",
            None,
            bin.path().as_os_str(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(found.executable, bare);

        let missing = Interpreter::locate(
            &runner(),
            "fakelang",
            "3.8",
            None,
            bin.path().as_os_str(),
            None,
        )
        .await;
        assert!(matches!(missing, Err(RunnerError::Provisioning(_))));
    }

    #[tokio::test]
    async fn test_setup_interpreter_links_shims_and_exports() {
        let bin = tempfile::tempdir().unwrap();
        let exe = fake_interpreter(bin.path(), "fakelang3.8", "3.8.1");
        let config = RunnerConfig::default();
        let mut ws = workspace(&config);
        ws.set_env("PATH", bin.path().to_string_lossy());

        let outcome = setup_interpreter(
            &runner(),
            &mut ws,
            "Set up fakelang",
            "fakelang",
            "3.8",
            None,
            None,
        )
        .await
        .unwrap();

        assert!(outcome.passed());
        assert!(outcome.stdout.contains("FakeLang 3.8.1"));
        assert!(ws.tools_bin().join("fakelang").exists());
        assert!(ws.tools_bin().join("fakelang3").exists());
        assert_eq!(ws.env()["INTERPRETER"], exe.to_string_lossy());
        assert_eq!(ws.env()["INTERPRETER_VERSION"], "3.8");
        let first = std::env::split_paths(&ws.search_path()).next().unwrap();
        assert_eq!(first, ws.tools_bin());
    }
}
