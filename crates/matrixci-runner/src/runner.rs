//! Step execution: one external process per step.
//!
//! Each step is spawned as its own process group so a timeout can take down
//! the step and everything it started. Output is streamed to tracing at
//! debug level and the tail is kept for the step report.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use indexmap::IndexMap;
use matrixci_core::RunnerConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};

/// A fully resolved process invocation.
#[derive(Debug, Clone)]
pub struct StepCommand {
    /// Step name for logs and reports.
    pub name: String,

    /// Program followed by its arguments.
    pub argv: Vec<String>,

    pub cwd: PathBuf,

    /// Added on top of the inherited environment.
    pub env: IndexMap<String, String>,
}

impl StepCommand {
    pub fn new(name: impl Into<String>, argv: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            argv,
            cwd: cwd.into(),
            env: IndexMap::new(),
        }
    }

    pub fn with_env(mut self, env: IndexMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_name: String,

    /// Exit code (0 = success, -1 when killed or unavailable).
    pub exit_code: i32,

    /// Tail of captured stdout.
    pub stdout: String,

    /// Tail of captured stderr.
    pub stderr: String,

    pub duration_ms: u64,

    /// Whether the process exited successfully.
    pub success: bool,

    /// Whether the process was terminated because its deadline passed.
    pub timed_out: bool,
}

impl StepOutcome {
    /// Whether this step passed (exit code 0, not timed out).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0 && !self.timed_out
    }

    /// Outcome for work done in-process rather than by a child.
    pub fn in_process(step_name: &str, stdout: String, started: Instant) -> Self {
        Self {
            step_name: step_name.to_string(),
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            success: true,
            timed_out: false,
        }
    }
}

/// Keeps the last `limit` bytes of a stream.
struct TailBuffer {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        if !line.ends_with('\n') {
            self.buf.push('\n');
        }
        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
            self.truncated = true;
        }
    }

    fn render(&self) -> String {
        if self.truncated {
            format!("[... output truncated ...]\n{}", self.buf)
        } else {
            self.buf.clone()
        }
    }
}

type SharedTail = Arc<Mutex<TailBuffer>>;

fn shared_tail(limit: usize) -> SharedTail {
    Arc::new(Mutex::new(TailBuffer::new(limit)))
}

fn lock_tail(tail: &SharedTail) -> MutexGuard<'_, TailBuffer> {
    tail.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn collect_output<R>(
    reader: Option<R>,
    tail: SharedTail,
    limit: usize,
    step: String,
    stream: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let read = read_lines(BufReader::new(reader), limit, |raw| {
        let line = String::from_utf8_lossy(raw);
        debug!(step = %step, stream, "{}", line.trim_end());
        lock_tail(&tail).push_line(&line);
    })
    .await;
    if let Err(e) = read {
        warn!(step = %step, stream, error = %e, "error reading step output");
    }
}

/// Split a stream into lines, keeping at most `limit` bytes of any one line.
async fn read_lines<R>(
    mut reader: R,
    limit: usize,
    mut on_line: impl FnMut(&[u8]),
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let (used, line_done) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                break;
            }
            let (used, line_done) = match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (buf.len(), false),
            };
            let room = limit.saturating_sub(raw.len());
            raw.extend_from_slice(&buf[..used.min(room)]);
            (used, line_done)
        };
        reader.consume(used);
        if line_done {
            on_line(&raw);
            raw.clear();
        }
    }
    if !raw.is_empty() {
        on_line(&raw);
    }
    Ok(())
}

/// Executes step commands.
#[derive(Debug, Clone)]
pub struct StepRunner {
    output_limit: usize,
    kill_grace: Duration,
}

impl StepRunner {
    pub fn new(output_limit: usize, kill_grace: Duration) -> Self {
        Self {
            output_limit,
            kill_grace,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.output_limit, config.kill_grace)
    }

    /// Run `cmd` to completion or until `deadline`.
    ///
    /// A non-zero exit is an `Ok` outcome with `success == false`; reaching
    /// the deadline terminates the process group and returns an outcome with
    /// `timed_out == true`. Only failures to start or wait are errors.
    pub async fn execute(
        &self,
        cmd: &StepCommand,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<StepOutcome> {
        let start = Instant::now();

        let (exe, args) = cmd
            .argv
            .split_first()
            .ok_or_else(|| RunnerError::EmptyCommand {
                step: cmd.name.clone(),
            })?;

        debug!(step = %cmd.name, argv = ?cmd.argv, cwd = %cmd.cwd.display(), "spawning step");

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(&cmd.cwd)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child: AsyncGroupChild =
            command.group_spawn().map_err(|source| RunnerError::Spawn {
                step: cmd.name.clone(),
                source,
            })?;
        // Gone from the child once it has been reaped.
        let pgid = child.inner().id();

        let stdout_tail = shared_tail(self.output_limit);
        let stderr_tail = shared_tail(self.output_limit);
        let stdout_handle = tokio::spawn(collect_output(
            child.inner().stdout.take(),
            Arc::clone(&stdout_tail),
            self.output_limit,
            cmd.name.clone(),
            "stdout",
        ));
        let stderr_handle = tokio::spawn(collect_output(
            child.inner().stderr.take(),
            Arc::clone(&stderr_tail),
            self.output_limit,
            cmd.name.clone(),
            "stderr",
        ));

        let waited = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let (exit_code, success, timed_out) = match waited {
            Some(Ok(status)) => {
                sweep_process_group(&mut child, pgid).await;
                (status.code().unwrap_or(-1), status.success(), false)
            }
            Some(Err(source)) => {
                terminate_process_group(&mut child, self.kill_grace).await;
                return Err(RunnerError::Wait {
                    step: cmd.name.clone(),
                    source,
                });
            }
            None => {
                info!(step = %cmd.name, "step reached its deadline, terminating process group");
                terminate_process_group(&mut child, self.kill_grace).await;
                (-1, false, true)
            }
        };

        // A background grandchild may hold the pipes open; do not wait on it forever.
        let stdout = join_output(stdout_handle, &stdout_tail, self.kill_grace).await;
        let stderr = join_output(stderr_handle, &stderr_tail, self.kill_grace).await;

        Ok(StepOutcome {
            step_name: cmd.name.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            success,
            timed_out,
        })
    }
}

/// Wait for a reader to drain, then return whatever tail it collected.
async fn join_output(handle: JoinHandle<()>, tail: &SharedTail, wait: Duration) -> String {
    let abort = handle.abort_handle();
    if tokio::time::timeout(wait, handle).await.is_err() {
        abort.abort();
    }
    lock_tail(tail).render()
}

/// Terminate a process group gracefully.
///
/// On Unix:
/// 1. Send SIGTERM to the process group
/// 2. Wait for the grace period
/// 3. SIGKILL the group if the leader is still running
/// 4. Reap the leader
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            warn!(pid, error = ?e, "SIGTERM to process group failed");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Descendants may outlive the leader; always sweep the group.
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!(pid, error = ?e, "SIGKILL to process group failed");
        }
    }

    let _ = child.wait().await;
}

/// Kill whatever the leader left running in its group after it exited.
#[cfg(unix)]
async fn sweep_process_group(_child: &mut AsyncGroupChild, pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "killed processes left behind by step"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = ?e, "SIGKILL to process group failed"),
    }
}

#[cfg(not(unix))]
async fn sweep_process_group(child: &mut AsyncGroupChild, _pgid: Option<u32>) {
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
