//! Git helpers for capturing repository state.

use std::path::Path;
use std::process::Command;

use crate::error::GitError;

fn git_output(repo_dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let command = args.join(" ");
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::Command { command, stderr });
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Err(GitError::EmptyOutput { command });
    }
    Ok(value)
}

/// Capture the HEAD commit SHA of the repository containing `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String, GitError> {
    git_output(repo_dir, &["rev-parse", "HEAD"])
}

/// Name of the currently checked-out branch.
///
/// Returns `HEAD` for a detached head, as git does.
pub fn current_branch(repo_dir: &Path) -> Result<String, GitError> {
    git_output(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Root of the work tree containing `dir`.
pub fn toplevel(dir: &Path) -> Result<String, GitError> {
    git_output(dir, &["rev-parse", "--show-toplevel"])
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
