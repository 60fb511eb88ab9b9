//! Git adapter for checkout and publish.
//!
//! The pipeline only needs a handful of git operations, so we keep a small,
//! explicit wrapper around `git` subprocess calls. Every call is bounded by a
//! timeout and honours the run's cancel token.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::cancel::CancelToken;
use crate::io::process::{CommandOutput, run_command};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(300);
const GIT_OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Failure of a single git invocation.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} was cancelled")]
    Cancelled { command: String },
    #[error("git {command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("git {command} failed (exit {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("git {command} could not run: {cause}")]
    Spawn { command: String, cause: String },
}

/// Identity used for bot commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
    cancel: CancelToken,
    envs: Vec<(String, String)>,
    configs: Vec<String>,
}

impl fmt::Debug for Git {
    // Environment values may carry credentials; only their names are shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Git")
            .field("workdir", &self.workdir)
            .field("timeout", &self.timeout)
            .field(
                "envs",
                &self.envs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
            cancel,
            envs: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
            configs: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment variable for every git invocation.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Add a `-c key=value` override for every git invocation.
    pub fn with_config(mut self, entry: impl Into<String>) -> Self {
        self.configs.push(entry.into());
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone a single branch of `url` into `dest`.
    #[instrument(skip_all, fields(url, branch))]
    pub fn clone_branch(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        depth: Option<u32>,
    ) -> Result<(), GitError> {
        let dest = dest.to_string_lossy().to_string();
        let depth_arg = depth.map(|d| format!("--depth={d}"));
        let mut args = vec!["clone", "--single-branch", "--branch", branch];
        if let Some(arg) = depth_arg.as_deref() {
            args.push(arg);
        }
        args.extend(["--", url, dest.as_str()]);
        debug!(url, branch, dest = %dest, "cloning");
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn init(&self) -> Result<(), GitError> {
        self.run_checked(&["init", "--quiet"])?;
        Ok(())
    }

    pub fn add_remote(&self, name: &str, url: &str) -> Result<(), GitError> {
        self.run_checked(&["remote", "add", name, url])?;
        Ok(())
    }

    /// Create or reset `branch` at the current HEAD and check it out (`checkout -B`).
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_force_branch(&self, branch: &str) -> Result<(), GitError> {
        debug!(branch, "force-setting local branch");
        self.run_checked(&["checkout", "--quiet", "-B", branch])?;
        Ok(())
    }

    /// Check whether `branch` exists on `remote` without fetching it.
    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{branch}");
        let out = self.run_checked(&["ls-remote", "--heads", remote, &refname])?;
        Ok(!out.stdout_lossy().trim().is_empty())
    }

    /// Fetch the tip of `branch` from `remote` into `FETCH_HEAD`.
    pub fn fetch_tip(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_checked(&["fetch", "--quiet", "--depth=1", remote, branch])?;
        Ok(())
    }

    /// Point HEAD and the index at `rev`, leaving the working tree untouched.
    pub fn reset_mixed(&self, rev: &str) -> Result<(), GitError> {
        self.run_checked(&["reset", "--quiet", "--mixed", rev])?;
        Ok(())
    }

    /// Stage all changes, including deletions.
    pub fn add_all(&self) -> Result<(), GitError> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool, GitError> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!out.stdout_lossy().trim().is_empty())
    }

    /// Commit staged changes as `author`.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str, author: &Author) -> Result<bool, GitError> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        debug!(author = %author.name, "committing staged changes");
        self.run_checked(&["-c", &name, "-c", &email, "commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    /// Full SHA of HEAD, or `None` on an unborn branch.
    pub fn head_sha(&self) -> Result<Option<String>, GitError> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout_lossy().trim().to_string()))
    }

    /// Overwrite `branch` on `remote` with the local branch.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_force(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        self.run_checked(&["push", "--force", "--porcelain", remote, &refspec])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let output = self.run(args)?;
        if !output.success() {
            let stderr = output.stderr_lossy();
            warn!(command = %args.join(" "), code = ?output.status.code(), "git failed");
            return Err(GitError::Failed {
                command: args.join(" "),
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let mut cmd = Command::new("git");
        for entry in &self.configs {
            cmd.arg("-c").arg(entry);
        }
        cmd.args(args).current_dir(&self.workdir);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        let output = run_command(cmd, self.timeout, GIT_OUTPUT_LIMIT_BYTES, &self.cancel).map_err(
            |err| GitError::Spawn {
                command: args.join(" "),
                cause: format!("{err:#}"),
            },
        )?;
        if output.cancelled {
            return Err(GitError::Cancelled {
                command: args.join(" "),
            });
        }
        if output.timed_out {
            return Err(GitError::TimedOut {
                command: args.join(" "),
                timeout: self.timeout,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_file, init_repo};

    fn author() -> Author {
        Author {
            name: "bot".to_string(),
            email: "bot@example.invalid".to_string(),
        }
    }

    #[test]
    fn commit_staged_is_noop_without_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path(), CancelToken::new());
        git.init().expect("init");
        assert_eq!(git.head_sha().expect("head"), None);
        assert!(!git.commit_staged("empty", &author()).expect("commit"));

        std::fs::write(temp.path().join("a.txt"), "a").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("first", &author()).expect("commit"));
        let head = git.head_sha().expect("head").expect("sha");
        assert_eq!(head.len(), 40);

        git.add_all().expect("add");
        assert!(!git.commit_staged("second", &author()).expect("commit"));
        assert_eq!(git.head_sha().expect("head"), Some(head));
    }

    #[test]
    fn clone_unknown_branch_reports_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        init_repo(&origin, "master");
        commit_file(&origin, "README.md", "hi\n");

        let git = Git::new(temp.path(), CancelToken::new());
        let err = git
            .clone_branch(
                &origin.to_string_lossy(),
                "does-not-exist",
                &temp.path().join("dest"),
                Some(1),
            )
            .unwrap_err();
        assert!(matches!(err, GitError::Failed { .. }), "{err}");
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        cancel.cancel("stop");
        let err = Git::new(temp.path(), cancel).init().unwrap_err();
        assert!(matches!(err, GitError::Cancelled { .. }));
    }
}
