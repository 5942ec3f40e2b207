//! Thin async wrapper around the `git` executable.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::GIT_COMMAND_TIMEOUT;

/// Exit status git uses for a missing config key.
const CONFIG_NOT_FOUND_EXIT: i32 = 5;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found")]
    NotFound,
    #[error("not a git repository: {0}")]
    NotARepository(String),
    #[error("git config key not found")]
    ConfigNotFound,
    #[error("git command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Git command failed (exit {code:?}): {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("Git command failed: {0}")]
    Io(#[from] io::Error),
}

impl GitError {
    /// Map a failed exit to the error callers branch on.
    pub fn classify(code: Option<i32>, stderr: &str) -> Self {
        let stderr = stderr.trim();
        if code == Some(CONFIG_NOT_FOUND_EXIT) {
            GitError::ConfigNotFound
        } else if stderr.contains("not a git repository") {
            GitError::NotARepository(stderr.to_string())
        } else {
            GitError::Failed {
                code,
                stderr: stderr.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError>;
}

/// Runs the real `git` binary with prompts disabled.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
            timeout: GIT_COMMAND_TIMEOUT,
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl GitExecutor for GitCli {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        debug!(cwd = %cwd.display(), ?args, "running git");
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => return Err(GitError::Timeout(self.timeout)),
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound && !cwd.exists() => {
                return Err(GitError::Io(err))
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => return Err(GitError::NotFound),
            Ok(Err(err)) => return Err(GitError::Io(err)),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(GitError::classify(output.status.code(), &stderr));
        }
        Ok(GitOutput { stdout, stderr })
    }
}

/// `git config <key>`; an unset key is `None`.
pub async fn config_get(git: &dyn GitExecutor, repo: &Path, key: &str) -> Result<Option<String>, GitError> {
    match git.run(repo, &["config", key]).await {
        Ok(output) => Ok(Some(output.trimmed().to_string()).filter(|value| !value.is_empty())),
        Err(GitError::ConfigNotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn config_set_local(git: &dyn GitExecutor, repo: &Path, key: &str, value: &str) -> Result<(), GitError> {
    git.run(repo, &["config", "--local", key, value]).await.map(|_| ())
}

/// Unsetting a key that is not set is not an error.
pub async fn config_unset_local(git: &dyn GitExecutor, repo: &Path, key: &str) -> Result<(), GitError> {
    match git.run(repo, &["config", "--local", "--unset", key]).await {
        Ok(_) | Err(GitError::ConfigNotFound) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Checked-out branch, or `None` on a detached HEAD.
pub async fn current_branch(git: &dyn GitExecutor, path: &Path) -> Result<Option<String>, GitError> {
    let output = git.run(path, &["branch", "--show-current"]).await?;
    Ok(Some(output.trimmed().to_string()).filter(|branch| !branch.is_empty()))
}
