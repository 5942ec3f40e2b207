//! Follow mode: keep the main checkout in step with a chosen worktree.
//!
//! The followed worktree is persisted in the main repository's local git
//! config. Hooks in both checkouts report commits and checkouts to the server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::protocol::FollowModeStatus;
use crate::config::home_dir;
use crate::git::{self, GitError, GitExecutor};
use crate::hooks::GitHooks;

pub const FOLLOW_CONFIG_KEY: &str = "vibetunnel.followWorktree";

const WORKTREES_MARKER: &str = "/.git/worktrees/";

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("No repository path provided")]
    NoRepository,
    #[error("No worktree found for branch '{0}'")]
    NoWorktree(String),
    #[error("Failed to find worktree: {0}")]
    WorktreeLookup(#[source] GitError),
    #[error("Failed to get current branch: Not on a branch (detached HEAD)")]
    DetachedHead,
    #[error("Failed to get current branch: {0}")]
    CurrentBranch(#[source] GitError),
    #[error("Failed to install Git hooks")]
    HookInstall,
    #[error("Failed to update follow mode config: {0}")]
    Config(#[source] GitError),
}

/// What the caller asked to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowTarget {
    Worktree(PathBuf),
    Branch(String),
    /// Whatever branch the main repository has checked out.
    CurrentBranch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowOutcome {
    pub follow_path: PathBuf,
    /// Branch name, or the worktree directory name when none is checked out.
    pub display_name: String,
}

/// One block of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub detached: bool,
    pub bare: bool,
}

pub fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                ..WorktreeEntry::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else { continue };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let name = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(name.to_string());
        } else if line == "detached" {
            entry.detached = true;
        } else if line == "bare" {
            entry.bare = true;
        }
    }
    entries.extend(current);
    entries
}

/// Linked worktree with `branch` checked out. The main checkout never counts.
pub fn worktree_for_branch(entries: &[WorktreeEntry], branch: &str, main_repo: &Path) -> Option<PathBuf> {
    entries
        .iter()
        .filter(|entry| entry.path != main_repo)
        .find(|entry| entry.branch.as_deref() == Some(branch))
        .map(|entry| entry.path.clone())
}

/// Main checkout for a linked worktree's `--git-dir`.
pub fn main_repo_from_git_dir(git_dir: &str) -> Option<PathBuf> {
    git_dir
        .find(WORKTREES_MARKER)
        .map(|idx| PathBuf::from(&git_dir[..idx]))
}

/// Show paths under `home` as `~/...`.
pub fn prettify_path(path: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home.filter(|home| !home.as_os_str().is_empty()) {
        if let Ok(rest) = path.strip_prefix(home) {
            if rest.as_os_str().is_empty() {
                return "~".to_string();
            }
            return format!("~/{}", rest.display());
        }
    }
    path.display().to_string()
}

pub(crate) fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub struct FollowMode {
    git: Arc<dyn GitExecutor>,
    hooks: Arc<dyn GitHooks>,
}

impl FollowMode {
    pub fn new(git: Arc<dyn GitExecutor>, hooks: Arc<dyn GitHooks>) -> Self {
        Self { git, hooks }
    }

    pub async fn find_worktree(&self, main_repo: &Path, branch: &str) -> Result<PathBuf, FollowError> {
        let output = self
            .git
            .run(main_repo, &["worktree", "list", "--porcelain"])
            .await
            .map_err(FollowError::WorktreeLookup)?;
        let entries = parse_worktree_list(&output.stdout);
        worktree_for_branch(&entries, branch, main_repo)
            .ok_or_else(|| FollowError::NoWorktree(branch.to_string()))
    }

    async fn display_name_for(&self, worktree: &Path) -> String {
        match git::current_branch(self.git.as_ref(), worktree).await {
            Ok(Some(branch)) => branch,
            _ => dir_name(worktree),
        }
    }

    async fn resolve(&self, main_repo: &Path, target: FollowTarget) -> Result<FollowOutcome, FollowError> {
        let branch = match target {
            FollowTarget::Worktree(path) => {
                let display_name = self.display_name_for(&path).await;
                return Ok(FollowOutcome {
                    follow_path: path,
                    display_name,
                });
            }
            FollowTarget::Branch(branch) => branch,
            FollowTarget::CurrentBranch => git::current_branch(self.git.as_ref(), main_repo)
                .await
                .map_err(FollowError::CurrentBranch)?
                .ok_or(FollowError::DetachedHead)?,
        };

        let follow_path = self.find_worktree(main_repo, &branch).await?;
        Ok(FollowOutcome {
            follow_path,
            display_name: branch,
        })
    }

    /// Resolve the target, install hooks and record the followed worktree.
    pub async fn enable(&self, main_repo: &Path, target: FollowTarget) -> Result<FollowOutcome, FollowError> {
        debug!(repo = %main_repo.display(), ?target, "enabling follow mode");
        let outcome = self.resolve(main_repo, target).await?;

        if !self.hooks.are_installed(main_repo).await {
            info!(repo = %main_repo.display(), "installing git hooks in main repository");
            let result = self.hooks.install(main_repo).await;
            if !result.success {
                warn!(errors = ?result.errors, "failed to install git hooks in main repository");
                return Err(FollowError::HookInstall);
            }
        }

        let follow_path = outcome.follow_path.to_string_lossy();
        git::config_set_local(self.git.as_ref(), main_repo, FOLLOW_CONFIG_KEY, &follow_path)
            .await
            .map_err(FollowError::Config)?;

        if outcome.follow_path != main_repo && !self.hooks.are_installed(&outcome.follow_path).await {
            info!(worktree = %outcome.follow_path.display(), "installing git hooks in worktree");
            let result = self.hooks.install(&outcome.follow_path).await;
            if !result.success {
                warn!(errors = ?result.errors, "failed to install git hooks in worktree, continuing");
            }
        }

        info!(
            repo = %main_repo.display(),
            worktree = %outcome.follow_path.display(),
            branch = %outcome.display_name,
            "follow mode enabled"
        );
        Ok(outcome)
    }

    /// Clear the followed worktree and remove hooks. Returns the worktree that
    /// was being followed, if any.
    pub async fn disable(&self, main_repo: &Path) -> Result<Option<PathBuf>, FollowError> {
        let followed = match git::config_get(self.git.as_ref(), main_repo, FOLLOW_CONFIG_KEY).await {
            Ok(value) => value.map(PathBuf::from),
            Err(err) => {
                debug!(error = %err, "could not read followed worktree");
                None
            }
        };

        git::config_unset_local(self.git.as_ref(), main_repo, FOLLOW_CONFIG_KEY)
            .await
            .map_err(FollowError::Config)?;

        let result = self.hooks.uninstall(main_repo).await;
        if !result.success {
            warn!(errors = ?result.errors, "failed to uninstall some git hooks from main repository");
        }

        if let Some(worktree) = followed.as_deref().filter(|path| *path != main_repo) {
            let result = self.hooks.uninstall(worktree).await;
            if !result.success {
                warn!(errors = ?result.errors, "failed to uninstall some git hooks from worktree");
            }
        }

        info!(repo = %main_repo.display(), "follow mode disabled");
        Ok(followed)
    }

    /// Follow mode as seen from `cwd`; `None` outside a repository or when
    /// nothing is followed.
    pub async fn status(&self, cwd: &Path) -> Option<FollowModeStatus> {
        let git = self.git.as_ref();
        let toplevel = git.run(cwd, &["rev-parse", "--show-toplevel"]).await.ok()?;
        let git_dir = git.run(cwd, &["rev-parse", "--git-dir"]).await.ok()?;

        let main_repo = main_repo_from_git_dir(git_dir.trimmed())
            .unwrap_or_else(|| PathBuf::from(toplevel.trimmed()));

        let followed = git::config_get(git, &main_repo, FOLLOW_CONFIG_KEY)
            .await
            .ok()
            .flatten()
            .map(PathBuf::from)?;
        let branch = self.display_name_for(&followed).await;

        Some(FollowModeStatus {
            enabled: true,
            branch: Some(branch),
            repo_path: Some(prettify_path(&followed, home_dir().as_deref())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitOutput;
    use crate::hooks::HookResult;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const PORCELAIN: &str = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo-feature
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feature

worktree /repo-detached
HEAD 3333333333333333333333333333333333333333
detached
";

    /// Answers by joined argv; records every call.
    #[derive(Default)]
    struct ScriptedGit {
        answers: HashMap<String, Result<String, i32>>,
        calls: Mutex<Vec<(PathBuf, String)>>,
    }

    impl ScriptedGit {
        fn answer(mut self, args: &str, stdout: &str) -> Self {
            self.answers.insert(args.to_string(), Ok(stdout.to_string()));
            self
        }

        fn fail(mut self, args: &str, code: i32) -> Self {
            self.answers.insert(args.to_string(), Err(code));
            self
        }

        fn calls(&self) -> Vec<(PathBuf, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GitExecutor for ScriptedGit {
        async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
            let key = args.join(" ");
            self.calls.lock().unwrap().push((cwd.to_path_buf(), key.clone()));
            match self.answers.get(&key) {
                Some(Ok(stdout)) => Ok(GitOutput {
                    stdout: stdout.clone(),
                    stderr: String::new(),
                }),
                Some(Err(code)) => Err(GitError::classify(Some(*code), "")),
                None if key.starts_with("config --local") => Ok(GitOutput::default()),
                None => Err(GitError::classify(Some(128), "fatal: not a git repository")),
            }
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        installed: Mutex<Vec<PathBuf>>,
        uninstalled: Mutex<Vec<PathBuf>>,
        fail_install: bool,
    }

    #[async_trait]
    impl GitHooks for RecordingHooks {
        async fn are_installed(&self, repo: &Path) -> bool {
            self.installed.lock().unwrap().iter().any(|path| path == repo)
        }

        async fn install(&self, repo: &Path) -> HookResult {
            if self.fail_install {
                return HookResult {
                    success: false,
                    errors: vec!["read-only".to_string()],
                };
            }
            self.installed.lock().unwrap().push(repo.to_path_buf());
            HookResult {
                success: true,
                errors: Vec::new(),
            }
        }

        async fn uninstall(&self, repo: &Path) -> HookResult {
            self.uninstalled.lock().unwrap().push(repo.to_path_buf());
            HookResult {
                success: true,
                errors: Vec::new(),
            }
        }
    }

    fn follow(git: ScriptedGit, hooks: RecordingHooks) -> (FollowMode, Arc<ScriptedGit>, Arc<RecordingHooks>) {
        let git = Arc::new(git);
        let hooks = Arc::new(hooks);
        (FollowMode::new(git.clone(), hooks.clone()), git, hooks)
    }

    #[test]
    fn porcelain_blocks_parse() {
        let entries = parse_worktree_list(PORCELAIN);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, PathBuf::from("/repo"));
        assert_eq!(entries[1].branch.as_deref(), Some("feature"));
        assert!(entries[2].detached);
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn main_checkout_is_never_a_follow_target() {
        let entries = parse_worktree_list(PORCELAIN);
        assert_eq!(worktree_for_branch(&entries, "main", Path::new("/repo")), None);
        assert_eq!(
            worktree_for_branch(&entries, "feature", Path::new("/repo")),
            Some(PathBuf::from("/repo-feature"))
        );
    }

    #[test]
    fn worktree_git_dir_points_at_main_repo() {
        assert_eq!(
            main_repo_from_git_dir("/src/app/.git/worktrees/feature"),
            Some(PathBuf::from("/src/app"))
        );
        assert_eq!(main_repo_from_git_dir(".git"), None);
    }

    #[test]
    fn home_prefix_becomes_tilde() {
        let home = Path::new("/home/dev");
        assert_eq!(prettify_path(Path::new("/home/dev/src/app"), Some(home)), "~/src/app");
        assert_eq!(prettify_path(Path::new("/home/dev"), Some(home)), "~");
        assert_eq!(prettify_path(Path::new("/home/developer"), Some(home)), "/home/developer");
        assert_eq!(prettify_path(Path::new("/opt/app"), None), "/opt/app");
    }

    #[tokio::test]
    async fn enable_for_branch_sets_config_and_installs_hooks() {
        let git = ScriptedGit::default().answer("worktree list --porcelain", PORCELAIN);
        let (follow, git, hooks) = follow(git, RecordingHooks::default());

        let outcome = follow
            .enable(Path::new("/repo"), FollowTarget::Branch("feature".into()))
            .await
            .unwrap();
        assert_eq!(outcome.follow_path, PathBuf::from("/repo-feature"));
        assert_eq!(outcome.display_name, "feature");

        assert!(git
            .calls()
            .contains(&(PathBuf::from("/repo"), "config --local vibetunnel.followWorktree /repo-feature".into())));
        let installed = hooks.installed.lock().unwrap().clone();
        assert_eq!(installed, vec![PathBuf::from("/repo"), PathBuf::from("/repo-feature")]);
    }

    #[tokio::test]
    async fn enable_for_unknown_branch_reports_missing_worktree() {
        let git = ScriptedGit::default().answer("worktree list --porcelain", PORCELAIN);
        let (follow, git, hooks) = follow(git, RecordingHooks::default());

        let err = follow
            .enable(Path::new("/repo"), FollowTarget::Branch("x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No worktree found for branch 'x'");
        assert!(hooks.installed.lock().unwrap().is_empty());
        assert!(!git.calls().iter().any(|(_, args)| args.starts_with("config --local")));
    }

    #[tokio::test]
    async fn enable_without_target_uses_current_branch() {
        let git = ScriptedGit::default()
            .answer("branch --show-current", "feature\n")
            .answer("worktree list --porcelain", PORCELAIN);
        let (follow, _, _) = follow(git, RecordingHooks::default());

        let outcome = follow
            .enable(Path::new("/repo"), FollowTarget::CurrentBranch)
            .await
            .unwrap();
        assert_eq!(outcome.follow_path, PathBuf::from("/repo-feature"));
    }

    #[tokio::test]
    async fn detached_head_is_an_error() {
        let git = ScriptedGit::default().answer("branch --show-current", "\n");
        let (follow, _, _) = follow(git, RecordingHooks::default());

        let err = follow
            .enable(Path::new("/repo"), FollowTarget::CurrentBranch)
            .await
            .unwrap_err();
        assert!(matches!(err, FollowError::DetachedHead), "got: {err:?}");
    }

    #[tokio::test]
    async fn explicit_worktree_falls_back_to_directory_name() {
        let (follow, _, _) = follow(ScriptedGit::default(), RecordingHooks::default());
        let outcome = follow
            .enable(Path::new("/repo"), FollowTarget::Worktree("/trees/hotfix".into()))
            .await
            .unwrap();
        assert_eq!(outcome.display_name, "hotfix");
    }

    #[tokio::test]
    async fn hook_install_failure_fails_enable() {
        let git = ScriptedGit::default().answer("worktree list --porcelain", PORCELAIN);
        let hooks = RecordingHooks {
            fail_install: true,
            ..RecordingHooks::default()
        };
        let (follow, _, _) = follow(git, hooks);

        let err = follow
            .enable(Path::new("/repo"), FollowTarget::Branch("feature".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to install Git hooks");
    }

    #[tokio::test]
    async fn disable_reads_followed_worktree_before_unsetting() {
        let git = ScriptedGit::default().answer("config vibetunnel.followWorktree", "/repo-feature\n");
        let (follow, git, hooks) = follow(git, RecordingHooks::default());

        let previous = follow.disable(Path::new("/repo")).await.unwrap();
        assert_eq!(previous, Some(PathBuf::from("/repo-feature")));

        let calls: Vec<String> = git.calls().into_iter().map(|(_, args)| args).collect();
        let read = calls.iter().position(|c| c == "config vibetunnel.followWorktree").unwrap();
        let unset = calls
            .iter()
            .position(|c| c == "config --local --unset vibetunnel.followWorktree")
            .unwrap();
        assert!(read < unset);

        let uninstalled = hooks.uninstalled.lock().unwrap().clone();
        assert_eq!(uninstalled, vec![PathBuf::from("/repo"), PathBuf::from("/repo-feature")]);
    }

    #[tokio::test]
    async fn disable_when_nothing_followed_still_succeeds() {
        let git = ScriptedGit::default()
            .fail("config vibetunnel.followWorktree", 5)
            .fail("config --local --unset vibetunnel.followWorktree", 5);
        let (follow, _, hooks) = follow(git, RecordingHooks::default());

        assert_eq!(follow.disable(Path::new("/repo")).await.unwrap(), None);
        assert_eq!(hooks.uninstalled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_reports_followed_worktree_from_linked_checkout() {
        let git = ScriptedGit::default()
            .answer("rev-parse --show-toplevel", "/repo-feature\n")
            .answer("rev-parse --git-dir", "/repo/.git/worktrees/repo-feature\n")
            .answer("config vibetunnel.followWorktree", "/repo-feature\n")
            .answer("branch --show-current", "feature\n");
        let (follow, git, _) = follow(git, RecordingHooks::default());

        let status = follow.status(Path::new("/repo-feature")).await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.branch.as_deref(), Some("feature"));
        assert!(git
            .calls()
            .contains(&(PathBuf::from("/repo"), "config vibetunnel.followWorktree".into())));
    }

    #[tokio::test]
    async fn status_outside_repository_is_none() {
        let (follow, _, _) = follow(ScriptedGit::default(), RecordingHooks::default());
        assert!(follow.status(Path::new("/tmp")).await.is_none());
    }
}
