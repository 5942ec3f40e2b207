//! Git hooks that report commits and checkouts back to the server via `vt`.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, error, info};

use crate::git::{config_get, GitExecutor};

/// Marker line identifying hooks we own.
pub const HOOK_MARKER: &str = "VibeTunnel Git hook";
pub const HOOK_TYPES: [&str; 2] = ["post-commit", "post-checkout"];
const BACKUP_SUFFIX: &str = ".vtbak";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl HookResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            errors,
        }
    }
}

#[async_trait]
pub trait GitHooks: Send + Sync {
    /// True only when every hook exists and carries the marker.
    async fn are_installed(&self, repo: &Path) -> bool;
    async fn install(&self, repo: &Path) -> HookResult;
    async fn uninstall(&self, repo: &Path) -> HookResult;
}

pub struct HookInstaller {
    git: Arc<dyn GitExecutor>,
}

impl HookInstaller {
    pub fn new(git: Arc<dyn GitExecutor>) -> Self {
        Self { git }
    }

    /// `core.hooksPath` relative to the repo, else `.git/hooks`. Linked
    /// worktrees have a `.git` file, so git is asked for their hooks path.
    pub async fn hooks_dir(&self, repo: &Path) -> io::Result<PathBuf> {
        if let Ok(Some(custom)) = config_get(self.git.as_ref(), repo, "core.hooksPath").await {
            return Ok(repo.join(custom));
        }

        let dot_git = repo.join(".git");
        if dot_git.is_dir() {
            return Ok(dot_git.join("hooks"));
        }

        let output = self
            .git
            .run(repo, &["rev-parse", "--git-path", "hooks"])
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(repo.join(output.trimmed()))
    }

    async fn install_hook(&self, hooks_dir: &Path, hook: &str) -> io::Result<()> {
        fs::create_dir_all(hooks_dir).await?;
        let hook_path = hooks_dir.join(hook);
        let backup_path = backup_path(&hook_path);

        let existing = read_optional(&hook_path).await?;
        if existing.as_deref().is_some_and(|content| content.contains(HOOK_MARKER)) {
            debug!(hook, "hook already installed");
            return Ok(());
        }

        let script = match &existing {
            Some(original) => {
                fs::write(&backup_path, original).await?;
                make_executable(&backup_path).await?;
                debug!(hook, backup = %backup_path.display(), "backed up existing hook");
                hook_script(hook, Some(&backup_path))
            }
            None => hook_script(hook, None),
        };

        fs::write(&hook_path, script).await?;
        make_executable(&hook_path).await?;
        info!(hook, path = %hook_path.display(), chained = existing.is_some(), "installed git hook");
        Ok(())
    }

    async fn uninstall_hook(&self, hooks_dir: &Path, hook: &str) -> io::Result<()> {
        let hook_path = hooks_dir.join(hook);
        let backup_path = backup_path(&hook_path);

        let Some(existing) = read_optional(&hook_path).await? else {
            return Ok(());
        };
        if !existing.contains(HOOK_MARKER) {
            debug!(hook, "hook is not ours, leaving it alone");
            return Ok(());
        }

        match read_optional(&backup_path).await? {
            Some(original) => {
                fs::write(&hook_path, original).await?;
                make_executable(&hook_path).await?;
                fs::remove_file(&backup_path).await?;
                info!(hook, "restored original hook from backup");
            }
            None => {
                fs::remove_file(&hook_path).await?;
                info!(hook, "removed git hook");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GitHooks for HookInstaller {
    async fn are_installed(&self, repo: &Path) -> bool {
        let hooks_dir = match self.hooks_dir(repo).await {
            Ok(dir) => dir,
            Err(err) => {
                error!(repo = %repo.display(), error = %err, "failed to locate hooks directory");
                return false;
            }
        };
        for hook in HOOK_TYPES {
            match read_optional(&hooks_dir.join(hook)).await {
                Ok(Some(content)) if content.contains(HOOK_MARKER) => {}
                _ => return false,
            }
        }
        true
    }

    async fn install(&self, repo: &Path) -> HookResult {
        info!(repo = %repo.display(), "installing git hooks");
        let hooks_dir = match self.hooks_dir(repo).await {
            Ok(dir) => dir,
            Err(err) => return HookResult::from_errors(vec![err.to_string()]),
        };

        let mut errors = Vec::new();
        for hook in HOOK_TYPES {
            if let Err(err) = self.install_hook(&hooks_dir, hook).await {
                error!(hook, error = %err, "failed to install git hook");
                errors.push(format!("{hook}: {err}"));
            }
        }
        HookResult::from_errors(errors)
    }

    async fn uninstall(&self, repo: &Path) -> HookResult {
        info!(repo = %repo.display(), "uninstalling git hooks");
        let hooks_dir = match self.hooks_dir(repo).await {
            Ok(dir) => dir,
            Err(err) => return HookResult::from_errors(vec![err.to_string()]),
        };

        let mut errors = Vec::new();
        for hook in HOOK_TYPES {
            if let Err(err) = self.uninstall_hook(&hooks_dir, hook).await {
                error!(hook, error = %err, "failed to uninstall git hook");
                errors.push(format!("{hook}: {err}"));
            }
        }
        HookResult::from_errors(errors)
    }
}

fn backup_path(hook_path: &Path) -> PathBuf {
    let mut name = hook_path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn make_executable(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

/// Shell script for `hook`; `chain_to` runs the displaced original afterwards.
pub fn hook_script(hook: &str, chain_to: Option<&Path>) -> String {
    let mut script = format!(
        "#!/bin/sh\n\
         # {HOOK_MARKER} - {hook}\n\
         # Notifies VibeTunnel when Git events occur\n\
         \n\
         if command -v vt >/dev/null 2>&1; then\n\
         \x20 vt git event &\n\
         fi\n\
         \n"
    );
    if let Some(backup) = chain_to {
        let backup = backup.display();
        script.push_str(&format!(
            "if [ -f \"{backup}\" ]; then\n\
             \x20 exec \"{backup}\" \"$@\"\n\
             fi\n\
             \n"
        ));
    }
    script.push_str("exit 0\n");
    script
}
