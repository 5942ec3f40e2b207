//! `vt`: talk to a running VibeTunnel server over `api.sock`.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use vibetunnel_control::api::protocol::{GitEventKind, GitEventNotify, GitFollowRequest, StatusResponse};
use vibetunnel_control::api::{ClientError, SocketApiClient};
use vibetunnel_control::config::{ControlPaths, CONTROL_DIR_ENV};
use vibetunnel_control::follow::main_repo_from_git_dir;
use vibetunnel_control::git::{GitCli, GitExecutor};
use vibetunnel_control::logging;

#[derive(Debug, Parser)]
#[command(name = "vt", version, about = "VibeTunnel command line client")]
struct Cli {
    /// Directory holding api.sock.
    #[arg(long, global = true, env = CONTROL_DIR_ENV)]
    control_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show whether the server is running and what it is following.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Keep the main checkout in step with a worktree.
    Follow {
        /// Branch whose worktree to follow (defaults to the current branch).
        branch: Option<String>,
        #[arg(long)]
        worktree: Option<PathBuf>,
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Stop following.
    Unfollow {
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Git integration, called from installed hooks.
    Git {
        #[command(subcommand)]
        command: GitCommand,
    },
}

#[derive(Debug, Subcommand)]
enum GitCommand {
    /// Report a repository event to the server.
    Event {
        #[arg(long = "type", value_enum, default_value_t = EventType::Other)]
        kind: EventType,
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventType {
    Checkout,
    Commit,
    Merge,
    Rebase,
    Other,
}

impl From<EventType> for GitEventKind {
    fn from(kind: EventType) -> Self {
        match kind {
            EventType::Checkout => GitEventKind::Checkout,
            EventType::Commit => GitEventKind::Commit,
            EventType::Merge => GitEventKind::Merge,
            EventType::Rebase => GitEventKind::Rebase,
            EventType::Other => GitEventKind::Other,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let paths = match &cli.control_dir {
        Some(dir) => ControlPaths::new(dir),
        None => ControlPaths::from_env(),
    };
    let client = SocketApiClient::new(&paths);

    match cli.command {
        Command::Status { json } => {
            let status = client.get_status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Follow { branch, worktree, repo } => {
            let repo = main_repo(repo).await?;
            let request = GitFollowRequest {
                repo_path: Some(repo.display().to_string()),
                branch,
                enable: true,
                worktree_path: worktree.map(|path| absolute(&path).display().to_string()),
                main_repo_path: Some(repo.display().to_string()),
            };
            let response = client.set_follow_mode(&request).await?;
            if !response.success {
                bail!(response.error.unwrap_or_else(|| "Failed to enable follow mode".to_string()));
            }
            println!(
                "Following {} in {}",
                response.current_branch.as_deref().unwrap_or("worktree"),
                repo.display()
            );
        }
        Command::Unfollow { repo } => {
            let repo = main_repo(repo).await?;
            let request = GitFollowRequest {
                repo_path: Some(repo.display().to_string()),
                enable: false,
                main_repo_path: Some(repo.display().to_string()),
                ..GitFollowRequest::default()
            };
            let response = client.set_follow_mode(&request).await?;
            if !response.success {
                bail!(response.error.unwrap_or_else(|| "Failed to disable follow mode".to_string()));
            }
            println!("Follow mode disabled in {}", repo.display());
        }
        Command::Git {
            command: GitCommand::Event { kind, repo },
        } => {
            let repo = match repo {
                Some(repo) => absolute(&repo),
                None => toplevel().await?,
            };
            let event = GitEventNotify {
                repo_path: repo.display().to_string(),
                kind: kind.into(),
            };
            match client.send_git_event(&event).await {
                Ok(ack) => debug!(handled = ack.handled, "git event acknowledged"),
                // Hooks fire whether or not the server is up.
                Err(ClientError::ServerNotRunning) => debug!("server not running, git event dropped"),
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

fn print_status(status: &StatusResponse) {
    if !status.running {
        println!("VibeTunnel server is not running");
        return;
    }
    println!("VibeTunnel server is running");
    if let Some(port) = status.port {
        println!("  Port: {port}");
    }
    if let Some(url) = &status.url {
        println!("  URL: {url}");
    }
    if let Some(version) = &status.version {
        match &status.build_date {
            Some(date) => println!("  Version: {version} ({date})"),
            None => println!("  Version: {version}"),
        }
    }
    match &status.follow_mode {
        Some(follow) if follow.enabled => println!(
            "  Follow mode: {} ({})",
            follow.branch.as_deref().unwrap_or("unknown"),
            follow.repo_path.as_deref().unwrap_or("unknown")
        ),
        _ => println!("  Follow mode: disabled"),
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

async fn toplevel() -> Result<PathBuf> {
    let cwd = env::current_dir().context("failed to read current directory")?;
    let output = GitCli::new()
        .run(&cwd, &["rev-parse", "--show-toplevel"])
        .await
        .context("not inside a git repository")?;
    Ok(PathBuf::from(output.trimmed()))
}

/// `--repo`, else the main checkout of the repository around the cwd, even
/// when run from inside a linked worktree.
async fn main_repo(repo: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(repo) = repo {
        return Ok(absolute(&repo));
    }
    let cwd = env::current_dir().context("failed to read current directory")?;
    let git_dir = GitCli::new()
        .run(&cwd, &["rev-parse", "--git-dir"])
        .await
        .context("not inside a git repository")?;
    match main_repo_from_git_dir(git_dir.trimmed()) {
        Some(main) => Ok(main),
        None => toplevel().await,
    }
}
