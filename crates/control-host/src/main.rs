//! VibeTunnel control-plane server.
//!
//! Listens on `control.sock` for the native Mac app and on `api.sock` for the
//! `vt` command, until SIGINT or SIGTERM.
//!
//! Usage: vibetunnel-control [--port 4020] [--control-dir DIR] [--launcher PROG]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use vibetunnel_control::api::{ApiSocketServer, HttpForwarder};
use vibetunnel_control::config::{self, ControlPaths, ServerInfo, CONTROL_DIR_ENV, DEFAULT_LAUNCHER, DEFAULT_PORT};
use vibetunnel_control::control::{ControlConfig, ControlUnixHandler};
use vibetunnel_control::follow::FollowMode;
use vibetunnel_control::git::GitCli;
use vibetunnel_control::hooks::HookInstaller;
use vibetunnel_control::logging;

#[derive(Debug, Parser)]
#[command(name = "vibetunnel-control", version, about = "VibeTunnel control and API sockets")]
struct Args {
    /// Port of the VibeTunnel HTTP server.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Public URL of the HTTP server (defaults to http://localhost:<port>).
    #[arg(long)]
    url: Option<String>,

    /// Directory holding control.sock and api.sock.
    #[arg(long, env = CONTROL_DIR_ENV)]
    control_dir: Option<PathBuf>,

    /// Program run by terminal:spawn requests.
    #[arg(long, default_value = DEFAULT_LAUNCHER)]
    launcher: String,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let paths = match args.control_dir {
        Some(dir) => ControlPaths::new(dir),
        None => ControlPaths::from_env(),
    };
    paths
        .ensure_dir()
        .with_context(|| format!("failed to create {}", paths.dir().display()))?;

    let mut control_config = ControlConfig::new(paths.control_socket());
    control_config.launcher = args.launcher;
    let control = ControlUnixHandler::new(control_config);
    control
        .start()
        .with_context(|| format!("failed to bind {}", paths.control_socket().display()))?;

    let git = Arc::new(GitCli::new());
    let hooks = Arc::new(HookInstaller::new(git.clone()));
    let api = Arc::new(
        ApiSocketServer::new(
            paths.api_socket(),
            FollowMode::new(git, hooks),
            Arc::new(HttpForwarder::default()),
        )
        .with_control(control.clone()),
    );
    api.set_server_info(ServerInfo::new(args.port, args.url));
    api.start()
        .with_context(|| format!("failed to bind {}", paths.api_socket().display()))?;

    info!(
        dir = %paths.dir().display(),
        port = args.port,
        version = config::VERSION,
        "control plane ready"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    api.stop().await;
    control.stop().await;
    info!("shut down");
    Ok(())
}
