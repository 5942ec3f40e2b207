//! Socket locations, timeouts and the server identity reported to clients.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONTROL_DIR_ENV: &str = "VIBETUNNEL_CONTROL_DIR";
pub const CONTROL_SOCKET_NAME: &str = "control.sock";
pub const API_SOCKET_NAME: &str = "api.sock";

pub const DEFAULT_PORT: u16 = 4020;
pub const DEFAULT_LAUNCHER: &str = "vibetunnel";

pub const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set by release builds; absent in dev builds.
pub fn build_date() -> Option<&'static str> {
    option_env!("VIBETUNNEL_BUILD_DATE")
}

pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Directory holding both Unix sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPaths {
    dir: PathBuf,
}

impl ControlPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$VIBETUNNEL_CONTROL_DIR`, else `$HOME/.vibetunnel`.
    pub fn from_env() -> Self {
        match env::var_os(CONTROL_DIR_ENV).filter(|dir| !dir.is_empty()) {
            Some(dir) => Self::new(dir),
            None => {
                let home = home_dir().unwrap_or_else(|| PathBuf::from("/"));
                Self::new(home.join(".vibetunnel"))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn control_socket(&self) -> PathBuf {
        self.dir.join(CONTROL_SOCKET_NAME)
    }

    pub fn api_socket(&self) -> PathBuf {
        self.dir.join(API_SOCKET_NAME)
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }
}

/// Where the HTTP side of the server is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub port: u16,
    pub url: String,
}

impl ServerInfo {
    pub fn new(port: u16, url: Option<String>) -> Self {
        let url = url.unwrap_or_else(|| format!("http://localhost:{port}"));
        Self { port, url }
    }
}
