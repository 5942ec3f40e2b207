//! Shared harness for control-plane integration tests.
//!
//! Spawns the real server binary against a temp control dir, connects over
//! Unix sockets, and reads/writes length-prefixed frames.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use vibetunnel_control::api::forward::{ForwardError, GitEventForwarder};
use vibetunnel_control::api::protocol::GitEventNotify;
use vibetunnel_control::git::{GitError, GitExecutor, GitOutput};
use vibetunnel_control::hooks::{GitHooks, HookResult};

// ── Frame encoding/decoding ─────────────────────────────────────────

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ── SocketClient ────────────────────────────────────────────────────

/// Blocking client speaking raw frames, standing in for the Mac app.
pub struct SocketClient {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    pub fn send_json(&mut self, value: &Value) -> io::Result<()> {
        let body = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send_raw(&encode_frame(&body))
    }

    /// Next frame body. None on timeout or disconnect.
    pub fn recv_frame(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_buf.len() >= 4 {
                let len = u32::from_be_bytes([self.read_buf[0], self.read_buf[1], self.read_buf[2], self.read_buf[3]])
                    as usize;
                if self.read_buf.len() >= 4 + len {
                    let body = self.read_buf[4..4 + len].to_vec();
                    self.read_buf.drain(..4 + len);
                    return Some(body);
                }
            }

            if Instant::now() > deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn recv_json(&mut self, timeout: Duration) -> Option<Value> {
        let body = self.recv_frame(timeout)?;
        serde_json::from_slice(&body).ok()
    }

    /// Wait for a control message with the given category and action,
    /// discarding others.
    pub fn wait_for_message(&mut self, category: &str, action: &str, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.recv_json(remaining) {
                Some(msg) if msg["category"] == category && msg["action"] == action => return Some(msg),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Collect all control messages that arrive within `timeout`.
    pub fn collect_messages(&mut self, timeout: Duration) -> Vec<Value> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv_json(remaining) {
                Some(msg) => messages.push(msg),
                None => break,
            }
        }
        messages
    }

    /// True once the server has closed its end.
    pub fn is_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();
            let mut buf = [0u8; 4096];
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    continue
                }
                Err(_) => return true,
            }
        }
    }
}

pub fn connect(socket_path: &Path) -> io::Result<SocketClient> {
    let stream = UnixStream::connect(socket_path)?;
    Ok(SocketClient::new(stream))
}

// ── ServerHandle ────────────────────────────────────────────────────

/// Handle to a running `vibetunnel-control` process. Cleans up on drop.
pub struct ServerHandle {
    pub child: Child,
    pub control_dir: PathBuf,
    pub home_dir: PathBuf,
    pub port: u16,
}

impl ServerHandle {
    pub fn control_socket(&self) -> PathBuf {
        self.control_dir.join("control.sock")
    }

    pub fn api_socket(&self) -> PathBuf {
        self.control_dir.join("api.sock")
    }

    /// SIGTERM, then wait up to `timeout` for exit.
    pub fn terminate(&mut self, timeout: Duration) -> bool {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(self.child.id().to_string())
            .status();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = fs::remove_dir_all(&self.home_dir);
    }
}

fn server_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vibetunnel-control"))
}

pub fn vt_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vt"))
}

/// Spawn the server with a temp HOME and control dir; returns once both
/// sockets exist.
pub fn spawn_server(port: u16) -> io::Result<ServerHandle> {
    #[allow(deprecated)]
    let home_dir = tempfile::tempdir()?.into_path();
    let control_dir = home_dir.join(".vibetunnel");

    let child = Command::new(server_binary())
        .arg("--port")
        .arg(port.to_string())
        .arg("--launcher")
        .arg("true")
        .arg("--log-level")
        .arg("debug")
        .env("HOME", &home_dir)
        .env("VIBETUNNEL_CONTROL_DIR", &control_dir)
        .current_dir(&home_dir)
        .spawn()?;

    let handle = ServerHandle {
        child,
        control_dir,
        home_dir,
        port,
    };
    wait_for_socket(&handle.control_socket())?;
    wait_for_socket(&handle.api_socket())?;

    // Brief delay to let the listeners start accepting
    std::thread::sleep(Duration::from_millis(50));
    Ok(handle)
}

pub fn wait_for_socket(path: &Path) -> io::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not appear within 5 seconds", path.display()),
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

/// Run `vt` against `control_dir`.
pub fn run_vt(control_dir: &Path, args: &[&str]) -> io::Result<Output> {
    Command::new(vt_binary())
        .args(args)
        .env("VIBETUNNEL_CONTROL_DIR", control_dir)
        .env_remove("RUST_LOG")
        .output()
}

// ── In-process fakes ────────────────────────────────────────────────

/// Answers git invocations by joined argv. Local config writes succeed,
/// everything else unscripted fails as "not a git repository".
#[derive(Default)]
pub struct FakeGit {
    answers: HashMap<String, String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeGit {
    pub fn answer(mut self, args: &str, stdout: &str) -> Self {
        self.answers.insert(args.to_string(), stdout.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitExecutor for FakeGit {
    async fn run(&self, _cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let key = args.join(" ");
        self.calls.lock().unwrap().push(key.clone());
        match self.answers.get(&key) {
            Some(stdout) => Ok(GitOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            None if key.starts_with("config --local") => Ok(GitOutput::default()),
            None => Err(GitError::classify(Some(128), "fatal: not a git repository")),
        }
    }
}

#[derive(Default)]
pub struct FakeHooks {
    pub installed: Mutex<Vec<PathBuf>>,
    pub uninstalled: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl GitHooks for FakeHooks {
    async fn are_installed(&self, repo: &Path) -> bool {
        self.installed.lock().unwrap().iter().any(|path| path == repo)
    }

    async fn install(&self, repo: &Path) -> HookResult {
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

/// Records forwarded events instead of POSTing them.
#[derive(Default)]
pub struct RecordingForwarder {
    pub events: Mutex<Vec<(u16, GitEventNotify)>>,
}

#[async_trait]
impl GitEventForwarder for RecordingForwarder {
    async fn forward(&self, port: u16, event: &GitEventNotify) -> Result<(), ForwardError> {
        self.events.lock().unwrap().push((port, event.clone()));
        Ok(())
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
