//! `api.sock`: status and follow-mode requests from the `vt` CLI.
//!
//! Unlike the control socket, every connection is served independently.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::forward::GitEventForwarder;
use super::protocol::{
    ApiFrame, ApiMessage, ApiParser, ErrorPayload, GitEventAck, GitEventNotify, GitFollowRequest, GitFollowResponse,
    StatusResponse,
};
use crate::config::{self, ServerInfo, DEFAULT_PORT};
use crate::control::message::SystemNotification;
use crate::control::ControlUnixHandler;
use crate::follow::{dir_name, FollowError, FollowMode, FollowTarget};

const READ_CHUNK: usize = 64 * 1024;

pub struct ApiSocketServer {
    socket_path: PathBuf,
    status_dir: PathBuf,
    server_info: RwLock<Option<ServerInfo>>,
    follow: FollowMode,
    forwarder: Arc<dyn GitEventForwarder>,
    control: Option<Arc<ControlUnixHandler>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ApiSocketServer {
    pub fn new(socket_path: impl Into<PathBuf>, follow: FollowMode, forwarder: Arc<dyn GitEventForwarder>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            socket_path: socket_path.into(),
            status_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            server_info: RwLock::new(None),
            follow,
            forwarder,
            control: None,
            shutdown,
            accept_task: Mutex::new(None),
        }
    }

    /// Mac app channel used for follow-mode banners.
    pub fn with_control(mut self, control: Arc<ControlUnixHandler>) -> Self {
        self.control = Some(control);
        self
    }

    /// Directory whose repository is reported in status responses.
    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = dir.into();
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn set_server_info(&self, info: ServerInfo) {
        *self.server_info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "removed stale API socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.socket_path.display(), error = %err, "failed to remove stale API socket"),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "API socket listening");

        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(self), self.shutdown.subscribe()));
        if let Some(previous) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(err) = fs::remove_file(&self.socket_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "failed to remove API socket");
            }
        }
        info!(path = %self.socket_path.display(), "API socket stopped");
    }

    async fn serve_connection(self: Arc<Self>, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        let mut parser = ApiParser::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    error!(error = %err, "API socket connection error");
                    break;
                }
            };
            parser.add_data(&buf[..n]);

            let frames: Vec<ApiFrame> = parser.parse_messages().collect();
            for frame in frames {
                let Some(reply) = self.handle_frame(frame).await else { continue };
                if let Err(err) = writer.write_all(&reply).await {
                    error!(error = %err, "failed to write API response");
                    return;
                }
            }
        }
        debug!("API client disconnected");
    }

    /// Bytes to write back for one inbound frame.
    pub async fn handle_frame(&self, frame: ApiFrame) -> Option<Vec<u8>> {
        let reply = match ApiMessage::decode(&frame) {
            Ok(message) => self.handle_message(message).await?,
            Err(err) => {
                error!(kind = %frame.kind, error = %err, "failed to parse API payload");
                ApiMessage::Error(ErrorPayload::api_error(format!("Invalid {} payload: {err}", frame.kind)))
            }
        };

        match reply.encode() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                error!(kind = %reply.kind(), error = %err, "failed to encode API response");
                ApiMessage::Error(ErrorPayload::api_error(err.to_string())).encode().ok()
            }
        }
    }

    pub async fn handle_message(&self, message: ApiMessage) -> Option<ApiMessage> {
        match message {
            ApiMessage::StatusRequest(_) => Some(ApiMessage::StatusResponse(self.status().await)),
            ApiMessage::GitFollowRequest(request) => {
                Some(ApiMessage::GitFollowResponse(self.git_follow(request).await))
            }
            ApiMessage::GitEventNotify(event) => Some(ApiMessage::GitEventAck(self.git_event(event).await)),
            other => {
                warn!(kind = %other.kind(), "unhandled API message type");
                None
            }
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let info = self.server_info();
        StatusResponse {
            running: true,
            port: info.as_ref().map(|info| info.port),
            url: info.map(|info| info.url),
            version: Some(config::VERSION.to_string()),
            build_date: config::build_date().map(str::to_string),
            follow_mode: self.follow.status(&self.status_dir).await,
        }
    }

    pub async fn git_follow(&self, request: GitFollowRequest) -> GitFollowResponse {
        let Some(main_repo) = request.main_repo_path.or(request.repo_path).map(absolutize) else {
            return GitFollowResponse::failure(FollowError::NoRepository);
        };
        let repo_name = dir_name(&main_repo);

        if request.enable {
            let target = match (request.worktree_path, request.branch) {
                (Some(worktree), _) => FollowTarget::Worktree(absolutize(worktree)),
                (None, Some(branch)) => FollowTarget::Branch(branch),
                (None, None) => FollowTarget::CurrentBranch,
            };
            match self.follow.enable(&main_repo, target).await {
                Ok(outcome) => {
                    self.notify(
                        "Follow Mode Enabled",
                        format!("Now following {} in {repo_name}", outcome.display_name),
                    );
                    GitFollowResponse {
                        success: true,
                        current_branch: Some(outcome.display_name),
                        ..GitFollowResponse::default()
                    }
                }
                Err(err) => {
                    warn!(repo = %main_repo.display(), error = %err, "failed to enable follow mode");
                    GitFollowResponse::failure(err)
                }
            }
        } else {
            match self.follow.disable(&main_repo).await {
                Ok(_) => {
                    self.notify("Follow Mode Disabled", format!("Follow mode disabled in {repo_name}"));
                    GitFollowResponse {
                        success: true,
                        ..GitFollowResponse::default()
                    }
                }
                Err(err) => {
                    warn!(repo = %main_repo.display(), error = %err, "failed to disable follow mode");
                    GitFollowResponse::failure(err)
                }
            }
        }
    }

    pub async fn git_event(&self, event: GitEventNotify) -> GitEventAck {
        debug!(kind = ?event.kind, repo = %event.repo_path, "git event received");
        let port = self.server_info().map_or(DEFAULT_PORT, |info| info.port);
        match self.forwarder.forward(port, &event).await {
            Ok(()) => GitEventAck { handled: true },
            Err(err) => {
                error!(error = %err, "failed to forward git event");
                GitEventAck { handled: false }
            }
        }
    }

    fn notify(&self, title: &str, message: String) {
        let Some(control) = self.control.as_ref().filter(|control| control.is_mac_app_connected()) else {
            return;
        };
        control.send_system_notification(&SystemNotification {
            level: "info".to_string(),
            title: title.to_string(),
            message,
        });
    }
}

fn absolutize(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

async fn accept_loop(listener: UnixListener, server: Weak<ApiSocketServer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let Some(server) = server.upgrade() else { break };
                        tokio::spawn(server.serve_connection(stream));
                    }
                    Err(err) => {
                        error!(error = %err, "API socket accept failed");
                        continue;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
