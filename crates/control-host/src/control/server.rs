//! Control socket for the native Mac app.

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionManager, Inbound};
use super::handlers::{SystemHandler, TerminalHandler};
use super::message::{Category, ControlMessage, NotificationPayload, SessionMonitorEvent, SystemNotification};
use super::router::Router;
use crate::config::{CONTROL_REQUEST_TIMEOUT, DEFAULT_LAUNCHER};
use crate::correlator::Correlator;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
    pub request_timeout: Duration,
    /// Program run by `terminal:spawn`.
    pub launcher: String,
}

impl ControlConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout: CONTROL_REQUEST_TIMEOUT,
            launcher: DEFAULT_LAUNCHER.to_string(),
        }
    }
}

pub struct ControlUnixHandler {
    config: ControlConfig,
    connections: Arc<ConnectionManager>,
    pending: Correlator<String, ControlMessage>,
    router: Router,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlUnixHandler {
    /// Build the handler with the terminal and system categories registered.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: ControlConfig) -> Arc<Self> {
        let mut router = Router::new();
        router.register(Category::Terminal, Arc::new(TerminalHandler::new(config.launcher.clone())));
        router.register(Category::System, Arc::new(SystemHandler));
        Self::with_router(config, router)
    }

    pub fn with_router(config: ControlConfig, router: Router) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let handler = Arc::new(Self {
            config,
            connections: ConnectionManager::new(),
            pending: Correlator::new(),
            router,
            inbound: inbound_tx,
            shutdown,
            accept_task: Mutex::new(None),
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&handler), inbound_rx));
        handler
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Bind the control socket (replacing any stale file) and start accepting.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let path = &self.config.socket_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Clean up stale socket from a previous run
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove stale control socket"),
        }

        let listener = UnixListener::bind(path)?;
        if let Err(err) = fs::set_permissions(path, Permissions::from_mode(0o600)) {
            warn!(path = %path.display(), error = %err, "failed to restrict control socket permissions");
        }
        info!(path = %path.display(), "control socket listening");

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

    /// Adopt an already-connected stream as the Mac app peer.
    pub fn accept(self: &Arc<Self>, stream: UnixStream) -> u64 {
        self.connections.attach(stream, self.inbound.clone())
    }

    /// Stop accepting, drop the peer and remove the socket file.
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
        self.connections.close();

        match fs::remove_file(&self.config.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "failed to remove control socket"),
        }
        info!(path = %self.config.socket_path.display(), "control socket stopped");
    }

    pub fn is_mac_app_connected(&self) -> bool {
        self.connections.is_connected()
    }

    /// Route one message as if it had arrived from the peer.
    pub async fn handle_message(&self, message: ControlMessage) -> Option<ControlMessage> {
        self.router.dispatch(message, &self.pending).await
    }

    /// Send a request and wait for the app's response.
    ///
    /// `None` when no app is connected or no response arrived in time.
    pub async fn send_control_message(&self, message: ControlMessage) -> Option<ControlMessage> {
        if !self.is_mac_app_connected() {
            debug!(id = %message.id, "no Mac app connected, not sending control request");
            return None;
        }
        let key = message.id.clone();
        self.pending
            .send_and_await(key, self.config.request_timeout, || self.connections.send(&message))
            .await
    }

    pub fn send_notification(&self, title: &str, body: &str, options: Map<String, Value>) {
        if !self.is_mac_app_connected() {
            warn!(title, "cannot send notification, Mac app not connected");
            return;
        }
        let payload = NotificationPayload {
            title: title.to_string(),
            body: body.to_string(),
            options,
        };
        let message = ControlMessage::event(
            Category::Notification,
            "show",
            serde_json::to_value(&payload).ok(),
            None,
        );
        if self.connections.send(&message) {
            info!(title, body, "sent notification");
        }
    }

    /// `system:notification` banner.
    pub fn send_system_notification(&self, notification: &SystemNotification) -> bool {
        let message = ControlMessage::event(
            Category::System,
            "notification",
            serde_json::to_value(notification).ok(),
            None,
        );
        self.connections.send(&message)
    }

    /// Forward a session lifecycle event to the app's session monitor.
    pub fn send_session_event(&self, event: &SessionMonitorEvent) -> bool {
        if !self.is_mac_app_connected() {
            debug!(session_id = %event.session_id, "no Mac app connected, dropping session event");
            return false;
        }
        let message = ControlMessage::event(
            Category::Notification,
            event.action.as_str(),
            serde_json::to_value(event).ok(),
            Some(event.session_id.clone()),
        );
        self.connections.send(&message)
    }
}

async fn accept_loop(listener: UnixListener, handler: Weak<ControlUnixHandler>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let Some(handler) = handler.upgrade() else { break };
                        handler.accept(stream);
                    }
                    Err(err) => {
                        error!(error = %err, "control socket accept failed");
                        continue;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn dispatch_loop(handler: Weak<ControlUnixHandler>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(Inbound { peer_id, message }) = inbound.recv().await {
        let Some(handler) = handler.upgrade() else { break };
        let Some(reply) = handler.router.dispatch(message, &handler.pending).await else {
            continue;
        };
        if handler.connections.primary_id() != Some(peer_id) {
            debug!(peer_id, id = %reply.id, "peer replaced before reply was ready, dropping reply");
            continue;
        }
        handler.connections.send(&reply);
    }
}
