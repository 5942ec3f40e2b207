use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::message::{Category, ControlMessage, TerminalSpawnRequest, TerminalSpawnResponse};
use super::router::{CategoryHandler, HandlerError};

fn payload<T: DeserializeOwned>(message: &ControlMessage) -> Result<T, HandlerError> {
    let value = message
        .payload
        .clone()
        .ok_or_else(|| HandlerError::InvalidPayload(format!("{} requires a payload", message.action)))?;
    serde_json::from_value(value).map_err(|err| HandlerError::InvalidPayload(err.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalAction {
    Spawn(TerminalSpawnRequest),
}

impl TryFrom<&ControlMessage> for TerminalAction {
    type Error = HandlerError;

    fn try_from(message: &ControlMessage) -> Result<Self, Self::Error> {
        match message.action.as_str() {
            "spawn" => Ok(TerminalAction::Spawn(payload(message)?)),
            other => Err(HandlerError::UnknownAction {
                category: Category::Terminal,
                action: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAction {
    Ready,
    Ping,
}

impl TryFrom<&ControlMessage> for SystemAction {
    type Error = HandlerError;

    fn try_from(message: &ControlMessage) -> Result<Self, Self::Error> {
        match message.action.as_str() {
            "ready" => Ok(SystemAction::Ready),
            "ping" => Ok(SystemAction::Ping),
            other => Err(HandlerError::UnknownAction {
                category: Category::System,
                action: other.to_string(),
            }),
        }
    }
}

/// Opens new terminal windows by running `<launcher> launch ...` detached.
pub struct TerminalHandler {
    launcher: String,
}

impl TerminalHandler {
    pub fn new(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
        }
    }

    fn spawn(&self, request: &TerminalSpawnRequest) -> TerminalSpawnResponse {
        let args = launch_args(request);
        info!(launcher = %self.launcher, ?args, session_id = %request.session_id, "spawning terminal");

        let spawned = Command::new(&self.launcher)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();

        match spawned {
            Ok(child) => TerminalSpawnResponse {
                success: true,
                pid: child.id(),
                error: None,
            },
            Err(err) => {
                error!(launcher = %self.launcher, error = %err, "failed to spawn terminal");
                TerminalSpawnResponse {
                    success: false,
                    pid: None,
                    error: Some(format!("Failed to spawn terminal: {err}")),
                }
            }
        }
    }
}

pub fn launch_args(request: &TerminalSpawnRequest) -> Vec<String> {
    let mut args = vec!["launch".to_string()];
    if let Some(dir) = &request.working_directory {
        args.extend(["--working-directory".to_string(), dir.clone()]);
    }
    if let Some(command) = &request.command {
        args.extend(["--command".to_string(), command.clone()]);
    }
    args.extend(["--session-id".to_string(), request.session_id.clone()]);
    if let Some(terminal) = &request.terminal_preference {
        args.extend(["--terminal".to_string(), terminal.clone()]);
    }
    args
}

#[async_trait]
impl CategoryHandler for TerminalHandler {
    async fn handle(&self, message: &ControlMessage) -> Result<Option<ControlMessage>, HandlerError> {
        match TerminalAction::try_from(message)? {
            TerminalAction::Spawn(request) => {
                let outcome = self.spawn(&request);
                let error = outcome.error.clone();
                let payload = serde_json::to_value(&outcome).ok();
                Ok(Some(ControlMessage::response_to(message, payload, error)))
            }
        }
    }
}

pub struct SystemHandler;

#[async_trait]
impl CategoryHandler for SystemHandler {
    async fn handle(&self, message: &ControlMessage) -> Result<Option<ControlMessage>, HandlerError> {
        match SystemAction::try_from(message) {
            Ok(SystemAction::Ready) => {
                info!(kind = ?message.kind, "control peer reported ready");
                Ok(None)
            }
            // Ping requests never reach here.
            Ok(SystemAction::Ping) => Ok(None),
            Err(err) => {
                warn!(action = %message.action, "unknown system action");
                Err(err)
            }
        }
    }
}
