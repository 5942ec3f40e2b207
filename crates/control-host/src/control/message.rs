//! Control-protocol envelope shared with the macOS app.
//!
//! Each frame body is one JSON object:
//! `{id, type, category, action, payload?, sessionId?, userId?, error?}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::frame::{try_encode_frame, FrameDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// Routing key. Unrecognised strings survive decoding so a request can still
/// be answered with an "Unknown category" error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Terminal,
    Git,
    System,
    Notification,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Terminal => "terminal",
            Category::Git => "git",
            Category::System => "system",
            Category::Notification => "notification",
            Category::Other(name) => name,
        }
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        match value.as_str() {
            "terminal" => Category::Terminal,
            "git" => Category::Git,
            "system" => Category::System,
            "notification" => Category::Notification,
            _ => Category::Other(value),
        }
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        match value {
            Category::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Required for request/response pairing; events may leave it empty.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub category: Category,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlMessage {
    fn new(
        kind: MessageKind,
        category: Category,
        action: impl Into<String>,
        payload: Option<Value>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            category,
            action: action.into(),
            payload,
            session_id,
            user_id: None,
            error: None,
        }
    }

    pub fn request(
        category: Category,
        action: impl Into<String>,
        payload: Option<Value>,
        session_id: Option<String>,
    ) -> Self {
        Self::new(MessageKind::Request, category, action, payload, session_id)
    }

    pub fn event(
        category: Category,
        action: impl Into<String>,
        payload: Option<Value>,
        session_id: Option<String>,
    ) -> Self {
        Self::new(MessageKind::Event, category, action, payload, session_id)
    }

    /// Response paired with `request` by id, category and action.
    pub fn response_to(request: &ControlMessage, payload: Option<Value>, error: Option<String>) -> Self {
        Self {
            id: request.id.clone(),
            kind: MessageKind::Response,
            category: request.category.clone(),
            action: request.action.clone(),
            payload,
            session_id: request.session_id.clone(),
            user_id: None,
            error,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    pub fn is(&self, category: &Category, action: &str) -> bool {
        &self.category == category && self.action == action
    }

    /// Wire bytes: length header plus UTF-8 JSON.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        try_encode_frame(&body).map_err(serde_json::Error::io)
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Frame decoder that turns bodies into envelopes.
#[derive(Debug, Default)]
pub struct ControlParser {
    frames: FrameDecoder,
}

impl ControlParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&mut self, chunk: &[u8]) {
        self.frames.add_data(chunk);
    }

    pub fn pending_bytes(&self) -> usize {
        self.frames.pending_bytes()
    }

    /// Complete envelopes currently buffered. A body that is not a valid
    /// envelope is consumed, logged and skipped.
    pub fn parse_messages(&mut self) -> impl Iterator<Item = ControlMessage> + '_ {
        self.frames
            .frames()
            .filter_map(|body| match ControlMessage::decode(&body) {
                Ok(message) => Some(message),
                Err(err) => {
                    error!(
                        len = body.len(),
                        error = %err,
                        raw = %String::from_utf8_lossy(&body[..body.len().min(200)]),
                        "failed to parse control message"
                    );
                    None
                }
            })
    }
}

// ── Typed payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSpawnRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ahead_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_behind_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_has_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_is_worktree: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_main_repo_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSpawnResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReadyEvent {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SystemReadyEvent {
    pub fn now() -> Self {
        Self {
            timestamp: Timestamp::now().as_millis(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPingResponse {
    pub status: String,
    pub timestamp: u64,
}

impl SystemPingResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: Timestamp::now().as_millis(),
        }
    }
}

/// `system:notification` payload shown by the app as a banner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotification {
    pub level: String,
    pub title: String,
    pub message: String,
}

/// `notification:show` payload. Extra options ride along flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMonitorAction {
    SessionStart,
    SessionExit,
    CommandFinished,
    CommandError,
    Bell,
    ClaudeTurn,
}

impl SessionMonitorAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMonitorAction::SessionStart => "session-start",
            SessionMonitorAction::SessionExit => "session-exit",
            SessionMonitorAction::CommandFinished => "command-finished",
            SessionMonitorAction::CommandError => "command-error",
            SessionMonitorAction::Bell => "bell",
            SessionMonitorAction::ClaudeTurn => "claude-turn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStatus {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
}

/// Session lifecycle event forwarded to the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMonitorEvent {
    #[serde(rename = "type")]
    pub action: SessionMonitorAction,
    pub session_id: String,
    pub session_name: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_status: Option<ActivityStatus>,
}

impl SessionMonitorEvent {
    pub fn new(action: SessionMonitorAction, session_id: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            action,
            session_id: session_id.into(),
            session_name: session_name.into(),
            timestamp: Timestamp::now().to_string(),
            exit_code: None,
            command: None,
            duration: None,
            activity_status: None,
        }
    }

    pub fn session_exited(session_id: impl Into<String>, session_name: impl Into<String>, exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::new(SessionMonitorAction::SessionExit, session_id, session_name)
        }
    }

    pub fn command_finished(
        session_id: impl Into<String>,
        session_name: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
        duration_ms: u64,
    ) -> Self {
        let action = if exit_code == 0 {
            SessionMonitorAction::CommandFinished
        } else {
            SessionMonitorAction::CommandError
        };
        Self {
            exit_code: Some(exit_code),
            command: Some(command.into()),
            duration: Some(duration_ms),
            ..Self::new(action, session_id, session_name)
        }
    }

    pub fn claude_turn(session_id: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            activity_status: Some(ActivityStatus {
                is_active: false,
                app: Some("claude".to_string()),
            }),
            ..Self::new(SessionMonitorAction::ClaudeTurn, session_id, session_name)
        }
    }
}
