//! Typed messages on `api.sock`.
//!
//! Frame body is `[u8 type][JSON payload]`, inside the usual
//! `[u32 length]` header.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::frame::{try_encode_frame, FrameDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Error = 0x05,
    StatusRequest = 0x20,
    StatusResponse = 0x21,
    GitFollowRequest = 0x30,
    GitFollowResponse = 0x31,
    GitEventNotify = 0x32,
    GitEventAck = 0x33,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x05 => MessageType::Error,
            0x20 => MessageType::StatusRequest,
            0x21 => MessageType::StatusResponse,
            0x30 => MessageType::GitFollowRequest,
            0x31 => MessageType::GitFollowResponse,
            0x32 => MessageType::GitEventNotify,
            0x33 => MessageType::GitEventAck,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Error => "ERROR",
            MessageType::StatusRequest => "STATUS_REQUEST",
            MessageType::StatusResponse => "STATUS_RESPONSE",
            MessageType::GitFollowRequest => "GIT_FOLLOW_REQUEST",
            MessageType::GitFollowResponse => "GIT_FOLLOW_RESPONSE",
            MessageType::GitEventNotify => "GIT_EVENT_NOTIFY",
            MessageType::GitEventAck => "GIT_EVENT_ACK",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowModeStatus {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_mode: Option<FollowModeStatus>,
}

impl StatusResponse {
    pub fn not_running() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFollowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_repo_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFollowResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GitFollowResponse {
    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitEventKind {
    Checkout,
    Commit,
    Merge,
    Rebase,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitEventNotify {
    pub repo_path: String,
    #[serde(rename = "type")]
    pub kind: GitEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitEventAck {
    pub handled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn api_error(message: impl Into<String>) -> Self {
        Self {
            code: "API_ERROR".to_string(),
            message: message.into(),
            details: None,
        }
    }
}

// ── Request/response pairing ────────────────────────────────────────

/// A request type and the one response type it is answered with.
pub trait ApiRequest: Serialize + Send + Sync {
    const TYPE: MessageType;
    type Response: ApiResponse;
}

pub trait ApiResponse: DeserializeOwned + Send {
    const TYPE: MessageType;
}

impl ApiRequest for StatusRequest {
    const TYPE: MessageType = MessageType::StatusRequest;
    type Response = StatusResponse;
}

impl ApiResponse for StatusResponse {
    const TYPE: MessageType = MessageType::StatusResponse;
}

impl ApiRequest for GitFollowRequest {
    const TYPE: MessageType = MessageType::GitFollowRequest;
    type Response = GitFollowResponse;
}

impl ApiResponse for GitFollowResponse {
    const TYPE: MessageType = MessageType::GitFollowResponse;
}

impl ApiRequest for GitEventNotify {
    const TYPE: MessageType = MessageType::GitEventNotify;
    type Response = GitEventAck;
}

impl ApiResponse for GitEventAck {
    const TYPE: MessageType = MessageType::GitEventAck;
}

// ── Framing ─────────────────────────────────────────────────────────

/// One decoded frame whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFrame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl ApiFrame {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        // Empty payloads stand for `{}`.
        let payload: &[u8] = if self.payload.is_empty() { b"{}" } else { &self.payload };
        serde_json::from_slice(payload)
    }
}

pub fn encode_message<T: Serialize + ?Sized>(kind: MessageType, payload: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = vec![kind.code()];
    serde_json::to_writer(&mut body, payload)?;
    try_encode_frame(&body).map_err(serde_json::Error::io)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiMessage {
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
    GitFollowRequest(GitFollowRequest),
    GitFollowResponse(GitFollowResponse),
    GitEventNotify(GitEventNotify),
    GitEventAck(GitEventAck),
    Error(ErrorPayload),
}

impl ApiMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            ApiMessage::StatusRequest(_) => MessageType::StatusRequest,
            ApiMessage::StatusResponse(_) => MessageType::StatusResponse,
            ApiMessage::GitFollowRequest(_) => MessageType::GitFollowRequest,
            ApiMessage::GitFollowResponse(_) => MessageType::GitFollowResponse,
            ApiMessage::GitEventNotify(_) => MessageType::GitEventNotify,
            ApiMessage::GitEventAck(_) => MessageType::GitEventAck,
            ApiMessage::Error(_) => MessageType::Error,
        }
    }

    pub fn decode(frame: &ApiFrame) -> Result<Self, serde_json::Error> {
        Ok(match frame.kind {
            MessageType::StatusRequest => ApiMessage::StatusRequest(frame.json()?),
            MessageType::StatusResponse => ApiMessage::StatusResponse(frame.json()?),
            MessageType::GitFollowRequest => ApiMessage::GitFollowRequest(frame.json()?),
            MessageType::GitFollowResponse => ApiMessage::GitFollowResponse(frame.json()?),
            MessageType::GitEventNotify => ApiMessage::GitEventNotify(frame.json()?),
            MessageType::GitEventAck => ApiMessage::GitEventAck(frame.json()?),
            MessageType::Error => ApiMessage::Error(frame.json()?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let kind = self.kind();
        match self {
            ApiMessage::StatusRequest(p) => encode_message(kind, p),
            ApiMessage::StatusResponse(p) => encode_message(kind, p),
            ApiMessage::GitFollowRequest(p) => encode_message(kind, p),
            ApiMessage::GitFollowResponse(p) => encode_message(kind, p),
            ApiMessage::GitEventNotify(p) => encode_message(kind, p),
            ApiMessage::GitEventAck(p) => encode_message(kind, p),
            ApiMessage::Error(p) => encode_message(kind, p),
        }
    }
}

#[derive(Debug, Default)]
pub struct ApiParser {
    frames: FrameDecoder,
}

impl ApiParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&mut self, chunk: &[u8]) {
        self.frames.add_data(chunk);
    }

    pub fn pending_bytes(&self) -> usize {
        self.frames.pending_bytes()
    }

    /// Complete frames buffered so far. Unknown type bytes are skipped.
    pub fn parse_messages(&mut self) -> impl Iterator<Item = ApiFrame> + '_ {
        self.frames.frames().filter_map(|mut body| {
            let code = body[0];
            let Some(kind) = MessageType::from_code(code) else {
                warn!(code, len = body.len(), "unknown API message type");
                return None;
            };
            body.remove(0);
            Some(ApiFrame { kind, payload: body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, MAX_MESSAGE_SIZE};
    use serde_json::json;

    #[test]
    fn type_codes_round_trip() {
        for kind in [
            MessageType::Error,
            MessageType::StatusRequest,
            MessageType::StatusResponse,
            MessageType::GitFollowRequest,
            MessageType::GitFollowResponse,
            MessageType::GitEventNotify,
            MessageType::GitEventAck,
        ] {
            assert_eq!(MessageType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageType::from_code(0x01), None);
        assert_eq!(MessageType::StatusResponse.to_string(), "STATUS_RESPONSE");
    }

    #[test]
    fn frame_layout_is_length_type_json() {
        let bytes = encode_message(MessageType::GitEventAck, &GitEventAck { handled: true }).unwrap();
        let body = br#"{"handled":true}"#;
        assert_eq!(&bytes[..4], &((body.len() + 1) as u32).to_be_bytes());
        assert_eq!(bytes[4], 0x33);
        assert_eq!(&bytes[5..], body);
    }

    #[test]
    fn status_response_uses_camel_case_and_omits_absent_fields() {
        let response = StatusResponse {
            running: true,
            port: Some(4020),
            build_date: Some("2025-01-01".to_string()),
            follow_mode: Some(FollowModeStatus {
                enabled: true,
                branch: Some("feature".to_string()),
                repo_path: Some("~/src/app".to_string()),
            }),
            ..StatusResponse::default()
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "running": true,
                "port": 4020,
                "buildDate": "2025-01-01",
                "followMode": {"enabled": true, "branch": "feature", "repoPath": "~/src/app"}
            })
        );
        assert_eq!(serde_json::to_value(StatusResponse::not_running()).unwrap(), json!({"running": false}));
    }

    #[test]
    fn git_event_type_field_is_lowercase() {
        let event = GitEventNotify {
            repo_path: "/src/app".to_string(),
            kind: GitEventKind::Checkout,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"repoPath": "/src/app", "type": "checkout"})
        );
    }

    #[test]
    fn encode_message_refuses_oversized_body() {
        // Type byte plus the quoted string puts the body just over the limit.
        let padding = "x".repeat(MAX_MESSAGE_SIZE - 2);
        assert!(encode_message(MessageType::Error, &padding).is_err());
        assert!(encode_message(MessageType::Error, &padding[1..]).is_ok());
    }

    #[test]
    fn parser_yields_typed_frames_and_skips_unknown_types() {
        let mut data = encode_frame(&[0x7f, b'{', b'}']);
        data.extend(encode_message(MessageType::StatusRequest, &StatusRequest {}).unwrap());

        let mut parser = ApiParser::new();
        parser.add_data(&data);
        let frames: Vec<_> = parser.parse_messages().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageType::StatusRequest);
        assert_eq!(ApiMessage::decode(&frames[0]).unwrap(), ApiMessage::StatusRequest(StatusRequest {}));
    }

    #[test]
    fn empty_status_request_payload_decodes() {
        let frame = ApiFrame {
            kind: MessageType::StatusRequest,
            payload: Vec::new(),
        };
        assert_eq!(ApiMessage::decode(&frame).unwrap(), ApiMessage::StatusRequest(StatusRequest {}));
    }

    #[test]
    fn message_encode_decode_preserves_follow_request() {
        let request = ApiMessage::GitFollowRequest(GitFollowRequest {
            repo_path: Some("/src/app".to_string()),
            branch: Some("feature".to_string()),
            enable: true,
            ..GitFollowRequest::default()
        });
        let mut parser = ApiParser::new();
        parser.add_data(&request.encode().unwrap());
        let frame = parser.parse_messages().next().unwrap();
        assert_eq!(ApiMessage::decode(&frame).unwrap(), request);
    }

    #[test]
    fn follow_request_requires_enable() {
        let frame = ApiFrame {
            kind: MessageType::GitFollowRequest,
            payload: br#"{"repoPath":"/src/app"}"#.to_vec(),
        };
        assert!(ApiMessage::decode(&frame).is_err());
    }
}
