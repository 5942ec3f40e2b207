//! Client side of `api.sock`, used by the `vt` command.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time;
use tracing::{debug, warn};

use super::protocol::{
    encode_message, ApiFrame, ApiParser, ApiRequest, ApiResponse, ErrorPayload, GitEventAck, GitEventNotify,
    GitFollowRequest, GitFollowResponse, MessageType, StatusRequest, StatusResponse,
};
use crate::config::{ControlPaths, API_REQUEST_TIMEOUT};
use crate::correlator::Correlator;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("VibeTunnel server is not running")]
    ServerNotRunning,
    #[error("Request timeout waiting for {0}")]
    Timeout(MessageType),
    #[error("{0}")]
    Server(String),
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid response payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SocketApiClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketApiClient {
    pub fn new(paths: &ControlPaths) -> Self {
        Self::with_socket_path(paths.api_socket())
    }

    pub fn from_env() -> Self {
        Self::new(&ControlPaths::from_env())
    }

    pub fn with_socket_path(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: API_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_socket_available(&self) -> bool {
        self.socket_path.exists()
    }

    async fn connect(&self) -> Result<UnixStream, ClientError> {
        if !self.is_socket_available() {
            return Err(ClientError::ServerNotRunning);
        }
        UnixStream::connect(&self.socket_path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => ClientError::ServerNotRunning,
            _ => ClientError::Io(err),
        })
    }

    /// Send one request on a fresh connection and wait for its response type.
    ///
    /// An `ERROR` frame from the server answers whatever request is pending.
    pub async fn send_request<R: ApiRequest>(&self, request: &R) -> Result<R::Response, ClientError> {
        let expected = <R::Response as ApiResponse>::TYPE;
        let stream = self.connect().await?;
        let (mut reader, mut writer) = stream.into_split();

        let pending: Arc<Correlator<MessageType, ApiFrame>> = Arc::new(Correlator::new());
        let rx = pending.register(expected);

        let read_pending = Arc::clone(&pending);
        let read_task = tokio::spawn(async move {
            let mut parser = ApiParser::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(error = %err, "API socket read failed");
                        break;
                    }
                };
                parser.add_data(&buf[..n]);
                for frame in parser.parse_messages() {
                    let key = if frame.kind == MessageType::Error { expected } else { frame.kind };
                    if let Err(frame) = read_pending.resolve(&key, frame) {
                        debug!(kind = %frame.kind, "dropping unsolicited API frame");
                    }
                }
            }
            read_pending.cancel(&expected);
        });

        let bytes = encode_message(R::TYPE, request)?;
        if let Err(err) = writer.write_all(&bytes).await {
            read_task.abort();
            return Err(err.into());
        }

        let result = time::timeout(self.timeout, rx).await;
        read_task.abort();
        let frame = match result {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                pending.cancel(&expected);
                return Err(ClientError::Timeout(expected));
            }
        };

        if frame.kind == MessageType::Error {
            let error: ErrorPayload = frame.json()?;
            warn!(code = %error.code, message = %error.message, "server returned an error");
            return Err(ClientError::Server(error.message));
        }
        Ok(frame.json()?)
    }

    /// Never fails; anything short of a response reads as not running.
    pub async fn get_status(&self) -> StatusResponse {
        match self.send_request(&StatusRequest {}).await {
            Ok(status) => status,
            Err(err) => {
                debug!(error = %err, "status request failed");
                StatusResponse::not_running()
            }
        }
    }

    pub async fn set_follow_mode(&self, request: &GitFollowRequest) -> Result<GitFollowResponse, ClientError> {
        self.send_request(request).await
    }

    pub async fn send_git_event(&self, event: &GitEventNotify) -> Result<GitEventAck, ClientError> {
        self.send_request(event).await
    }
}
