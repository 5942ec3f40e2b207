//! Hands Git hook events to the HTTP server, which owns the sync logic.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::protocol::{GitEventKind, GitEventNotify};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait GitEventForwarder: Send + Sync {
    async fn forward(&self, port: u16, event: &GitEventNotify) -> Result<(), ForwardError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GitEventBody<'a> {
    repo_path: &'a str,
    event: GitEventKind,
}

/// POSTs to `http://<host>:<port>/api/git/event`.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    host: String,
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl HttpForwarder {
    pub fn new(host: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            host: host.into(),
        }
    }

    pub fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{port}/api/git/event", self.host)
    }
}

#[async_trait]
impl GitEventForwarder for HttpForwarder {
    async fn forward(&self, port: u16, event: &GitEventNotify) -> Result<(), ForwardError> {
        let url = self.endpoint(port);
        let body = GitEventBody {
            repo_path: &event.repo_path,
            event: event.kind,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| ForwardError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status(status));
        }
        debug!(%url, %status, "git event forwarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one HTTP request, answer with `status_line`, return the raw request.
    async fn one_shot_server(status_line: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!("{status_line}\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}");
            stream.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (port, handle)
    }

    fn commit_event() -> GitEventNotify {
        GitEventNotify {
            repo_path: "/src/app".to_string(),
            kind: GitEventKind::Commit,
        }
    }

    #[tokio::test]
    async fn posts_repo_path_and_event() {
        let (port, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let forwarder = HttpForwarder::new("127.0.0.1");
        forwarder.forward(port, &commit_event()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/git/event HTTP/1.1"), "got: {request}");
        assert!(request.contains(r#"{"repoPath":"/src/app","event":"commit"}"#), "got: {request}");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (port, _server) = one_shot_server("HTTP/1.1 500 Internal Server Error").await;
        let forwarder = HttpForwarder::new("127.0.0.1");
        let err = forwarder.forward(port, &commit_event()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Status(status) if status.as_u16() == 500), "got: {err:?}");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_request_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let forwarder = HttpForwarder::new("127.0.0.1");
        let err = forwarder.forward(port, &commit_event()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Request { .. }), "got: {err:?}");
    }

    #[test]
    fn default_endpoint_targets_localhost() {
        assert_eq!(
            HttpForwarder::default().endpoint(4020),
            "http://localhost:4020/api/git/event"
        );
    }
}
