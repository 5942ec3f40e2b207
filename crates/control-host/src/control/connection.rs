//! Ownership of the single live control peer.
//!
//! Each accepted socket gets a reader task that decodes envelopes into the
//! shared dispatch channel and a writer task that drains an outbound queue.
//! Attaching a new socket tears down the previous one first.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use nix::sys::socket::{setsockopt, sockopt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::message::{Category, ControlMessage, ControlParser, SystemReadyEvent};

/// Requested kernel receive buffer for the control socket.
pub const RECEIVE_BUFFER_SIZE: usize = 1024 * 1024;

/// Outbound bodies above this size are logged.
const LARGE_MESSAGE_WARN: usize = 64 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// One envelope decoded from a peer, tagged with that peer's id.
#[derive(Debug)]
pub struct Inbound {
    pub peer_id: u64,
    pub message: ControlMessage,
}

struct Peer {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Peer {
    fn destroy(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Default)]
pub struct ConnectionManager {
    primary: Mutex<Option<Peer>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Peer>> {
        self.primary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `stream` the primary peer and greet it with `system:ready`.
    ///
    /// Returns the id assigned to the new peer.
    pub fn attach(self: &Arc<Self>, stream: UnixStream, inbound: mpsc::UnboundedSender<Inbound>) -> u64 {
        tune_socket(&stream);

        let peer_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let previous = {
            // Held until the peer is stored: either task may release
            // `peer_id` as soon as it starts.
            let mut primary = self.lock();
            let writer = tokio::spawn(write_loop(peer_id, write_half, outbound_rx, Arc::downgrade(self)));
            let reader = tokio::spawn(read_loop(peer_id, read_half, inbound, Arc::downgrade(self)));
            primary.replace(Peer {
                id: peer_id,
                outbound: outbound_tx,
                reader,
                writer,
            })
        };
        if let Some(old) = previous {
            info!(old_peer = old.id, new_peer = peer_id, "replacing existing control connection");
            old.destroy();
        } else {
            info!(peer_id, "control peer connected");
        }

        let ready = ControlMessage::event(
            Category::System,
            "ready",
            serde_json::to_value(SystemReadyEvent::now()).ok(),
            None,
        );
        self.send(&ready);
        peer_id
    }

    /// Drop the primary peer if it is still `peer_id`. A stale peer that was
    /// already replaced is ignored.
    pub fn release(&self, peer_id: u64) {
        let mut primary = self.lock();
        if primary.as_ref().is_some_and(|peer| peer.id == peer_id) {
            if let Some(peer) = primary.take() {
                debug!(peer_id, "control peer released");
                peer.destroy();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|peer| !peer.outbound.is_closed())
    }

    pub fn primary_id(&self) -> Option<u64> {
        self.lock().as_ref().map(|peer| peer.id)
    }

    /// Queue `message` for the primary peer. Returns false when nothing went
    /// out: no peer, a closed peer, or an unencodable message.
    pub fn send(&self, message: &ControlMessage) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(id = %message.id, error = %err, "failed to encode control message");
                return false;
            }
        };

        let mut primary = self.lock();
        let Some(peer) = primary.as_ref() else {
            warn!(
                category = %message.category,
                action = %message.action,
                "cannot send control message, no peer connected"
            );
            return false;
        };

        let body_len = frame.len() - crate::frame::HEADER_LEN;
        if body_len > LARGE_MESSAGE_WARN {
            warn!(bytes = body_len, "large control message");
        }
        debug!(
            peer_id = peer.id,
            id = %message.id,
            category = %message.category,
            action = %message.action,
            bytes = body_len,
            "sending control message"
        );

        if peer.outbound.send(frame).is_err() {
            warn!(peer_id = peer.id, "cannot send control message, peer is closed");
            if let Some(peer) = primary.take() {
                peer.destroy();
            }
            return false;
        }
        true
    }

    /// Close the primary peer, if any.
    pub fn close(&self) {
        if let Some(peer) = self.lock().take() {
            info!(peer_id = peer.id, "closing control connection");
            peer.destroy();
        }
    }
}

fn tune_socket(stream: &UnixStream) {
    // Unix-domain sockets do no write coalescing, so only the receive side
    // needs adjusting.
    if let Err(err) = setsockopt(stream, sockopt::RcvBuf, &RECEIVE_BUFFER_SIZE) {
        warn!(error = %err, "failed to enlarge control socket receive buffer");
    }
}

fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

fn log_socket_error(peer_id: u64, op: &'static str, err: &io::Error) {
    if is_peer_closed(err) {
        error!(
            peer_id,
            op,
            kind = ?err.kind(),
            errno = ?err.raw_os_error(),
            "control peer closed the connection"
        );
    } else {
        error!(
            peer_id,
            op,
            kind = ?err.kind(),
            errno = ?err.raw_os_error(),
            error = %err,
            "control socket error"
        );
    }
}

async fn read_loop(
    peer_id: u64,
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Inbound>,
    manager: Weak<ConnectionManager>,
) {
    let mut parser = ControlParser::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!(peer_id, "control peer disconnected");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                log_socket_error(peer_id, "read", &err);
                break;
            }
        };

        parser.add_data(&buf[..n]);
        for message in parser.parse_messages() {
            debug!(
                peer_id,
                id = %message.id,
                kind = ?message.kind,
                category = %message.category,
                action = %message.action,
                "received control message"
            );
            if inbound.send(Inbound { peer_id, message }).is_err() {
                return;
            }
        }
    }

    if let Some(manager) = manager.upgrade() {
        manager.release(peer_id);
    }
}

async fn write_loop(
    peer_id: u64,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    manager: Weak<ConnectionManager>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write_frame(peer_id, &mut writer, &frame).await {
            log_socket_error(peer_id, "write", &err);
            if let Some(manager) = manager.upgrade() {
                manager.release(peer_id);
            }
            return;
        }
    }
}

/// Try an immediate write first so buffered writes can be reported.
async fn write_frame(peer_id: u64, writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    let written = match writer.try_write(frame) {
        Ok(n) => n,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
        Err(err) => return Err(err),
    };

    if written == frame.len() {
        debug!(peer_id, bytes = written, "write immediate");
        return Ok(());
    }

    warn!(
        peer_id,
        written,
        remaining = frame.len() - written,
        "control socket write buffered, backpressure"
    );
    writer.write_all(&frame[written..]).await
}
