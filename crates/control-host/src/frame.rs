//! Length-prefixed framing shared by the control and API sockets.
//!
//! Every frame is `[u32 big-endian length][body]`. The decoder accumulates
//! arbitrary read chunks and hands back complete bodies one at a time.

use std::io;

use tracing::{debug, error};

pub const HEADER_LEN: usize = 4;

/// Largest body a peer may declare. Anything bigger is treated as corruption.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Like [`encode_frame`], but refuses bodies a peer would discard.
pub fn try_encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame body of {} bytes exceeds {} byte limit", payload.len(), MAX_MESSAGE_SIZE),
        ));
    }
    Ok(encode_frame(payload))
}

/// Per-connection receive buffer.
///
/// After `frames()` has been drained the buffer holds either nothing or the
/// prefix of a single incomplete frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Lazily yield every complete frame body currently buffered.
    ///
    /// A header declaring a zero or oversized length wipes the whole buffer:
    /// the stream has no resync marker, so anything queued behind it is lost.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let buffer = &mut self.decoder.buffer;
        if buffer.len() < HEADER_LEN {
            return None;
        }

        let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if declared == 0 || declared > MAX_MESSAGE_SIZE {
            error!(
                declared,
                max = MAX_MESSAGE_SIZE,
                discarded = buffer.len(),
                "invalid frame length, discarding receive buffer"
            );
            self.decoder.clear();
            return None;
        }

        let total = HEADER_LEN + declared;
        if buffer.len() < total {
            debug!(have = buffer.len(), need = total, "waiting for more frame data");
            return None;
        }

        let body = buffer[HEADER_LEN..total].to_vec();
        buffer.drain(..total);
        Some(body)
    }
}
