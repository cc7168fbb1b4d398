//! Chunked transfer for payloads above the bus message size ceiling
//!
//! Every message crosses the bus as one or more [`ChunkFrame`]s. A message
//! of at most [`CHUNK_SIZE`] bytes travels as a single frame with
//! `final = true`. A larger message is cut into ordered segments of at most
//! [`CHUNK_SIZE`] bytes, each sent with `final = false`, followed by an
//! empty terminating frame with `final = true`.
//!
//! Frames carry no sequence number. The bus keeps send order for frames
//! published by one session on one connection, and the receiver
//! concatenates segments in arrival order until it sees the final flag.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ProtocolError;

/// Largest segment carried by one frame (512 KiB)
pub const CHUNK_SIZE: usize = 512 * 1024;

/// One frame of a (possibly chunked) message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub request_id: String,
    pub segment: String,
    #[serde(rename = "final")]
    pub last: bool,
}

impl ChunkFrame {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Split a serialized message into frames
pub fn split(request_id: &str, message: &str) -> Vec<ChunkFrame> {
    split_with_size(request_id, message, CHUNK_SIZE)
}

fn split_with_size(request_id: &str, message: &str, chunk_size: usize) -> Vec<ChunkFrame> {
    let frame = |segment: &str, last: bool| ChunkFrame {
        request_id: request_id.to_string(),
        segment: segment.to_string(),
        last,
    };

    if message.len() <= chunk_size {
        return vec![frame(message, true)];
    }

    let mut frames = Vec::with_capacity(message.len() / chunk_size + 2);
    let mut rest = message;
    while !rest.is_empty() {
        // Segments must stay valid UTF-8, so cut on a char boundary.
        let mut end = chunk_size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (segment, tail) = rest.split_at(end);
        frames.push(frame(segment, false));
        rest = tail;
    }
    frames.push(frame("", true));
    frames
}

/// Split and serialize a message, ready to publish in order
pub fn encode(request_id: &str, message: &str) -> Result<Vec<Bytes>, ProtocolError> {
    split(request_id, message)
        .iter()
        .map(ChunkFrame::to_bytes)
        .collect()
}

struct Partial {
    buffer: String,
    started: Instant,
}

/// Reassembles chunked messages on the receive path
///
/// Partial messages are keyed by the caller (for replies: controller and
/// request id) so interleaved transfers do not mix.
#[derive(Default)]
pub struct ChunkAssembler {
    partial: HashMap<String, Partial>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the complete message once the final frame
    /// has been seen.
    pub fn push(&mut self, key: &str, frame: ChunkFrame) -> Option<String> {
        match (frame.last, self.partial.remove(key)) {
            (true, None) => Some(frame.segment),
            (true, Some(mut partial)) => {
                partial.buffer.push_str(&frame.segment);
                Some(partial.buffer)
            }
            (false, existing) => {
                let mut partial = existing.unwrap_or_else(|| Partial {
                    buffer: String::new(),
                    started: Instant::now(),
                });
                partial.buffer.push_str(&frame.segment);
                self.partial.insert(key.to_string(), partial);
                None
            }
        }
    }

    /// Drop partial messages started more than `max_age` ago.
    ///
    /// Returns how many were dropped.
    pub fn sweep(&mut self, max_age: Duration) -> usize {
        let before = self.partial.len();
        self.partial
            .retain(|_, partial| partial.started.elapsed() <= max_age);
        let dropped = before - self.partial.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped stale partial chunk transfers");
        }
        dropped
    }

    /// Number of transfers in progress
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
