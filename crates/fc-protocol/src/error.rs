//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol traffic
///
/// On the receive path every variant is a malformed frame: it is logged and
/// dropped where it is detected and never reaches a caller.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Topic does not follow the foris-controller addressing scheme
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    /// Body is not the expected JSON document
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A chunk frame arrived out of place
    #[error("Malformed chunk for request {request_id}: {reason}")]
    MalformedChunk { request_id: String, reason: String },

    /// ubus message or blob attribute does not decode
    #[error("Malformed ubus message: {0}")]
    MalformedUbus(String),

    /// Frame exceeds maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
