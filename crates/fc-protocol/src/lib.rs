//! fc-protocol: Wire protocol for foris-controller clients
//!
//! This crate defines the messages exchanged with a foris-controller, the
//! topic addressing used on message buses, the chunked-transfer codec for
//! payloads that exceed a bus message size ceiling, the length-prefixed
//! frame codec used on stream sockets, and the ubus wire format.

pub mod chunk;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod topic;
pub mod ubus;

pub use chunk::{ChunkAssembler, ChunkFrame, CHUNK_SIZE};
pub use codec::{FrameCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use envelope::{
    Advertisement, ControllerFault, Notification, ReplyEnvelope, RequestEnvelope, StreamRequest,
};
pub use error::ProtocolError;
pub use topic::InboundTopic;
pub use ubus::{UbusAttr, UbusCodec, UbusMessage, UbusMsgType, UbusStatus};
