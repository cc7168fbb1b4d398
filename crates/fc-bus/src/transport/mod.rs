//! Transport bindings
//!
//! A bus connection is split into a shared write half ([`BusPublisher`])
//! and a read half ([`BusInbound`]) owned by exactly one Receiver, so
//! publishing never waits on frame dispatch and vice versa.

mod backoff;
pub mod local;
pub mod mqtt;
pub mod stream;
pub mod ubus;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use fc_core::TransportError;

pub use backoff::ExponentialBackoff;
pub use local::LocalBus;
pub use mqtt::MqttConnector;
pub use stream::{StreamListener, StreamSender};
pub use ubus::{UbusListener, UbusSender};

/// A message received on a subscribed topic
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Bytes,
}

/// Write half of a bus connection
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish one message. Returns once the transport has accepted it
    /// locally; callers bound this with their own ack timeout.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Subscribe to an MQTT-style topic filter
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Close the connection; the read half then yields `None`
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Read half of a bus connection
#[async_trait]
pub trait BusInbound: Send {
    /// Next frame on any subscribed topic.
    ///
    /// `Ok(None)` means the connection was closed; `Err` means it failed
    /// beyond recovery.
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>, TransportError>;
}

/// Both halves of an established connection
pub struct BusConnection {
    pub publisher: Arc<dyn BusPublisher>,
    pub inbound: Box<dyn BusInbound>,
}

/// Something that can open bus connections
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<BusConnection, TransportError>;
}
