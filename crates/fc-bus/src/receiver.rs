//! Background receiver
//!
//! Owns the read half of a bus connection and demultiplexes every inbound
//! frame, one at a time, into the [`CorrelationRegistry`] (replies) or the
//! [`LivenessTracker`] (advertisements). A frame that fails to parse is
//! logged and dropped; it never reaches a caller and never stops the loop.
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Running -> Disconnected
//! ```
//!
//! Leaving `Running` closes the registry, so every caller still waiting on a
//! reply is woken with a terminal error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use fc_core::{ControllerId, RequestId, TransportError};
use fc_protocol::{
    topic, Advertisement, ChunkAssembler, ChunkFrame, InboundTopic, ProtocolError, ReplyEnvelope,
};

use crate::registry::CorrelationRegistry;
use crate::tracker::LivenessTracker;
use crate::transport::{BusConnector, BusInbound, BusPublisher, InboundFrame};

/// Lifecycle of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Disconnected,
    Connecting,
    Subscribed,
    Running,
}

/// Topic filters a client needs to talk to `controller_id`
pub fn subscriptions_for(controller_id: &ControllerId) -> [String; 2] {
    [
        topic::reply_filter(controller_id.as_str()),
        topic::advertisement(controller_id.as_str()),
    ]
}

pub struct Receiver {
    inbound: Option<Box<dyn BusInbound>>,
    registry: Arc<CorrelationRegistry>,
    tracker: Arc<LivenessTracker>,
    assembler: ChunkAssembler,
    retention: Duration,
    state: watch::Sender<ReceiverState>,
}

impl Receiver {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        tracker: Arc<LivenessTracker>,
        retention: Duration,
    ) -> Self {
        Self {
            inbound: None,
            registry,
            tracker,
            assembler: ChunkAssembler::new(),
            retention,
            state: watch::Sender::new(ReceiverState::Disconnected),
        }
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ReceiverState) {
        tracing::debug!("Receiver state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Open a connection and subscribe to the reply and liveness topics of
    /// `controller_id`.
    ///
    /// Returns the write half for the caller; the read half stays with the
    /// receiver until [`run`](Self::run).
    pub async fn connect(
        &mut self,
        connector: &dyn BusConnector,
        controller_id: &ControllerId,
    ) -> Result<Arc<dyn BusPublisher>, TransportError> {
        self.set_state(ReceiverState::Connecting);

        let connection = match connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ReceiverState::Disconnected);
                return Err(e);
            }
        };

        for filter in subscriptions_for(controller_id) {
            if let Err(e) = connection.publisher.subscribe(&filter).await {
                let _ = connection.publisher.disconnect().await;
                self.set_state(ReceiverState::Disconnected);
                return Err(e);
            }
        }

        self.inbound = Some(connection.inbound);
        self.set_state(ReceiverState::Subscribed);
        Ok(connection.publisher)
    }

    /// Dispatch inbound frames until cancelled or the connection ends
    pub async fn run(mut self, cancel: CancellationToken) {
        let Some(mut inbound) = self.inbound.take() else {
            tracing::warn!("Receiver started without a connection");
            self.shutdown();
            return;
        };

        self.set_state(ReceiverState::Running);
        tracing::info!("Receiver running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Receiver shutting down");
                    break;
                }

                frame = inbound.next_frame() => match frame {
                    Ok(Some(frame)) => self.handle_frame(frame),
                    Ok(None) => {
                        tracing::info!("Bus connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Bus connection lost: {}", e);
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.registry.close();
        self.set_state(ReceiverState::Disconnected);
    }

    /// Route one frame; malformed frames are logged and dropped
    pub fn handle_frame(&mut self, frame: InboundFrame) {
        if let Err(e) = self.dispatch(&frame) {
            tracing::warn!("Dropping malformed frame on {}: {}", frame.topic, e);
        }
    }

    fn dispatch(&mut self, frame: &InboundFrame) -> Result<(), ProtocolError> {
        match InboundTopic::parse(&frame.topic)? {
            InboundTopic::Reply {
                controller_id,
                request_id,
            } => self.on_reply(
                ControllerId::from(controller_id),
                RequestId::from(request_id.as_str()),
                &frame.payload,
            ),
            InboundTopic::Advertisement { controller_id } => {
                self.on_advertisement(ControllerId::from(controller_id), &frame.payload)
            }
            other => {
                tracing::debug!("Ignoring frame on {:?}", other);
                Ok(())
            }
        }
    }

    fn on_advertisement(
        &mut self,
        controller_id: ControllerId,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let advertisement: Advertisement = serde_json::from_slice(payload)?;
        tracing::trace!(
            controller_id = %controller_id,
            state = %advertisement.data.state,
            working = advertisement.data.working_replies.len(),
            "Advertisement"
        );
        self.tracker
            .update(&controller_id, advertisement.data.working_replies);
        Ok(())
    }

    fn on_reply(
        &mut self,
        controller_id: ControllerId,
        request_id: RequestId,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let frame = ChunkFrame::from_slice(payload)?;
        if frame.request_id != request_id.as_str() {
            return Err(ProtocolError::MalformedChunk {
                request_id: frame.request_id,
                reason: format!("published under reply topic of {}", request_id),
            });
        }

        self.assembler.sweep(self.retention);
        let key = format!("{}/{}", controller_id, request_id);
        let Some(message) = self.assembler.push(&key, frame) else {
            return Ok(());
        };

        let reply: ReplyEnvelope = serde_json::from_str(&message)?;
        if self.registry.deliver(&controller_id, &request_id, reply) {
            tracing::debug!(
                controller_id = %controller_id,
                request_id = %request_id,
                "Reply delivered"
            );
        } else {
            tracing::debug!(
                controller_id = %controller_id,
                request_id = %request_id,
                "Duplicate or unsolicited reply dropped"
            );
        }
        Ok(())
    }
}
