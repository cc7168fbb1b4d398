//! In-process message bus
//!
//! A broker living inside the current process with the same topic
//! addressing and wildcard rules as the MQTT binding. Every `connect()`
//! opens an independent session; a session receives each message published
//! on a topic matching one of its filters, in publish order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use fc_core::TransportError;
use fc_protocol::topic;

use super::{BusConnection, BusConnector, BusInbound, BusPublisher, InboundFrame};

type SessionId = u64;

struct Session {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<InboundFrame>,
}

#[derive(Default)]
struct BusInner {
    sessions: DashMap<SessionId, Session>,
    next_session: AtomicU64,
    max_message_size: Option<usize>,
}

/// Handle to an in-process bus; clones share the same bus
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// A bus without a message size ceiling
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus refusing messages larger than `max` bytes
    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                max_message_size: Some(max),
                ..Default::default()
            }),
        }
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn open_session(&self) -> (SessionId, mpsc::UnboundedReceiver<InboundFrame>) {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sessions.insert(
            id,
            Session {
                filters: Vec::new(),
                tx,
            },
        );
        tracing::debug!("Local bus session {} opened", id);
        (id, rx)
    }

    fn route(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError> {
        if let Some(max) = self.inner.max_message_size {
            if payload.len() > max {
                return Err(TransportError::PayloadTooLarge {
                    size: payload.len(),
                    max,
                });
            }
        }

        let mut delivered = 0;
        for session in self.inner.sessions.iter() {
            if !session.filters.iter().any(|f| topic::matches(f, topic)) {
                continue;
            }
            let frame = InboundFrame {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if session.tx.send(frame).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl BusConnector for LocalBus {
    async fn connect(&self) -> Result<BusConnection, TransportError> {
        let (id, rx) = self.open_session();
        Ok(BusConnection {
            publisher: Arc::new(LocalPublisher {
                bus: self.clone(),
                id,
            }),
            inbound: Box::new(LocalInbound { rx }),
        })
    }
}

struct LocalPublisher {
    bus: LocalBus,
    id: SessionId,
}

#[async_trait]
impl BusPublisher for LocalPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if !self.bus.inner.sessions.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        let delivered = self.bus.route(topic, payload)?;
        tracing::trace!("Local bus {} -> {} session(s)", topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut session = self
            .bus
            .inner
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        if !session.filters.iter().any(|f| f == filter) {
            session.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.bus.inner.sessions.remove(&self.id).is_some() {
            tracing::debug!("Local bus session {} closed", self.id);
        }
        Ok(())
    }
}

impl Drop for LocalPublisher {
    fn drop(&mut self) {
        self.bus.inner.sessions.remove(&self.id);
    }
}

struct LocalInbound {
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
impl BusInbound for LocalInbound {
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
