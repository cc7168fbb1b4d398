//! Scripted foris-controller for integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use fc_bus::transport::{BusConnection, BusConnector, BusPublisher, InboundFrame, LocalBus};
use fc_core::TransportError;
use fc_protocol::{
    chunk, topic, Advertisement, ChunkAssembler, ChunkFrame, ControllerFault, ReplyEnvelope,
    RequestEnvelope,
};

pub const CONTROLLER_ID: &str = "0000AABBCCDDEEFF";

/// How the mock controller misbehaves
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Stop broadcasting liveness after this long
    pub advertise_for: Option<Duration>,
    /// Time between liveness broadcasts; one second when unset
    pub advertise_every: Option<Duration>,
    /// Do not broadcast liveness at all
    pub silent: bool,
    /// Ignore this many requests, as if they were lost in transit
    pub drop_first: usize,
    /// Publish every reply twice
    pub duplicate_replies: bool,
    /// Time spent working on each request before replying
    pub work_time: Duration,
    /// Accept requests but never reply
    pub never_reply: bool,
}

/// Handle to a running mock controller
pub struct MockController {
    pub requests_seen: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockController {
    pub async fn spawn(bus: &LocalBus, id: &str, behavior: Behavior) -> Self {
        let connection = bus.connect().await.unwrap();
        connection
            .publisher
            .subscribe(&topic::request_filter(id))
            .await
            .unwrap();

        let working = Arc::new(Mutex::new(HashSet::new()));
        let requests_seen = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        if !behavior.silent {
            tasks.push(tokio::spawn(advertise(
                connection.publisher.clone(),
                id.to_string(),
                working.clone(),
                behavior.advertise_every.unwrap_or(Duration::from_secs(1)),
                behavior.advertise_for,
            )));
        }

        tasks.push(tokio::spawn(serve(
            connection,
            id.to_string(),
            working,
            requests_seen.clone(),
            behavior,
        )));

        Self {
            requests_seen,
            tasks,
        }
    }

    pub fn requests_seen(&self) -> usize {
        self.requests_seen.load(Ordering::SeqCst)
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn advertise(
    publisher: Arc<dyn BusPublisher>,
    id: String,
    working: Arc<Mutex<HashSet<String>>>,
    every: Duration,
    advertise_for: Option<Duration>,
) {
    let started = Instant::now();
    // First broadcast just after startup, once pending requests are known
    let mut interval = tokio::time::interval_at(started + Duration::from_millis(10), every);
    loop {
        interval.tick().await;
        if advertise_for.is_some_and(|limit| started.elapsed() > limit) {
            return;
        }
        let in_flight: Vec<String> = working.lock().unwrap().iter().cloned().collect();
        let advertisement = Advertisement::new(id.as_str(), "running", in_flight);
        let body = serde_json::to_vec(&advertisement).unwrap();
        if publisher
            .publish(&topic::advertisement(&id), Bytes::from(body))
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn serve(
    mut connection: BusConnection,
    id: String,
    working: Arc<Mutex<HashSet<String>>>,
    requests_seen: Arc<AtomicUsize>,
    behavior: Behavior,
) {
    let mut assembler = ChunkAssembler::new();
    let mut dropped = 0;

    while let Ok(Some(frame)) = connection.inbound.next_frame().await {
        let chunk = ChunkFrame::from_slice(&frame.payload).unwrap();
        let request_id = chunk.request_id.clone();
        let Some(message) = assembler.push(&request_id, chunk) else {
            continue;
        };
        requests_seen.fetch_add(1, Ordering::SeqCst);

        if dropped < behavior.drop_first {
            dropped += 1;
            continue;
        }

        let request: RequestEnvelope = serde_json::from_str(&message).unwrap();
        working.lock().unwrap().insert(request.reply_msg_id.clone());
        if behavior.never_reply {
            continue;
        }

        tokio::spawn(respond(
            connection.publisher.clone(),
            id.clone(),
            frame,
            request,
            working.clone(),
            behavior.clone(),
        ));
    }
}

async fn respond(
    publisher: Arc<dyn BusPublisher>,
    id: String,
    frame: InboundFrame,
    request: RequestEnvelope,
    working: Arc<Mutex<HashSet<String>>>,
    behavior: Behavior,
) {
    tokio::time::sleep(behavior.work_time).await;

    let (module, action) = match topic_parts(&frame.topic) {
        Some(parts) => parts,
        None => return,
    };
    let reply = handle(&module, &action, request.data);
    let message = serde_json::to_string(&reply).unwrap();
    let frames = chunk::encode(&request.reply_msg_id, &message).unwrap();
    let reply_topic = topic::reply(&id, &request.reply_msg_id);

    let copies = if behavior.duplicate_replies { 2 } else { 1 };
    for _ in 0..copies {
        for payload in &frames {
            let _ = publisher.publish(&reply_topic, payload.clone()).await;
        }
    }
    working.lock().unwrap().remove(&request.reply_msg_id);
}

fn topic_parts(topic: &str) -> Option<(String, String)> {
    match fc_protocol::InboundTopic::parse(topic).ok()? {
        fc_protocol::InboundTopic::Request { module, action, .. } => Some((module, action)),
        _ => None,
    }
}

fn handle(module: &str, action: &str, data: Option<Value>) -> ReplyEnvelope {
    match (module, action) {
        ("about", "get") => ReplyEnvelope::success(Some(json!({}))),
        ("echo", "echo") => ReplyEnvelope::success(data),
        ("web", "set_language") => ReplyEnvelope::failure(vec![ControllerFault {
            description: "Incorrect input".to_string(),
            stacktrace: Some("Traceback (most recent call last): ...".to_string()),
        }]),
        _ => ReplyEnvelope::failure(vec![ControllerFault::new(format!(
            "Unknown action {}/{}",
            module, action
        ))]),
    }
}

/// Connector whose publisher swallows the first `failures` publishes
/// without ever acknowledging them
pub struct StallingConnector {
    pub bus: LocalBus,
    pub failures: usize,
}

#[async_trait]
impl BusConnector for StallingConnector {
    async fn connect(&self) -> Result<BusConnection, TransportError> {
        let connection = self.bus.connect().await?;
        Ok(BusConnection {
            publisher: Arc::new(StallingPublisher {
                inner: connection.publisher,
                remaining: AtomicUsize::new(self.failures),
            }),
            inbound: connection.inbound,
        })
    }
}

struct StallingPublisher {
    inner: Arc<dyn BusPublisher>,
    remaining: AtomicUsize,
}

#[async_trait]
impl BusPublisher for StallingPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let stall = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stall {
            std::future::pending::<()>().await;
        }
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.inner.subscribe(filter).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect().await
    }
}
