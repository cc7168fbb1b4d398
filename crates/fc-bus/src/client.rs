//! Request orchestrator
//!
//! [`BusClient::call`] turns publish/subscribe traffic into a request/reply
//! call with exactly one observable outcome:
//!
//! 1. register the request id with the [`CorrelationRegistry`]
//! 2. publish the request, retrying once if the transport does not accept
//!    it within the ack window
//! 3. wait for the reply one announcer period at a time; between waits ask
//!    the [`LivenessTracker`] about the controller:
//!    - silent: fail with `ControllerMissing`
//!    - alive but not working on the request: the request was lost, publish
//!      it again under the same id
//!    - alive and working on it: keep waiting
//! 4. give up with `RequestTimeout` once the caller's deadline passes
//!
//! Re-publishing is safe on the client side because the registry keeps only
//! the first reply. Whether the controller tolerates executing a request
//! twice is up to the deployment.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fc_core::config::TimingConfig;
use fc_core::identity::default_controller_id;
use fc_core::{ClientError, ControllerError, ControllerId, RequestId, TransportError};
use fc_protocol::{chunk, topic, ProtocolError, RequestEnvelope};

use crate::receiver::{subscriptions_for, Receiver, ReceiverState};
use crate::registry::{CorrelationRegistry, SlotWait};
use crate::tracker::{Liveness, LivenessTracker};
use crate::transport::{BusConnector, BusPublisher};

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Controller to address; the client's default when `None`
    pub controller_id: Option<ControllerId>,
    /// Upper bound on the whole call; zero waits forever
    pub timeout: Duration,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_controller_id(mut self, controller_id: ControllerId) -> Self {
        self.controller_id = Some(controller_id);
        self
    }
}

/// How late a liveness broadcast may be before the controller is declared
/// missing
fn liveness_grace(period: Duration) -> Duration {
    period / 5
}

/// Releases a registry entry when the call ends, however it ends
struct PendingGuard<'a> {
    registry: &'a CorrelationRegistry,
    controller_id: &'a ControllerId,
    request_id: &'a RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.controller_id, self.request_id);
    }
}

/// Frames of one request, kept so a lost request can be re-sent verbatim
struct OutboundRequest {
    topic: String,
    frames: Vec<Bytes>,
}

/// Client for one bus connection
///
/// `call` may be used concurrently from many tasks.
pub struct BusClient {
    publisher: Arc<dyn BusPublisher>,
    registry: Arc<CorrelationRegistry>,
    tracker: Arc<LivenessTracker>,
    controller_id: ControllerId,
    timing: TimingConfig,
    /// Controllers whose reply and liveness topics are subscribed. Entries
    /// live as long as the connection, matching the broker-side
    /// subscriptions; the set holds one id per controller ever addressed.
    subscribed: Mutex<HashSet<ControllerId>>,
    state: watch::Receiver<ReceiverState>,
    cancel: CancellationToken,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Connect and start the background receiver.
    ///
    /// `controller_id` is the default target of calls; this machine's
    /// controller when `None`.
    pub async fn connect(
        connector: &dyn BusConnector,
        controller_id: Option<ControllerId>,
        timing: TimingConfig,
    ) -> Result<Self, ClientError> {
        let controller_id = controller_id.unwrap_or_else(default_controller_id);
        let registry = Arc::new(CorrelationRegistry::new(timing.retention_timeout));
        let tracker = Arc::new(LivenessTracker::new(
            timing.announcer_period,
            timing.retention_timeout,
        ));

        let mut receiver = Receiver::new(
            registry.clone(),
            tracker.clone(),
            timing.retention_timeout,
        );
        let state = receiver.watch_state();
        let publisher = receiver.connect(connector, &controller_id).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(receiver.run(cancel.clone()));
        let mut running = state.clone();
        let started = running
            .wait_for(|s| *s != ReceiverState::Subscribed)
            .await
            .map(|s| *s == ReceiverState::Running)
            .unwrap_or(false);
        if !started {
            tracing::error!(controller_id = %controller_id, "Receiver stopped before running");
            cancel.cancel();
            let _ = publisher.disconnect().await;
            return Err(TransportError::Closed.into());
        }
        tracing::info!(controller_id = %controller_id, "Bus client connected");

        Ok(Self {
            publisher,
            registry,
            tracker,
            subscribed: Mutex::new(HashSet::from([controller_id.clone()])),
            controller_id,
            timing,
            state,
            cancel,
            receiver_task: Mutex::new(Some(task)),
        })
    }

    /// Default controller of this client
    pub fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Current state of the background receiver
    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &LivenessTracker {
        &self.tracker
    }

    /// Call `module`/`action` on a controller and return the reply payload.
    pub async fn call(
        &self,
        module: &str,
        action: &str,
        data: Option<Value>,
        options: CallOptions,
    ) -> Result<Option<Value>, ClientError> {
        let controller_id = options
            .controller_id
            .unwrap_or_else(|| self.controller_id.clone());
        self.ensure_subscribed(&controller_id).await?;

        let request_id = RequestId::generate();
        let envelope = RequestEnvelope::new(request_id.as_str(), data);
        let message = serde_json::to_string(&envelope).map_err(ProtocolError::from)?;
        let request = OutboundRequest {
            topic: topic::request(controller_id.as_str(), module, action),
            frames: chunk::encode(request_id.as_str(), &message)?,
        };

        let mut slot = self.registry.register(&controller_id, &request_id)?;
        let _guard = PendingGuard {
            registry: &self.registry,
            controller_id: &controller_id,
            request_id: &request_id,
        };

        tracing::debug!(
            controller_id = %controller_id,
            request_id = %request_id,
            frames = request.frames.len(),
            "Publishing {}/{}",
            module,
            action
        );
        self.publish_request(&request).await?;

        let period = self.timing.announcer_period;
        let started = Instant::now();
        let deadline = (!options.timeout.is_zero()).then(|| started + options.timeout);
        let mut wait = period;

        loop {
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(Instant::now()));
            }

            match slot.wait(wait).await {
                SlotWait::Ready(reply) => {
                    tracing::debug!(request_id = %request_id, "Reply received");
                    return reply
                        .into_outcome()
                        .map_err(|errors| ControllerError::new(module, action, errors).into());
                }
                SlotWait::Closed => return Err(TransportError::Closed.into()),
                SlotWait::Pending => {}
            }

            let liveness = self.tracker.liveness(&controller_id, &request_id);
            let missing = match liveness {
                Liveness::Stale => true,
                Liveness::Unknown => started.elapsed() >= period,
                Liveness::Working | Liveness::Idle => false,
            };
            if missing {
                tracing::warn!(controller_id = %controller_id, "Controller is not advertising");
                return Err(ClientError::ControllerMissing {
                    controller_id: controller_id.clone(),
                });
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ClientError::RequestTimeout {
                    module: module.to_string(),
                    action: action.to_string(),
                    timeout: options.timeout,
                });
            }

            if liveness == Liveness::Idle {
                tracing::warn!(
                    controller_id = %controller_id,
                    request_id = %request_id,
                    "Controller is not working on the request, publishing it again"
                );
                slot = self.registry.register(&controller_id, &request_id)?;
                self.publish_request(&request).await?;
            }

            // Recheck soon after the controller would lapse, leaving room
            // for a broadcast that runs late.
            wait = match self.tracker.stale_in(&controller_id) {
                Some(left) => period.min(left + liveness_grace(period)),
                None => period,
            };
        }
    }

    /// Subscribe to the reply and liveness topics of a controller other
    /// than the default one; no-op once done.
    pub async fn ensure_subscribed(&self, controller_id: &ControllerId) -> Result<(), ClientError> {
        if self.lock_subscribed().contains(controller_id) {
            return Ok(());
        }

        for filter in subscriptions_for(controller_id) {
            self.publisher.subscribe(&filter).await?;
        }
        self.lock_subscribed().insert(controller_id.clone());
        tracing::debug!(controller_id = %controller_id, "Subscribed to controller");
        Ok(())
    }

    fn lock_subscribed(&self) -> std::sync::MutexGuard<'_, HashSet<ControllerId>> {
        self.subscribed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn publish_request(&self, request: &OutboundRequest) -> Result<(), TransportError> {
        for frame in &request.frames {
            self.publish_with_ack(&request.topic, frame.clone()).await?;
        }
        Ok(())
    }

    /// Publish and wait for the transport to accept the message, retrying
    /// exactly once with the identical frame.
    pub async fn publish_with_ack(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        match self.try_publish(topic, payload.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Publish to {} failed: {}. Retrying once", topic, e);
                self.try_publish(topic, payload).await.map_err(|e| {
                    tracing::error!("Publish to {} failed again: {}", topic, e);
                    e
                })
            }
        }
    }

    async fn try_publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let ack_timeout = self.timing.publish_ack_timeout;
        tokio::time::timeout(ack_timeout, self.publisher.publish(topic, payload))
            .await
            .map_err(|_| TransportError::AckTimeout(ack_timeout))?
    }

    /// Disconnect from the bus and wait for the receiver to stop.
    ///
    /// Calls still in progress fail with `TransportUnavailable`.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let result = self.publisher.disconnect().await;
        self.cancel.cancel();

        let task = self
            .receiver_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Receiver task failed: {}", e);
            }
        }

        tracing::info!("Bus client disconnected");
        result.map_err(ClientError::from)
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
