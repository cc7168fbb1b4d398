//! Correlation registry
//!
//! Matches replies arriving on the Receiver to the calls waiting for them.
//! Each outstanding (controller, request) pair owns one entry holding a
//! single-slot result channel and a delivered flag. Delivery is idempotent:
//! only the first reply for an entry is stored, later duplicates are no-ops.
//!
//! Entries are swept lazily on `register` and `deliver` once they are older
//! than the retention window and nobody waits on them any more, so many
//! short-lived calls never grow the map without bound.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use fc_core::{ControllerId, RequestId, TransportError};
use fc_protocol::ReplyEnvelope;

type Key = (ControllerId, RequestId);

struct PendingRequest {
    created: Instant,
    slot: watch::Sender<Option<ReplyEnvelope>>,
    delivered: bool,
}

impl PendingRequest {
    fn is_stale(&self, retention: Duration) -> bool {
        self.created.elapsed() > retention && (self.delivered || self.slot.receiver_count() == 0)
    }
}

#[derive(Default)]
struct RegistryInner {
    pending: HashMap<Key, PendingRequest>,
    closed: bool,
}

impl RegistryInner {
    fn sweep(&mut self, retention: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| !entry.is_stale(retention));
        before - self.pending.len()
    }
}

/// Tracks outstanding calls and their eventual replies
pub struct CorrelationRegistry {
    inner: Mutex<RegistryInner>,
    retention: Duration,
}

impl CorrelationRegistry {
    /// Create an empty registry that forgets abandoned entries after
    /// `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in the reply to `request_id`.
    ///
    /// Registering an id that is already present refreshes the entry and
    /// hands out another handle to the same slot, so a request can be
    /// re-published safely. Fails once the registry has been closed.
    pub fn register(
        &self,
        controller_id: &ControllerId,
        request_id: &RequestId,
    ) -> Result<ResultSlot, TransportError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        inner.sweep(self.retention);

        let entry = inner
            .pending
            .entry((controller_id.clone(), request_id.clone()))
            .and_modify(|entry| entry.created = Instant::now())
            .or_insert_with(|| PendingRequest {
                created: Instant::now(),
                slot: watch::Sender::new(None),
                delivered: false,
            });

        Ok(ResultSlot {
            rx: entry.slot.subscribe(),
        })
    }

    /// Store the reply for a registered request.
    ///
    /// Returns `false` without touching anything when the reply is a
    /// duplicate or nobody registered the request.
    pub fn deliver(
        &self,
        controller_id: &ControllerId,
        request_id: &RequestId,
        reply: ReplyEnvelope,
    ) -> bool {
        let mut inner = self.lock();
        inner.sweep(self.retention);

        let Some(entry) = inner
            .pending
            .get_mut(&(controller_id.clone(), request_id.clone()))
        else {
            return false;
        };
        if entry.delivered {
            return false;
        }

        entry.delivered = true;
        entry.slot.send_replace(Some(reply));
        true
    }

    /// Called when the caller is done with a request.
    ///
    /// A delivered entry stays behind without its payload until it is swept,
    /// so late duplicates are still recognised; anything else is removed.
    pub fn release(&self, controller_id: &ControllerId, request_id: &RequestId) {
        let mut inner = self.lock();
        let key = (controller_id.clone(), request_id.clone());
        match inner.pending.get(&key) {
            Some(entry) if entry.delivered => {
                entry.slot.send_replace(None);
            }
            Some(_) => {
                inner.pending.remove(&key);
            }
            None => {}
        }
    }

    /// Remove entries past the retention window that nobody waits on.
    ///
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.lock().sweep(self.retention)
    }

    /// Drop every entry and refuse new registrations.
    ///
    /// Waiters observe [`SlotWait::Closed`].
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.pending.clear();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Check if the registry holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one bounded wait on a result slot
#[derive(Debug, Clone, PartialEq)]
pub enum SlotWait {
    /// The reply arrived
    Ready(ReplyEnvelope),
    /// Nothing arrived within the wait
    Pending,
    /// The registry was closed; no reply will ever arrive
    Closed,
}

/// Caller's handle to the reply of one request
pub struct ResultSlot {
    rx: watch::Receiver<Option<ReplyEnvelope>>,
}

impl ResultSlot {
    /// Wait up to `timeout` for the reply. No lock is held while waiting.
    pub async fn wait(&mut self, timeout: Duration) -> SlotWait {
        match tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await {
            Err(_) => SlotWait::Pending,
            Ok(Err(_)) => SlotWait::Closed,
            Ok(Ok(reply)) => match reply.as_ref() {
                Some(reply) => SlotWait::Ready(reply.clone()),
                None => SlotWait::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RETENTION: Duration = Duration::from_secs(30);

    fn ids(request: &str) -> (ControllerId, RequestId) {
        (ControllerId::new("C1"), RequestId::from(request))
    }

    fn reply(value: serde_json::Value) -> ReplyEnvelope {
        ReplyEnvelope::success(Some(value))
    }

    #[tokio::test]
    async fn test_deliver_then_wait() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("r1");
        let mut slot = registry.register(&controller, &request).unwrap();

        assert!(registry.deliver(&controller, &request, reply(json!({"a": 1}))));
        assert_eq!(
            slot.wait(Duration::from_millis(10)).await,
            SlotWait::Ready(reply(json!({"a": 1})))
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("r1");
        let mut slot = registry.register(&controller, &request).unwrap();

        assert!(registry.deliver(&controller, &request, reply(json!("first"))));
        assert!(!registry.deliver(&controller, &request, reply(json!("second"))));

        assert_eq!(
            slot.wait(Duration::from_millis(10)).await,
            SlotWait::Ready(reply(json!("first")))
        );
    }

    #[tokio::test]
    async fn test_duplicate_after_release_is_noop() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("r1");
        let _slot = registry.register(&controller, &request).unwrap();

        assert!(registry.deliver(&controller, &request, reply(json!(1))));
        registry.release(&controller, &request);
        assert!(!registry.deliver(&controller, &request, reply(json!(1))));
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_delivered() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("never-registered");
        assert!(!registry.deliver(&controller, &request, reply(json!(1))));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_twice_shares_slot() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("r1");
        let mut first = registry.register(&controller, &request).unwrap();
        let mut second = registry.register(&controller, &request).unwrap();
        assert_eq!(registry.len(), 1);

        assert_eq!(first.wait(Duration::from_secs(1)).await, SlotWait::Pending);
        registry.deliver(&controller, &request, reply(json!("x")));

        assert!(matches!(first.wait(Duration::ZERO).await, SlotWait::Ready(_)));
        assert!(matches!(second.wait(Duration::ZERO).await, SlotWait::Ready(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_entries_are_swept() {
        let registry = CorrelationRegistry::new(RETENTION);
        for i in 0..100 {
            let (controller, request) = ids(&format!("r{i}"));
            // Slot dropped immediately: nobody waits on these
            drop(registry.register(&controller, &request).unwrap());
        }
        assert_eq!(registry.len(), 100);

        tokio::time::advance(RETENTION + Duration::from_secs(1)).await;

        let (controller, request) = ids("fresh");
        let _slot = registry.register(&controller, &request).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waited_on_entries_survive_sweep() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("long-running");
        let mut slot = registry.register(&controller, &request).unwrap();

        tokio::time::advance(RETENTION * 2).await;
        assert_eq!(registry.sweep(), 0);

        assert!(registry.deliver(&controller, &request, reply(json!("late"))));
        assert!(matches!(slot.wait(Duration::ZERO).await, SlotWait::Ready(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_tombstones_are_swept() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("r1");
        let mut slot = registry.register(&controller, &request).unwrap();
        registry.deliver(&controller, &request, reply(json!(1)));
        assert!(matches!(slot.wait(Duration::ZERO).await, SlotWait::Ready(_)));
        registry.release(&controller, &request);
        assert_eq!(registry.len(), 1);

        tokio::time::advance(RETENTION + Duration::from_secs(1)).await;
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_without_reply_removes_entry() {
        let registry = CorrelationRegistry::new(RETENTION);
        let (controller, request) = ids("r1");
        let _slot = registry.register(&controller, &request).unwrap();
        registry.release(&controller, &request);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let registry = std::sync::Arc::new(CorrelationRegistry::new(RETENTION));
        let (controller, request) = ids("r1");
        let mut slot = registry.register(&controller, &request).unwrap();

        let waiter = tokio::spawn(async move { slot.wait(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        registry.close();

        assert_eq!(waiter.await.unwrap(), SlotWait::Closed);
        assert!(matches!(
            registry.register(&controller, &request),
            Err(TransportError::Closed)
        ));
    }
}
