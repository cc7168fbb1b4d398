//! Controller liveness tracking
//!
//! Controllers broadcast an advertisement every announcer period listing the
//! requests they are currently working on. The tracker keeps the last one
//! per controller; each broadcast replaces the previous in-flight set.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use fc_core::{ControllerId, RequestId};

/// What the tracker knows about one request on one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No advertisement has been seen from the controller
    Unknown,
    /// The controller has been silent longer than the announcer period
    Stale,
    /// Alive and advertising the request as in flight
    Working,
    /// Alive but not working on the request
    Idle,
}

struct ControllerRecord {
    last_seen: Instant,
    in_flight: HashSet<String>,
}

/// Last-seen times and in-flight sets of remote controllers
pub struct LivenessTracker {
    records: Mutex<HashMap<ControllerId, ControllerRecord>>,
    announcer_period: Duration,
    retention: Duration,
}

impl LivenessTracker {
    pub fn new(announcer_period: Duration, retention: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            announcer_period,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ControllerId, ControllerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an advertisement from `controller_id`.
    pub fn update<I>(&self, controller_id: &ControllerId, in_flight: I)
    where
        I: IntoIterator<Item = String>,
    {
        let record = ControllerRecord {
            last_seen: Instant::now(),
            in_flight: in_flight.into_iter().collect(),
        };

        let mut records = self.lock();
        records.insert(controller_id.clone(), record);
        let retention = self.retention;
        records.retain(|_, r| r.last_seen.elapsed() <= retention);
    }

    /// True if the controller advertised within the announcer period
    pub fn is_alive(&self, controller_id: &ControllerId) -> bool {
        self.lock()
            .get(controller_id)
            .is_some_and(|r| r.last_seen.elapsed() <= self.announcer_period)
    }

    /// True if the last advertisement listed `request_id`
    pub fn is_in_flight(&self, controller_id: &ControllerId, request_id: &RequestId) -> bool {
        self.lock()
            .get(controller_id)
            .is_some_and(|r| r.in_flight.contains(request_id.as_str()))
    }

    /// Liveness and in-flight status read under a single lock
    pub fn liveness(&self, controller_id: &ControllerId, request_id: &RequestId) -> Liveness {
        match self.lock().get(controller_id) {
            None => Liveness::Unknown,
            Some(r) if r.last_seen.elapsed() > self.announcer_period => Liveness::Stale,
            Some(r) if r.in_flight.contains(request_id.as_str()) => Liveness::Working,
            Some(_) => Liveness::Idle,
        }
    }

    /// Time left until the controller counts as stale.
    ///
    /// `None` when nothing is known about it or it is stale already.
    pub fn stale_in(&self, controller_id: &ControllerId) -> Option<Duration> {
        self.lock()
            .get(controller_id)
            .and_then(|r| self.announcer_period.checked_sub(r.last_seen.elapsed()))
            .filter(|left| !left.is_zero())
    }

    /// Forget controllers silent for longer than the retention window
    pub fn sweep(&self) -> usize {
        let mut records = self.lock();
        let before = records.len();
        let retention = self.retention;
        records.retain(|_, r| r.last_seen.elapsed() <= retention);
        before - records.len()
    }

    /// Number of controllers currently remembered
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
