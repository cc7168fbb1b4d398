//! fc-bus: Client runtime for foris-controller message buses
//!
//! A publish/subscribe bus offers no connection state, no request/reply
//! primitive, no ordering across topics and a per-message size ceiling.
//! This crate builds exactly-once-observed calls on top of it:
//!
//! - [`CorrelationRegistry`] matches asynchronous replies to outstanding calls
//! - [`LivenessTracker`] infers from liveness broadcasts whether a controller
//!   is alive and which requests it is working on
//! - [`Receiver`] owns the inbound side of a connection and feeds both
//! - [`BusClient`] implements `call()`: publish, retry, poll and timeout
//!
//! Transports are pluggable through [`transport::BusConnector`]; MQTT and an
//! in-process bus are provided, plus the unix-socket stream transport, which
//! needs no correlation at all.

pub mod client;
pub mod listener;
pub mod receiver;
pub mod registry;
pub mod tracker;
pub mod transport;

pub use client::{BusClient, CallOptions};
pub use listener::{listen, NotificationFilter};
pub use receiver::{Receiver, ReceiverState};
pub use registry::{CorrelationRegistry, ResultSlot, SlotWait};
pub use tracker::{Liveness, LivenessTracker};
