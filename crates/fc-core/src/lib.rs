//! fc-core: Core abstractions and configuration for foris-controller clients
//!
//! This crate provides the identifiers, the client-facing error taxonomy and
//! the configuration structures shared by the bus runtime and the CLI.

pub mod config;
pub mod error;
pub mod identity;
pub mod types;

pub use error::{ClientError, ConfigError, ControllerError, TransportError};
pub use types::{ControllerId, RequestId};
