//! Error types for foris-controller clients

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use fc_protocol::{ControllerFault, ProtocolError};
use thiserror::Error;

use crate::types::ControllerId;

/// Outcome of a failed call, as seen by application code
#[derive(Error, Debug)]
pub enum ClientError {
    /// The controller stopped advertising itself, or was never seen
    #[error("Connection to controller {controller_id} is lost.")]
    ControllerMissing { controller_id: ControllerId },

    /// The caller's deadline passed while the controller stayed alive
    #[error("Request {module}/{action} timed out after {timeout:?}")]
    RequestTimeout {
        module: String,
        action: String,
        timeout: Duration,
    },

    /// The controller replied with an error list
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Publishing or connecting failed, including the single retry
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),

    /// Outbound message could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Structured error reply from a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerError {
    pub module: String,
    pub action: String,
    /// Errors in the order the controller reported them
    pub errors: Vec<ControllerFault>,
}

impl ControllerError {
    pub fn new(
        module: impl Into<String>,
        action: impl Into<String>,
        errors: Vec<ControllerFault>,
    ) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
            errors,
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Controller error(s) has occured:")?;
        for error in &self.errors {
            if let Some(stacktrace) = &error.stacktrace {
                writeln!(f, "{}", stacktrace)?;
            }
            writeln!(f, "{}", error.description)?;
        }
        Ok(())
    }
}

impl std::error::Error for ControllerError {}

/// Failures reported by a transport binding
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Publish was rejected
    #[error("Publish failed: {0}")]
    Publish(String),

    /// No local publish acknowledgement within the allowed time
    #[error("Publish not acknowledged within {0:?}")]
    AckTimeout(Duration),

    /// Subscription was rejected
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Message exceeds the transport's size ceiling
    #[error("Message of {size} bytes exceeds transport limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The connection is closed
    #[error("Connection closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
