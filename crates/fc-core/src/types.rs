//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Number of characters in a controller id given on the command line
pub const CONTROLLER_ID_LEN: usize = 16;

/// Stable identifier of a remote controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerId(String);

impl ControllerId {
    /// Create a controller id without validation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ControllerId {
    type Err = ConfigError;

    /// Parse a user supplied id: exactly 16 ASCII alphanumerics,
    /// normalised to upper case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CONTROLLER_ID_LEN || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid(format!(
                "controller id must be {} alphanumeric characters, got '{}'",
                CONTROLLER_ID_LEN, s
            )));
        }
        Ok(Self(s.to_ascii_uppercase()))
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ControllerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ControllerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Token correlating one call with its reply; never reused
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh request id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_id_parse_uppercases() {
        let id: ControllerId = "0000aabbccddeeff".parse().unwrap();
        assert_eq!(id.as_str(), "0000AABBCCDDEEFF");
    }

    #[test]
    fn test_controller_id_parse_rejects_bad_input() {
        assert!("0000aabbccddeef".parse::<ControllerId>().is_err());
        assert!("0000aabbccddeeff0".parse::<ControllerId>().is_err());
        assert!("0000aabb-cddeeff".parse::<ControllerId>().is_err());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().contains('/'));
    }
}
