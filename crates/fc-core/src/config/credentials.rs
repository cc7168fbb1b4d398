//! Broker credentials from a passwd file

use std::path::Path;

use crate::error::ConfigError;

/// Username and password for the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Read the first `user:password` record of a passwd file
///
/// The password is everything after the first colon and may itself contain
/// colons.
pub fn read_passwd_file(path: &Path) -> Result<Credentials, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Invalid(format!("Failed to read passwd file {:?}: {}", path, e))
    })?;

    let line = content.lines().next().unwrap_or_default();
    match line.split_once(':') {
        Some((username, password)) if !username.is_empty() => Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => Err(ConfigError::Invalid(format!(
            "First line of {:?} is not a user:password record",
            path
        ))),
    }
}
