//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::types::ControllerId;

/// Interval at which controllers broadcast their liveness
pub const ANNOUNCER_PERIOD: Duration = Duration::from_secs(5);

/// How long silent controllers and unanswered requests are remembered
pub const RETENTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the transport to acknowledge a publish locally
pub const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_millis(300);

/// Configuration for the command-line client and listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// MQTT broker settings
    pub mqtt: MqttConfig,

    /// Unix-socket settings
    pub unix_socket: UnixSocketConfig,

    /// ubus settings
    pub ubus: UbusConfig,

    /// Liveness and retry windows
    pub timing: TimingConfig,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address
    pub host: String,

    /// Broker port
    pub port: u16,

    /// MQTT keep-alive interval
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,

    /// Time allowed for the initial CONNACK
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// TLS material; plain TCP when absent
    pub tls_files: Option<TlsFiles>,

    /// File whose first `user:password` line authenticates to the broker
    pub passwd_file: Option<PathBuf>,

    /// Controller to address; defaults to this machine's node id
    pub controller_id: Option<ControllerId>,

    /// Backoff between reconnect attempts
    pub backoff: BackoffConfig,

    /// Consecutive failed reconnects before the connection is given up
    pub max_reconnect_attempts: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tls_files: None,
            passwd_file: None,
            controller_id: None,
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: 10,
        }
    }
}

/// Paths to TLS material for an encrypted broker connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    /// CA certificate (PEM)
    pub ca: PathBuf,
    /// Client certificate (PEM)
    pub cert: PathBuf,
    /// Client private key (PEM)
    pub key: PathBuf,
}

/// Unix-socket transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnixSocketConfig {
    /// Socket the controller listens on (and the listener binds)
    pub path: PathBuf,
}

impl Default for UnixSocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/foris-controller.soc"),
        }
    }
}

/// ubus transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UbusConfig {
    /// Socket ubusd listens on
    pub path: PathBuf,
}

impl Default for UbusConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/run/ubus.sock"),
        }
    }
}

/// Timing windows of the call algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Liveness broadcast interval; also the per-iteration reply wait
    #[serde(with = "duration_millis")]
    pub announcer_period: Duration,

    /// Retention of silent controllers and stale registry entries
    #[serde(with = "duration_millis")]
    pub retention_timeout: Duration,

    /// Local publish acknowledgement window
    #[serde(with = "duration_millis")]
    pub publish_ack_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            announcer_period: ANNOUNCER_PERIOD,
            retention_timeout: RETENTION_TIMEOUT,
            publish_ack_timeout: PUBLISH_ACK_TIMEOUT,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(
            config.unix_socket.path,
            PathBuf::from("/tmp/foris-controller.soc")
        );
        assert_eq!(config.ubus.path, PathBuf::from("/var/run/ubus.sock"));
        assert_eq!(config.timing.announcer_period, Duration::from_secs(5));
        assert_eq!(config.timing.retention_timeout, Duration::from_secs(30));
        assert_eq!(config.timing.publish_ack_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_partial_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            [mqtt]
            host = "192.168.1.1"
            controller_id = "0000AABBCCDDEEFF"

            [mqtt.tls_files]
            ca = "/etc/ssl/ca.crt"
            cert = "/etc/ssl/client.crt"
            key = "/etc/ssl/client.key"

            [ubus]
            path = "/run/ubus/ubus.sock"

            [timing]
            announcer_period = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "192.168.1.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(
            config.mqtt.controller_id,
            Some(ControllerId::new("0000AABBCCDDEEFF"))
        );
        assert_eq!(
            config.mqtt.tls_files.unwrap().key,
            PathBuf::from("/etc/ssl/client.key")
        );
        assert_eq!(config.ubus.path, PathBuf::from("/run/ubus/ubus.sock"));
        assert_eq!(config.timing.announcer_period, Duration::from_secs(1));
        assert_eq!(config.timing.retention_timeout, RETENTION_TIMEOUT);
    }
}
