//! Arguments shared by both binaries

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use fc_core::config::{self, ClientConfig, TlsFiles};
use fc_core::ControllerId;

/// Bus to talk to the controller over
#[derive(Debug, Clone, Subcommand)]
pub enum BusCommand {
    /// Use the controller's unix socket
    UnixSocket(UnixSocketArgs),
    /// Use an MQTT broker
    Mqtt(MqttArgs),
    /// Use ubus
    Ubus(UbusArgs),
}

#[derive(Debug, Clone, Args)]
pub struct UnixSocketArgs {
    /// Socket path [default: /tmp/foris-controller.soc]
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct UbusArgs {
    /// Socket path [default: /var/run/ubus.sock]
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct MqttArgs {
    /// Broker host [default: localhost]
    #[arg(long)]
    pub host: Option<String>,

    /// Broker port [default: 1883]
    #[arg(long)]
    pub port: Option<u16>,

    /// TLS files for an encrypted connection
    #[arg(long, num_args = 3, value_names = ["CA_CRT_FILE", "CRT_FILE", "KEY_FILE"])]
    pub tls_files: Option<Vec<PathBuf>>,

    /// Controller on the bus to address (16 alphanumeric characters)
    #[arg(long, value_parser = parse_controller_id)]
    pub controller_id: Option<ControllerId>,

    /// Passwd file whose first record authenticates to the broker
    #[arg(long)]
    pub passwd_file: Option<PathBuf>,
}

fn parse_controller_id(value: &str) -> Result<ControllerId, String> {
    value.parse().map_err(|e: fc_core::ConfigError| e.to_string())
}

impl BusCommand {
    /// Override configuration values with the ones given on the command line
    pub fn apply(&self, config: &mut ClientConfig) {
        match self {
            BusCommand::UnixSocket(args) => {
                if let Some(path) = &args.path {
                    config.unix_socket.path = path.clone();
                }
            }
            BusCommand::Ubus(args) => {
                if let Some(path) = &args.path {
                    config.ubus.path = path.clone();
                }
            }
            BusCommand::Mqtt(args) => {
                if let Some(host) = &args.host {
                    config.mqtt.host = host.clone();
                }
                if let Some(port) = args.port {
                    config.mqtt.port = port;
                }
                if let Some([ca, cert, key]) = args.tls_files.as_deref() {
                    config.mqtt.tls_files = Some(TlsFiles {
                        ca: ca.clone(),
                        cert: cert.clone(),
                        key: key.clone(),
                    });
                }
                if let Some(controller_id) = &args.controller_id {
                    config.mqtt.controller_id = Some(controller_id.clone());
                }
                if let Some(passwd_file) = &args.passwd_file {
                    config.mqtt.passwd_file = Some(passwd_file.clone());
                }
            }
        }
    }
}

/// Load the configuration file.
///
/// An explicitly given file must exist; the default one is optional.
pub fn load_client_config(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path)),
        None => {
            let default_path = config::default_config_path();
            if !default_path.exists() {
                return Ok(ClientConfig::default());
            }
            config::load_config(&default_path).or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                Ok(ClientConfig::default())
            })
        }
    }
}

/// Read request data from `-i FILE` or `-I JSON`
pub fn read_input(file: Option<&Path>, inline: Option<&str>) -> Result<Option<serde_json::Value>> {
    match (file, inline) {
        (Some(_), Some(_)) => bail!("--input and --input-json are mutually exclusive"),
        (Some(path), None) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file {:?}", path))?;
            let data = serde_json::from_str(&content)
                .with_context(|| format!("Input file {:?} is not valid JSON", path))?;
            Ok(Some(data))
        }
        (None, Some(json)) => {
            let data = serde_json::from_str(json).context("Input is not valid JSON")?;
            Ok(Some(data))
        }
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        bus: BusCommand,
    }

    #[test]
    fn test_mqtt_overrides() {
        let cli = TestCli::try_parse_from([
            "test",
            "mqtt",
            "--host",
            "192.168.1.1",
            "--port",
            "11883",
            "--tls-files",
            "ca.crt",
            "client.crt",
            "client.key",
            "--controller-id",
            "0000aabbccddeeff",
        ])
        .unwrap();

        let mut config = ClientConfig::default();
        cli.bus.apply(&mut config);

        assert_eq!(config.mqtt.host, "192.168.1.1");
        assert_eq!(config.mqtt.port, 11883);
        assert_eq!(
            config.mqtt.controller_id,
            Some(ControllerId::new("0000AABBCCDDEEFF"))
        );
        assert_eq!(
            config.mqtt.tls_files.unwrap().key,
            PathBuf::from("client.key")
        );
    }

    #[test]
    fn test_bad_controller_id_is_rejected() {
        assert!(TestCli::try_parse_from(["test", "mqtt", "--controller-id", "short"]).is_err());
    }

    #[test]
    fn test_tls_files_take_three_paths() {
        assert!(TestCli::try_parse_from(["test", "mqtt", "--tls-files", "ca.crt"]).is_err());
    }

    #[test]
    fn test_unix_socket_keeps_config_path_unless_given() {
        let cli = TestCli::try_parse_from(["test", "unix-socket"]).unwrap();
        let mut config = ClientConfig::default();
        config.unix_socket.path = PathBuf::from("/run/foris.soc");
        cli.bus.apply(&mut config);
        assert_eq!(config.unix_socket.path, PathBuf::from("/run/foris.soc"));
    }

    #[test]
    fn test_ubus_path() {
        let mut config = ClientConfig::default();
        TestCli::try_parse_from(["test", "ubus"])
            .unwrap()
            .bus
            .apply(&mut config);
        assert_eq!(config.ubus.path, PathBuf::from("/var/run/ubus.sock"));

        TestCli::try_parse_from(["test", "ubus", "--path", "/tmp/ubus.sock"])
            .unwrap()
            .bus
            .apply(&mut config);
        assert_eq!(config.ubus.path, PathBuf::from("/tmp/ubus.sock"));
    }

    #[test]
    fn test_read_input() {
        assert_eq!(read_input(None, None).unwrap(), None);
        assert_eq!(
            read_input(None, Some(r#"{"language": "cs"}"#)).unwrap(),
            Some(json!({"language": "cs"}))
        );
        assert!(read_input(None, Some("{broken")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert_eq!(
            read_input(Some(&path), None).unwrap(),
            Some(json!([1, 2, 3]))
        );
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_client_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
