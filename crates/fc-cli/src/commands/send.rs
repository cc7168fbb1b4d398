//! Send one request and return its reply

use std::time::Duration;

use serde_json::Value;

use fc_bus::transport::{MqttConnector, StreamSender, UbusSender};
use fc_bus::{BusClient, CallOptions};
use fc_core::config::ClientConfig;
use fc_core::ClientError;

use crate::args::BusCommand;

/// What to call
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub module: String,
    pub action: String,
    pub data: Option<Value>,
    /// Zero waits forever
    pub timeout: Duration,
}

/// Call the controller over the selected bus.
///
/// `null` is returned when an MQTT reply carries no data; the unix socket
/// and ubus yield `{}` instead.
pub async fn send_command(
    bus: &BusCommand,
    config: &ClientConfig,
    request: SendRequest,
) -> Result<Value, ClientError> {
    match bus {
        BusCommand::UnixSocket(_) => {
            tracing::debug!("Using unix-socket to send commands");
            let mut sender =
                StreamSender::connect(&config.unix_socket.path, request.timeout).await?;
            let reply = sender
                .send(&request.module, &request.action, request.data, None)
                .await;
            if let Err(e) = sender.disconnect().await {
                tracing::debug!("Closing socket failed: {}", e);
            }
            reply
        }
        BusCommand::Ubus(_) => {
            tracing::debug!("Using ubus to send commands");
            let mut sender = UbusSender::connect(&config.ubus.path, request.timeout).await?;
            let reply = sender
                .send(&request.module, &request.action, request.data, None)
                .await;
            if let Err(e) = sender.disconnect().await {
                tracing::debug!("Closing ubus connection failed: {}", e);
            }
            reply
        }
        BusCommand::Mqtt(_) => {
            tracing::debug!("Using mqtt to send commands");
            let connector = MqttConnector::new(&config.mqtt)?;
            let client = BusClient::connect(
                &connector,
                config.mqtt.controller_id.clone(),
                config.timing,
            )
            .await?;

            let reply = client
                .call(
                    &request.module,
                    &request.action,
                    request.data,
                    CallOptions::default().with_timeout(request.timeout),
                )
                .await;
            if let Err(e) = client.disconnect().await {
                tracing::debug!("Disconnect failed: {}", e);
            }
            Ok(reply?.unwrap_or(Value::Null))
        }
    }
}
