//! Print notifications as they arrive

use std::time::Duration;

use fc_bus::transport::{MqttConnector, StreamListener, UbusListener};
use fc_bus::{listen, NotificationFilter};
use fc_core::config::ClientConfig;
use fc_core::identity::default_controller_id;
use fc_core::ClientError;

use crate::args::BusCommand;
use crate::output::NotificationSink;

/// Listen on the selected bus until `timeout` (zero: forever)
pub async fn listen_command(
    bus: &BusCommand,
    config: &ClientConfig,
    module: Option<String>,
    timeout: Duration,
    sink: &mut NotificationSink,
) -> Result<(), ClientError> {
    match bus {
        BusCommand::UnixSocket(_) => {
            tracing::debug!("Using unix-socket to listen for notifications");
            let listener = StreamListener::bind(&config.unix_socket.path)?;
            // Notifications on the socket come from the local controller
            let controller_id = default_controller_id();
            listener
                .listen(module.as_deref(), timeout, |notification| {
                    if let Err(e) = sink.write(&controller_id, notification) {
                        tracing::error!("Failed to write notification: {}", e);
                    }
                })
                .await?;
        }
        BusCommand::Ubus(_) => {
            tracing::debug!("Using ubus to listen for notifications");
            let mut listener = UbusListener::connect(&config.ubus.path).await?;
            // ubus events come from the local controller
            let controller_id = default_controller_id();
            let result = listener
                .listen(module.as_deref(), timeout, |notification| {
                    if let Err(e) = sink.write(&controller_id, notification) {
                        tracing::error!("Failed to write notification: {}", e);
                    }
                })
                .await;
            if let Err(e) = listener.disconnect().await {
                tracing::debug!("Closing ubus connection failed: {}", e);
            }
            result?;
        }
        BusCommand::Mqtt(_) => {
            tracing::debug!("Using mqtt to listen for notifications");
            let connector = MqttConnector::new(&config.mqtt)?;
            let filter = NotificationFilter {
                controller_id: config.mqtt.controller_id.clone(),
                module,
            };
            listen(&connector, &filter, timeout, |controller_id, notification| {
                if let Err(e) = sink.write(controller_id, notification) {
                    tracing::error!("Failed to write notification: {}", e);
                }
            })
            .await?;
        }
    }
    Ok(())
}
