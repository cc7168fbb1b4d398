//! Notification listener

use std::time::Duration;

use serde_json::Value;

use fc_core::{ControllerId, TransportError};
use fc_protocol::{topic, InboundTopic, Notification, ProtocolError};

use crate::transport::{BusConnector, InboundFrame};

/// Which notifications to receive; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub controller_id: Option<ControllerId>,
    pub module: Option<String>,
}

impl NotificationFilter {
    /// Topic filter to subscribe to
    pub fn topic_filter(&self) -> String {
        topic::notification_filter(
            self.controller_id.as_ref().map(ControllerId::as_str),
            self.module.as_deref(),
        )
    }
}

/// Controller and notification carried by a frame, `None` for frames that
/// are not notifications.
///
/// Bodies without `module`/`action` (liveness broadcasts) are wrapped, with
/// both taken from the topic.
fn parse_notification(
    frame: &InboundFrame,
) -> Result<Option<(ControllerId, Notification)>, ProtocolError> {
    let (controller_id, module, action) = match InboundTopic::parse(&frame.topic)? {
        InboundTopic::Notification {
            controller_id,
            module,
            action,
        } => (controller_id, module, action),
        InboundTopic::Advertisement { controller_id } => {
            (controller_id, "remote".to_string(), "advertize".to_string())
        }
        _ => return Ok(None),
    };

    let body: Value = serde_json::from_slice(&frame.payload)?;
    let notification = match serde_json::from_value::<Notification>(body.clone()) {
        Ok(notification) => notification,
        Err(_) => Notification {
            kind: None,
            module,
            action,
            data: Some(body),
        },
    };
    Ok(Some((ControllerId::from(controller_id), notification)))
}

/// Receive notifications matching `filter` and pass each to `handler`.
///
/// Listens until `timeout` elapses (zero listens until the connection
/// closes). Malformed notifications are logged and dropped.
pub async fn listen<F>(
    connector: &dyn BusConnector,
    filter: &NotificationFilter,
    timeout: Duration,
    mut handler: F,
) -> Result<(), TransportError>
where
    F: FnMut(&ControllerId, &Notification),
{
    let mut connection = connector.connect().await?;
    let topic_filter = filter.topic_filter();
    connection.publisher.subscribe(&topic_filter).await?;
    tracing::debug!("Listening on {}", topic_filter);

    let deadline = async {
        if timeout.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(timeout).await
        }
    };
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::debug!("Listening stopped");
                break Ok(());
            }

            frame = connection.inbound.next_frame() => match frame {
                Ok(Some(frame)) => match parse_notification(&frame) {
                    Ok(Some((controller_id, notification))) => {
                        tracing::debug!(
                            controller_id = %controller_id,
                            "Notification {}/{}",
                            notification.module,
                            notification.action
                        );
                        handler(&controller_id, &notification);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Dropping malformed notification on {}: {}", frame.topic, e),
                },
                Ok(None) => {
                    tracing::info!("Bus connection closed");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        }
    };

    if let Err(e) = connection.publisher.disconnect().await {
        tracing::debug!("Disconnect failed: {}", e);
    }
    result
}
