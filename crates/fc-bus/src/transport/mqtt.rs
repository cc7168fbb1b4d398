//! MQTT binding over rumqttc
//!
//! rumqttc drives the network from its event loop: the [`AsyncClient`] only
//! queues outgoing packets, and nothing moves until the event loop is
//! polled. The event loop is owned by [`MqttInbound`], which therefore
//! doubles as the connection's I/O driver. It reconnects with exponential
//! backoff and re-issues every subscription after the broker accepts the
//! new session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};

use fc_core::config::{read_passwd_file, BackoffConfig, MqttConfig};
use fc_core::{ConfigError, TransportError};
use fc_protocol::CHUNK_SIZE;

use super::{BusConnection, BusConnector, BusInbound, BusPublisher, ExponentialBackoff, InboundFrame};

/// Largest packet accepted either way: one chunk frame with JSON escaping
/// headroom
pub const MAX_PACKET_SIZE: usize = 8 * CHUNK_SIZE;

/// Capacity of the request queue between client handles and the event loop
const REQUEST_QUEUE: usize = 64;

/// Opens MQTT connections from a prepared set of options
#[derive(Clone)]
pub struct MqttConnector {
    options: MqttOptions,
    connect_timeout: Duration,
    backoff: BackoffConfig,
    max_reconnect_attempts: u32,
}

impl MqttConnector {
    /// Build connection options from configuration.
    ///
    /// Reads the passwd file and TLS material eagerly so that a bad path is
    /// reported before any network activity.
    pub fn new(config: &MqttConfig) -> Result<Self, ConfigError> {
        let client_id = format!("foris-client-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if let Some(passwd_file) = &config.passwd_file {
            let credentials = read_passwd_file(passwd_file)?;
            options.set_credentials(credentials.username, credentials.password);
        }

        if let Some(tls) = &config.tls_files {
            let read = |path: &std::path::Path| {
                std::fs::read(path).map_err(|e| {
                    ConfigError::Invalid(format!("Failed to read TLS file {:?}: {}", path, e))
                })
            };
            let ca = read(&tls.ca)?;
            let cert = read(&tls.cert)?;
            let key = read(&tls.key)?;
            options.set_transport(Transport::tls(ca, Some((cert, key)), None));
        }

        Ok(Self {
            options,
            connect_timeout: config.connect_timeout,
            backoff: config.backoff.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        })
    }

    /// Broker address this connector dials
    pub fn broker_address(&self) -> (String, u16) {
        self.options.broker_address()
    }
}

/// Poll until the broker answers the CONNECT
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Connect(format!(
                        "broker refused connection: {:?}",
                        code
                    ))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

#[async_trait]
impl BusConnector for MqttConnector {
    async fn connect(&self) -> Result<BusConnection, TransportError> {
        let (host, port) = self.options.broker_address();
        tracing::info!("Connecting to MQTT broker {}:{}", host, port);

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_QUEUE);

        tokio::time::timeout(self.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "no CONNACK from {}:{} within {:?}",
                    host, port, self.connect_timeout
                ))
            })??;

        tracing::info!("Connected to MQTT broker {}:{}", host, port);

        let shared = Arc::new(Shared::default());
        Ok(BusConnection {
            publisher: Arc::new(MqttPublisher {
                client: client.clone(),
                shared: shared.clone(),
            }),
            inbound: Box::new(MqttInbound {
                client,
                eventloop,
                shared,
                backoff: ExponentialBackoff::from_config(&self.backoff),
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnecting: false,
            }),
        })
    }
}

/// State visible to both halves of one connection
#[derive(Default)]
struct Shared {
    subscriptions: Mutex<Vec<String>>,
    closing: AtomicBool,
}

struct MqttPublisher {
    client: AsyncClient,
    shared: Arc<Shared>,
}

#[async_trait]
impl BusPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if payload.len() > MAX_PACKET_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if subscriptions.iter().any(|s| s == filter) {
                return Ok(());
            }
            subscriptions.push(filter.to_string());
        }
        tracing::debug!("Subscribing to {}", filter);
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Disconnecting from MQTT broker");
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

struct MqttInbound {
    client: AsyncClient,
    eventloop: EventLoop,
    shared: Arc<Shared>,
    backoff: ExponentialBackoff,
    max_reconnect_attempts: u32,
    reconnecting: bool,
}

impl MqttInbound {
    fn resubscribe(&self) {
        let subscriptions = self
            .shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for filter in subscriptions {
            // The event loop is this task; an awaiting subscribe could
            // wait on a full queue forever.
            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                tracing::warn!("Failed to re-subscribe to {}: {}", filter, e);
            }
        }
    }

    async fn handle_error(&mut self, error: ConnectionError) -> Result<(), TransportError> {
        if self.backoff.attempts() >= self.max_reconnect_attempts {
            tracing::error!(
                "Giving up on MQTT broker after {} reconnect attempts: {}",
                self.backoff.attempts(),
                error
            );
            return Err(TransportError::Connect(error.to_string()));
        }

        let delay = self.backoff.next_delay();
        tracing::warn!(
            "MQTT connection error: {}. Reconnecting in {:?} (attempt {}/{})",
            error,
            delay,
            self.backoff.attempts(),
            self.max_reconnect_attempts
        );
        self.reconnecting = true;
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[async_trait]
impl BusInbound for MqttInbound {
    async fn next_frame(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(InboundFrame {
                        topic: publish.topic,
                        payload: publish.payload,
                    }));
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        tracing::warn!("Broker refused reconnect: {:?}", ack.code);
                        continue;
                    }
                    if self.reconnecting {
                        tracing::info!("Reconnected to MQTT broker");
                        self.reconnecting = false;
                        self.resubscribe();
                    }
                    self.backoff.reset();
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("MQTT disconnect sent");
                    return Ok(None);
                }
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => return Ok(None),
                Err(_) if self.shared.closing.load(Ordering::Acquire) => return Ok(None),
                Err(e) => self.handle_error(e).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::config::TlsFiles;
    use std::io::Write;

    #[test]
    fn test_connector_from_config() {
        let config = MqttConfig {
            host: "192.168.1.1".to_string(),
            port: 11883,
            ..Default::default()
        };
        let connector = MqttConnector::new(&config).unwrap();
        assert_eq!(
            connector.broker_address(),
            ("192.168.1.1".to_string(), 11883)
        );
    }

    #[test]
    fn test_missing_passwd_file_is_config_error() {
        let config = MqttConfig {
            passwd_file: Some("/nonexistent/passwd".into()),
            ..Default::default()
        };
        assert!(matches!(
            MqttConnector::new(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_passwd_file_sets_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "turris:secret").unwrap();
        let config = MqttConfig {
            passwd_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let connector = MqttConnector::new(&config).unwrap();
        assert_eq!(
            connector.options.credentials(),
            Some(("turris".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_missing_tls_file_is_config_error() {
        let config = MqttConfig {
            tls_files: Some(TlsFiles {
                ca: "/nonexistent/ca.crt".into(),
                cert: "/nonexistent/client.crt".into(),
                key: "/nonexistent/client.key".into(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            MqttConnector::new(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop a listener to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let connector = MqttConnector::new(&config).unwrap();
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connect(_))
        ));
    }
}
