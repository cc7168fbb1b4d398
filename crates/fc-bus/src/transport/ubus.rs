//! ubus transport
//!
//! Talks to ubusd over its unix socket. Requests invoke the `send` method of
//! the object foris-controller registers; ubusd correlates the reply by the
//! sequence number of the invoke, so several requests can share one
//! connection and a reply that shows up after its caller gave up is simply
//! skipped. Notifications are ubus events: the listener registers an object
//! for the controller's event pattern and ubusd invokes it once per event.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use fc_core::identity::default_controller_id;
use fc_core::{ClientError, ControllerError, TransportError};
use fc_protocol::{
    ControllerFault, Notification, ProtocolError, ReplyEnvelope, StreamRequest, UbusAttr,
    UbusCodec, UbusMessage, UbusMsgType, UbusStatus,
};

use super::stream::is_notification;

/// Object path foris-controller registers on ubus
pub const CONTROLLER_OBJECT: &str = "foris-controller";

/// Event pattern foris-controller sends notifications under
pub const EVENT_PATTERN: &str = "foris-controller";

const SEND_METHOD: &str = "send";

/// ubusd's built-in event object
const SYSTEM_OBJECT_ID: u32 = 1;

fn into_transport_error(error: ProtocolError) -> TransportError {
    match error {
        ProtocolError::Io(e) => TransportError::Io(e),
        other => TransportError::Connect(other.to_string()),
    }
}

fn into_client_error(error: ProtocolError) -> ClientError {
    match error {
        ProtocolError::Io(e) => ClientError::TransportUnavailable(TransportError::Io(e)),
        other => ClientError::Protocol(other),
    }
}

/// Messages answering one request
struct UbusReply {
    status: UbusStatus,
    data: Vec<UbusMessage>,
}

impl UbusReply {
    fn obj_id(&self) -> Option<u32> {
        self.data.iter().find_map(UbusMessage::obj_id)
    }
}

/// A client connection to ubusd
struct UbusConnection {
    framed: Framed<UnixStream, UbusCodec>,
    seq: u16,
}

impl UbusConnection {
    async fn connect(path: &Path) -> Result<Self, TransportError> {
        tracing::debug!("Trying to connect to ubus socket {:?}", path);
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TransportError::Connect(format!("Failed to connect to {:?}: {}", path, e))
        })?;
        let mut framed = Framed::new(stream, UbusCodec::new());

        // ubusd greets every client with its id
        let client_id = match framed.next().await {
            Some(Ok(hello)) if hello.msg_type == UbusMsgType::Hello => hello.peer,
            Some(Ok(other)) => {
                return Err(TransportError::Connect(format!(
                    "Expected hello from ubusd, got {:?}",
                    other.msg_type
                )))
            }
            Some(Err(e)) => return Err(into_transport_error(e)),
            None => return Err(TransportError::Closed),
        };
        tracing::debug!("Connected to ubus socket {:?} as {:08x}", path, client_id);

        Ok(Self { framed, seq: 0 })
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Send `message` and collect its data messages up to the closing status
    async fn request(&mut self, message: UbusMessage) -> Result<UbusReply, ClientError> {
        let seq = message.seq;
        self.framed.send(message).await.map_err(into_client_error)?;

        let mut data = Vec::new();
        loop {
            let message = match self.framed.next().await {
                Some(message) => message.map_err(into_client_error)?,
                None => return Err(TransportError::Closed.into()),
            };
            if message.seq != seq {
                tracing::debug!(
                    "Skipping {:?} for earlier request {}",
                    message.msg_type,
                    message.seq
                );
                continue;
            }
            match message.msg_type {
                UbusMsgType::Data => data.push(message),
                UbusMsgType::Status => {
                    return Ok(UbusReply {
                        status: message.status().unwrap_or(UbusStatus::UnknownError),
                        data,
                    })
                }
                other => tracing::debug!("Ignoring {:?} while waiting for a reply", other),
            }
        }
    }

    async fn close(mut self) -> Result<(), TransportError> {
        self.framed.close().await.map_err(into_transport_error)
    }
}

/// Sends requests to foris-controller through ubusd
pub struct UbusSender {
    connection: UbusConnection,
    default_timeout: Duration,
    /// Controller object id, looked up on first use
    object_id: Option<u32>,
}

impl UbusSender {
    /// Connect to ubusd.
    ///
    /// `default_timeout` applies to requests sent without an explicit one;
    /// zero waits forever.
    pub async fn connect(path: &Path, default_timeout: Duration) -> Result<Self, TransportError> {
        let connection = UbusConnection::connect(path).await?;
        Ok(Self {
            connection,
            default_timeout,
            object_id: None,
        })
    }

    async fn lookup(&mut self) -> Result<u32, ClientError> {
        if let Some(object_id) = self.object_id {
            return Ok(object_id);
        }

        let seq = self.connection.next_seq();
        let lookup = UbusMessage::new(UbusMsgType::Lookup, seq, 0)
            .with(UbusAttr::ObjPath(CONTROLLER_OBJECT.to_string()));
        let reply = self.connection.request(lookup).await?;

        match (reply.status, reply.obj_id()) {
            (UbusStatus::Ok, Some(object_id)) => {
                tracing::debug!("Found {} as object {:08x}", CONTROLLER_OBJECT, object_id);
                self.object_id = Some(object_id);
                Ok(object_id)
            }
            (status, _) => {
                tracing::debug!("Lookup of {} failed: {}", CONTROLLER_OBJECT, status);
                Err(ClientError::ControllerMissing {
                    controller_id: default_controller_id(),
                })
            }
        }
    }

    async fn invoke(&mut self, args: Map<String, Value>) -> Result<UbusReply, ClientError> {
        let object_id = self.lookup().await?;
        let seq = self.connection.next_seq();
        let invoke = UbusMessage::new(UbusMsgType::Invoke, seq, object_id)
            .with(UbusAttr::ObjId(object_id))
            .with(UbusAttr::Method(SEND_METHOD.to_string()))
            .with(UbusAttr::Data(args));
        self.connection.request(invoke).await
    }

    /// Send one request and wait for its reply payload.
    ///
    /// A reply without data yields an empty object. The connection stays
    /// usable after a timeout.
    pub async fn send(
        &mut self,
        module: &str,
        action: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let timeout = timeout.unwrap_or(self.default_timeout);

        let request = StreamRequest::new(module, action, data);
        let mut args = Map::new();
        args.insert(
            "message".to_string(),
            serde_json::to_value(&request).map_err(ProtocolError::from)?,
        );
        tracing::debug!("Sending message {}/{}", module, action);

        let reply = if timeout.is_zero() {
            self.invoke(args).await?
        } else {
            match tokio::time::timeout(timeout, self.invoke(args)).await {
                Ok(reply) => reply?,
                Err(_) => {
                    return Err(ClientError::RequestTimeout {
                        module: module.to_string(),
                        action: action.to_string(),
                        timeout,
                    })
                }
            }
        };

        match reply.status {
            UbusStatus::Ok => {}
            UbusStatus::NotFound => {
                // Controller went away since the lookup
                self.object_id = None;
                return Err(ClientError::ControllerMissing {
                    controller_id: default_controller_id(),
                });
            }
            status => {
                return Err(ControllerError::new(
                    module,
                    action,
                    vec![ControllerFault::new(format!("ubus call failed: {}", status))],
                )
                .into())
            }
        }

        let table = reply
            .data
            .iter()
            .find_map(UbusMessage::data)
            .cloned()
            .unwrap_or_default();
        tracing::debug!("Reply received ({} fields)", table.len());

        let envelope: ReplyEnvelope =
            serde_json::from_value(Value::Object(table)).map_err(ProtocolError::from)?;
        match envelope.into_outcome() {
            Ok(data) => Ok(data.unwrap_or_else(|| Value::Object(Default::default()))),
            Err(errors) => Err(ControllerError::new(module, action, errors).into()),
        }
    }

    /// Close the connection
    pub async fn disconnect(self) -> Result<(), TransportError> {
        tracing::debug!("Closing ubus connection");
        self.connection.close().await
    }
}

/// Receives foris-controller events from ubusd
pub struct UbusListener {
    connection: UbusConnection,
    object_id: u32,
}

impl UbusListener {
    /// Connect to ubusd and register for controller events
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let mut connection = UbusConnection::connect(path).await?;

        let seq = connection.next_seq();
        let reply = connection
            .request(UbusMessage::new(UbusMsgType::AddObject, seq, 0))
            .await?;
        let object_id = match (reply.status, reply.obj_id()) {
            (UbusStatus::Ok, Some(object_id)) => object_id,
            (status, _) => {
                return Err(TransportError::Subscribe(format!(
                    "Failed to add event object: {}",
                    status
                ))
                .into())
            }
        };

        let mut args = Map::new();
        // ubusd reads the object id as a 32-bit field
        args.insert("object".to_string(), json!(object_id as i32));
        args.insert("pattern".to_string(), json!(EVENT_PATTERN));
        let seq = connection.next_seq();
        let register = UbusMessage::new(UbusMsgType::Invoke, seq, SYSTEM_OBJECT_ID)
            .with(UbusAttr::ObjId(SYSTEM_OBJECT_ID))
            .with(UbusAttr::Method("register".to_string()))
            .with(UbusAttr::Data(args));
        let reply = connection.request(register).await?;
        if reply.status != UbusStatus::Ok {
            return Err(TransportError::Subscribe(format!(
                "Failed to register for {} events: {}",
                EVENT_PATTERN, reply.status
            ))
            .into());
        }
        tracing::info!("Listening for ubus events {:?}", EVENT_PATTERN);

        Ok(Self {
            connection,
            object_id,
        })
    }

    /// Deliver notifications to `handler` until `timeout` elapses (zero
    /// listens forever).
    ///
    /// Events that are not notifications, or are for another module when
    /// `module` is set, are acknowledged and dropped. ubusd closing the
    /// connection ends listening with an error.
    pub async fn listen<F>(
        &mut self,
        module: Option<&str>,
        timeout: Duration,
        mut handler: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&Notification),
    {
        let deadline = async {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!("Listening stopped");
                    return Ok(());
                }

                received = self.connection.framed.next() => {
                    let message = match received {
                        Some(message) => message.map_err(into_client_error)?,
                        None => return Err(TransportError::Closed.into()),
                    };
                    if let Some(notification) = self.accept_event(message).await? {
                        if module.map_or(true, |m| m == notification.module) {
                            handler(&notification);
                        }
                    }
                }
            }
        }
    }

    /// Acknowledge an event invoke and extract its notification
    async fn accept_event(
        &mut self,
        message: UbusMessage,
    ) -> Result<Option<Notification>, ClientError> {
        if message.msg_type != UbusMsgType::Invoke || message.obj_id() != Some(self.object_id) {
            tracing::debug!("Ignoring {:?} from ubusd", message.msg_type);
            return Ok(None);
        }

        if !message.no_reply() {
            let ack = UbusMessage::new(UbusMsgType::Status, message.seq, message.peer)
                .with(UbusAttr::Status(UbusStatus::Ok))
                .with(UbusAttr::ObjId(self.object_id));
            self.connection
                .framed
                .send(ack)
                .await
                .map_err(into_client_error)?;
        }

        let event = message.method().unwrap_or_default();
        let table = message.data().cloned().unwrap_or_default();
        match serde_json::from_value::<Notification>(Value::Object(table)) {
            Ok(notification) if is_notification(&notification) => Ok(Some(notification)),
            Ok(other) => {
                tracing::warn!("Ignoring {} event of kind {:?}", event, other.kind);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Malformed {} event: {}", event, e);
                Ok(None)
            }
        }
    }

    /// Close the connection
    pub async fn disconnect(self) -> Result<(), TransportError> {
        self.connection.close().await
    }
}
