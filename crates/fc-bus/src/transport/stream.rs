//! Unix-socket stream transport
//!
//! One request at a time per connection: the client writes a length-prefixed
//! [`StreamRequest`] and the very next frame on the socket is its reply, so
//! no correlation is needed. Notifications flow the other way: the
//! controller connects to a socket the listener has bound and writes
//! notification frames to it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use fc_core::{ClientError, ControllerError, TransportError};
use fc_protocol::{FrameCodec, Notification, ProtocolError, ReplyEnvelope, StreamRequest};

fn into_client_error(error: ProtocolError) -> ClientError {
    match error {
        ProtocolError::Io(e) => ClientError::TransportUnavailable(TransportError::Io(e)),
        other => ClientError::Protocol(other),
    }
}

/// Sends requests to a controller over its unix socket
pub struct StreamSender {
    framed: Framed<UnixStream, FrameCodec>,
    default_timeout: Duration,
    /// Set once a reply was abandoned; its frame may still arrive and would
    /// be mistaken for the reply to the next request.
    desynced: bool,
}

impl StreamSender {
    /// Connect to the controller socket.
    ///
    /// `default_timeout` applies to requests sent without an explicit one;
    /// zero waits forever.
    pub async fn connect(path: &Path, default_timeout: Duration) -> Result<Self, TransportError> {
        tracing::debug!("Trying to connect to {:?}", path);
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TransportError::Connect(format!("Failed to connect to {:?}: {}", path, e))
        })?;
        tracing::debug!(
            "Connected to {:?} (default timeout {:?})",
            path,
            default_timeout
        );

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            default_timeout,
            desynced: false,
        })
    }

    /// Send one request and wait for its reply payload.
    ///
    /// A reply without data yields an empty object. A timeout leaves the
    /// connection unusable for further requests.
    pub async fn send(
        &mut self,
        module: &str,
        action: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        if self.desynced {
            return Err(TransportError::Closed.into());
        }
        let timeout = timeout.unwrap_or(self.default_timeout);

        let request = StreamRequest::new(module, action, data);
        let raw = Bytes::from(serde_json::to_vec(&request).map_err(ProtocolError::from)?);
        tracing::debug!("Sending message (len={})", raw.len());
        self.framed.send(raw).await.map_err(into_client_error)?;

        let received = if timeout.is_zero() {
            self.framed.next().await
        } else {
            match tokio::time::timeout(timeout, self.framed.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    self.desynced = true;
                    return Err(ClientError::RequestTimeout {
                        module: module.to_string(),
                        action: action.to_string(),
                        timeout,
                    });
                }
            }
        };

        let frame = match received {
            Some(frame) => frame.map_err(into_client_error)?,
            None => return Err(TransportError::Closed.into()),
        };
        tracing::debug!("Reply received (len={})", frame.len());

        let reply: ReplyEnvelope = serde_json::from_slice(&frame).map_err(ProtocolError::from)?;
        match reply.into_outcome() {
            Ok(data) => Ok(data.unwrap_or_else(|| Value::Object(Default::default()))),
            Err(errors) => Err(ControllerError::new(module, action, errors).into()),
        }
    }

    /// Close the connection
    pub async fn disconnect(mut self) -> Result<(), TransportError> {
        tracing::debug!("Closing connection");
        self.framed.close().await.map_err(|e| match e {
            ProtocolError::Io(e) => TransportError::Io(e),
            other => TransportError::Publish(other.to_string()),
        })
    }
}

/// Receives notifications written by controllers to a bound socket
pub struct StreamListener {
    listener: UnixListener,
    path: PathBuf,
}

impl StreamListener {
    /// Bind `path`, replacing a stale socket file left by an earlier run
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed stale socket {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransportError::Io(e)),
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!("Listening for notifications on {:?}", path);

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Socket path this listener is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deliver notifications to `handler` until `timeout` elapses (zero
    /// listens forever).
    ///
    /// Any number of controllers may be connected at once; their frames are
    /// handed to `handler` one at a time. Frames that are not notifications,
    /// or are for another module when `module` is set, are dropped.
    pub async fn listen<F>(
        &self,
        module: Option<&str>,
        timeout: Duration,
        mut handler: F,
    ) -> Result<(), TransportError>
    where
        F: FnMut(&Notification),
    {
        let (tx, mut rx) = mpsc::channel::<Notification>(64);
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

                Some(notification) = rx.recv() => {
                    if module.map_or(true, |m| m == notification.module) {
                        handler(&notification);
                    }
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            tracing::debug!("Controller connected");
                            tokio::spawn(read_notifications(stream, tx.clone()));
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub(super) fn is_notification(notification: &Notification) -> bool {
    notification.kind.as_deref().unwrap_or("notification") == "notification"
}

async fn read_notifications(stream: UnixStream, tx: mpsc::Sender<Notification>) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping controller connection: {}", e);
                return;
            }
        };

        match serde_json::from_slice::<Notification>(&frame) {
            Ok(notification) if is_notification(&notification) => {
                if tx.send(notification).await.is_err() {
                    return;
                }
            }
            Ok(other) => {
                tracing::warn!("Ignoring message of kind {:?}", other.kind);
            }
            Err(e) => {
                tracing::warn!("Malformed notification frame: {}", e);
            }
        }
    }
    tracing::debug!("Controller disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_protocol::ControllerFault;
    use serde_json::json;

    /// Answer each request on `path` with the reply built by `reply`
    async fn serve<F>(listener: UnixListener, reply: F)
    where
        F: Fn(StreamRequest) -> Option<ReplyEnvelope> + Send + 'static,
    {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        while let Some(Ok(frame)) = framed.next().await {
            let request: StreamRequest = serde_json::from_slice(&frame).unwrap();
            if let Some(envelope) = reply(request) {
                let raw = serde_json::to_vec(&envelope).unwrap();
                framed.send(Bytes::from(raw)).await.unwrap();
            }
        }
    }

    fn socket_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.soc");
        (dir, path)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (_dir, path) = socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, |request| {
            assert_eq!(request.kind, "request");
            Some(ReplyEnvelope::success(Some(
                json!({"module": request.module, "echo": request.data}),
            )))
        }));

        let mut sender = StreamSender::connect(&path, Duration::ZERO).await.unwrap();
        let reply = sender
            .send("echo", "echo", Some(json!({"x": 1})), None)
            .await
            .unwrap();
        assert_eq!(reply, json!({"module": "echo", "echo": {"x": 1}}));

        // Several requests reuse one connection
        let reply = sender.send("about", "get", None, None).await.unwrap();
        assert_eq!(reply, json!({"module": "about", "echo": null}));
        sender.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_data_is_empty_object() {
        let (_dir, path) = socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, |_| Some(ReplyEnvelope::success(None))));

        let mut sender = StreamSender::connect(&path, Duration::ZERO).await.unwrap();
        let reply = sender.send("about", "get", None, None).await.unwrap();
        assert_eq!(reply, json!({}));
    }

    #[tokio::test]
    async fn test_errors_raise_controller_error() {
        let (_dir, path) = socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, |_| {
            Some(ReplyEnvelope::failure(vec![ControllerFault::new(
                "Incorrect input",
            )]))
        }));

        let mut sender = StreamSender::connect(&path, Duration::ZERO).await.unwrap();
        match sender.send("web", "set_language", None, None).await {
            Err(ClientError::Controller(e)) => {
                assert_eq!(e.module, "web");
                assert_eq!(e.action, "set_language");
                assert_eq!(e.errors[0].description, "Incorrect input");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_desyncs_connection() {
        let (_dir, path) = socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, |_| None));

        let mut sender = StreamSender::connect(&path, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(
            sender.send("about", "get", None, None).await,
            Err(ClientError::RequestTimeout { .. })
        ));
        assert!(matches!(
            sender.send("about", "get", None, None).await,
            Err(ClientError::TransportUnavailable(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket() {
        let (_dir, path) = socket_path();
        assert!(matches!(
            StreamSender::connect(&path, Duration::ZERO).await,
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_filters_module() {
        let (_dir, path) = socket_path();
        std::fs::write(&path, b"stale").unwrap();
        let listener = StreamListener::bind(&path).unwrap();

        let controller_path = path.clone();
        tokio::spawn(async move {
            let stream = UnixStream::connect(&controller_path).await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            for (module, action) in [("web", "set_language"), ("wan", "update"), ("web", "reboot")] {
                let notification = json!({
                    "kind": "notification",
                    "module": module,
                    "action": action,
                    "data": {"value": 1},
                });
                let raw = serde_json::to_vec(&notification).unwrap();
                framed.send(Bytes::from(raw)).await.unwrap();
            }
            framed.send(Bytes::from_static(b"not json")).await.unwrap();
            // Keep the connection open until the listener stops
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut received = Vec::new();
        listener
            .listen(Some("web"), Duration::from_millis(500), |n| {
                received.push(n.action.clone())
            })
            .await
            .unwrap();

        assert_eq!(received, vec!["set_language", "reboot"]);
    }

    #[tokio::test]
    async fn test_listener_removes_socket_on_drop() {
        let (_dir, path) = socket_path();
        let listener = StreamListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
