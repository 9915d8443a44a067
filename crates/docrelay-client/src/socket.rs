//! Unix socket client for the docrelay daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use docrelay_protocol::{
    Envelope, EventKind, FrameReader, FrameWriter, Notification, ProtocolError, Request, Response,
};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ClientError, ClientResult};

/// Client for the daemon socket. Each request uses its own connection.
#[derive(Debug, Clone)]
pub struct SocketClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Creates a client for the default socket path.
    pub fn with_defaults() -> Self {
        Self::new(
            docrelay_server::default_socket_path(),
            Duration::from_secs(35),
        )
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Checks if the daemon socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    async fn connect(&self) -> ClientResult<Channel> {
        debug!(socket = %self.socket_path.display(), "Connecting to daemon");

        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "connection timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                ClientError::Connection(format!(
                    "failed to connect to {}: {} (is `docrelay server` running?)",
                    self.socket_path.display(),
                    e
                ))
            })?;

        let (read, write) = stream.into_split();
        Ok(Channel {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            timeout: self.timeout,
        })
    }

    /// Sends a request and returns whatever the daemon answered.
    pub async fn send(&self, request: Request) -> ClientResult<Response> {
        let request_id = Uuid::new_v4().to_string();
        let mut channel = self.connect().await?;
        channel.send(&request_id, request).await?;
        channel.receive(&request_id, "reading response").await
    }

    /// Like [`send`](Self::send), but turns an error response into
    /// [`ClientError::Rejected`].
    pub async fn request(&self, request: Request) -> ClientResult<Response> {
        match self.send(request).await? {
            Response::Error { error } => Err(ClientError::Rejected(error)),
            response => Ok(response),
        }
    }

    /// Pings the daemon.
    pub async fn ping(&self) -> ClientResult<bool> {
        match self.send(Request::Ping).await {
            Ok(Response::Pong) => Ok(true),
            Ok(_) | Err(_) => Ok(false),
        }
    }

    /// Opens a notification stream. Empty `events` means all kinds.
    ///
    /// Returns once the daemon has acknowledged the subscription, so nothing
    /// published afterwards is missed.
    pub async fn subscribe(&self, events: Vec<EventKind>) -> ClientResult<NotificationStream> {
        let request_id = Uuid::new_v4().to_string();
        let mut channel = self.connect().await?;
        channel
            .send(&request_id, Request::subscribe(events))
            .await?;

        match channel.receive(&request_id, "subscribing").await? {
            Response::Subscribed => Ok(NotificationStream {
                channel,
                request_id,
            }),
            Response::Error { error } => Err(ClientError::Rejected(error)),
            other => Err(ClientError::unexpected(&other)),
        }
    }
}

struct Channel {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    timeout: Duration,
}

impl Channel {
    async fn send(&mut self, request_id: &str, request: Request) -> ClientResult<()> {
        let envelope = Envelope::request(request_id, request);
        tokio::time::timeout(self.timeout, self.writer.write_message(&envelope))
            .await
            .map_err(|_| ClientError::Timeout("sending request".into()))??;
        debug!(request_id, "Request sent");
        Ok(())
    }

    async fn receive(&mut self, request_id: &str, operation: &str) -> ClientResult<Response> {
        let envelope = tokio::time::timeout(self.timeout, self.read())
            .await
            .map_err(|_| ClientError::Timeout(operation.to_string()))??;
        Self::check_correlation(request_id, &envelope);
        Ok(envelope.payload)
    }

    async fn read(&mut self) -> ClientResult<Envelope<Response>> {
        self.reader
            .read_message()
            .await?
            .ok_or(ClientError::Protocol(ProtocolError::ConnectionClosed))
    }

    fn check_correlation(request_id: &str, envelope: &Envelope<Response>) {
        if envelope.request_id != request_id {
            warn!(
                expected = %request_id,
                received = %envelope.request_id,
                "Response request_id mismatch"
            );
        }
    }
}

/// Notifications pushed by the daemon after a subscription.
pub struct NotificationStream {
    channel: Channel,
    request_id: String,
}

impl NotificationStream {
    /// Waits for the next notification.
    ///
    /// Returns `Ok(None)` when the daemon closes the stream.
    pub async fn next(&mut self) -> ClientResult<Option<Notification>> {
        let envelope = match self.channel.reader.read_message::<Envelope<Response>>().await? {
            Some(envelope) => envelope,
            None => return Ok(None),
        };
        Channel::check_correlation(&self.request_id, &envelope);

        match envelope.payload {
            Response::Notification { event } => Ok(Some(event)),
            Response::Error { error } => Err(ClientError::Rejected(error)),
            other => Err(ClientError::unexpected(&other)),
        }
    }

    /// Waits for the next notification for at most `timeout`.
    pub async fn next_within(&mut self, timeout: Duration) -> ClientResult<Option<Notification>> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| ClientError::Timeout("waiting for notification".into()))?
    }
}
