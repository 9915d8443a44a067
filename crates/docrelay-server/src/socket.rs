//! Unix socket listener for IPC.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use docrelay_protocol::{
    Envelope, FrameReader, FrameWriter, Notification, PROTOCOL_VERSION, ProtocolError, Request,
    Response,
};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Accepts UI connections on the daemon socket.
pub struct SocketServer {
    config: ServerConfig,
    listener: UnixListener,
    connection_semaphore: Arc<Semaphore>,
}

impl SocketServer {
    /// Binds the socket.
    ///
    /// A leftover socket file nobody listens on is removed when
    /// `cleanup_stale_socket` is set. The socket is only accessible to the
    /// owning user.
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(parent.to_string_lossy()));
        }

        if socket_path.exists() {
            if !config.cleanup_stale_socket {
                return Err(ServerError::socket_in_use(socket_path.to_string_lossy()));
            }
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ServerError::socket_in_use(socket_path.to_string_lossy()));
            }
            info!(path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        restrict_permissions(socket_path)?;
        info!(path = %socket_path.display(), "Socket server listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accepts a single connection, waiting for a free slot first.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;

        let (stream, _addr) = self.listener.accept().await?;
        debug!("Accepted connection");
        Ok(Connection::new(
            stream,
            self.config.connection_timeout,
            permit,
        ))
    }

    /// Runs the accept loop, spawning `handler` for each connection.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(connection) => {
                    tokio::spawn(handler(connection));
                }
                Err(ServerError::Shutdown) => return Ok(()),
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let path = &self.config.socket_path;
        if !path.exists() {
            return;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed socket file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> ServerResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> ServerResult<()> {
    Ok(())
}

/// One UI connection.
pub struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    fn new(stream: UnixStream, timeout: Duration, permit: OwnedSemaphorePermit) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            timeout,
            _permit: permit,
        }
    }

    /// Reads the next request.
    ///
    /// Returns `Ok(None)` if the client closed the connection.
    pub async fn read_request(&mut self) -> ServerResult<Option<Envelope<Request>>> {
        let envelope: Option<Envelope<Request>> =
            tokio::time::timeout(self.timeout, self.reader.read_message())
                .await
                .map_err(|_| ProtocolError::timeout("read request"))??;

        if let Some(envelope) = &envelope
            && !envelope.is_compatible()
        {
            warn!(
                version = %envelope.protocol_version,
                expected = PROTOCOL_VERSION,
                "Incompatible protocol version"
            );
        }
        Ok(envelope)
    }

    pub async fn write_response(&mut self, envelope: &Envelope<Response>) -> ServerResult<()> {
        tokio::time::timeout(self.timeout, self.writer.write_message(envelope))
            .await
            .map_err(|_| ProtocolError::timeout("write response"))??;
        Ok(())
    }

    /// Sends `response` correlated with `request_id`.
    pub async fn respond(
        &mut self,
        request_id: impl Into<String>,
        response: Response,
    ) -> ServerResult<()> {
        self.write_response(&Envelope::response(request_id, response))
            .await
    }

    /// Forwards notifications until the client disconnects or `events` ends.
    ///
    /// Anything the client sends on a subscribed connection ends the stream.
    pub async fn stream_notifications(
        &mut self,
        request_id: &str,
        mut events: mpsc::Receiver<Notification>,
    ) -> ServerResult<()> {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.respond(request_id, Response::notification(event)).await?,
                    None => return Ok(()),
                },
                read = self.reader.read_message::<Envelope<Request>>() => {
                    match read {
                        Ok(None) => debug!("Subscriber disconnected"),
                        Ok(Some(envelope)) => debug!(
                            request = envelope.payload.kind(),
                            "Closing subscription on client request"
                        ),
                        Err(e) => debug!(error = %e, "Subscriber connection failed"),
                    }
                    return Ok(());
                }
            }
        }
    }
}
