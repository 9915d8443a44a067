//! Daemon socket configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Unix socket server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,

    /// Idle timeout for reading the next request on a connection.
    /// Subscribed connections are exempt.
    pub connection_timeout: Duration,

    pub max_connections: usize,

    /// Remove a socket file left behind by a dead daemon.
    pub cleanup_stale_socket: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connection_timeout: Duration::from_secs(30),
            max_connections: 64,
            cleanup_stale_socket: true,
        }
    }
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }
}

/// `$XDG_RUNTIME_DIR/docrelay.sock`, or `/tmp/docrelay-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    runtime_path("sock")
}

pub(crate) fn runtime_path(extension: &str) -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join(format!("docrelay.{extension}")),
        None => PathBuf::from(format!("/tmp/docrelay-{}.{extension}", current_uid())),
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let config = ServerConfig::new("/run/user/1000/custom.sock")
            .with_connection_timeout(Duration::from_secs(60))
            .with_max_connections(0)
            .with_cleanup_stale_socket(false);

        assert_eq!(config.socket_path, PathBuf::from("/run/user/1000/custom.sock"));
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
        assert_eq!(config.max_connections, 1);
        assert!(!config.cleanup_stale_socket);
    }

    #[test]
    fn default_socket_name() {
        let path = default_socket_path();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("docrelay"));
        assert!(name.ends_with(".sock"));
    }
}
