//! Server error types.

use std::io;

use docrelay_core::ActionStatus;
use docrelay_protocol::{ErrorCode, ErrorResponse};
use docrelay_providers::ProviderError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] docrelay_protocol::ProtocolError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("socket path already in use: {path}")]
    SocketInUse { path: String },

    #[error("socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    #[error("daemon is already running (PID file exists: {path})")]
    AlreadyRunning { path: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    /// The action table could not be read or written.
    #[error("action store error: {message}")]
    ActionStore { message: String },

    /// The payload was rejected by the executor when scheduling.
    #[error("invalid action: {message}")]
    InvalidAction { message: String },

    #[error("no action with id {id}")]
    ActionNotFound { id: String },

    /// Cancel on a record that is already being executed or is terminal.
    #[error("action {id} is {status}, not pending")]
    ActionNotPending { id: String, status: ActionStatus },

    #[error("daemon shutdown requested")]
    Shutdown,
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn action_store(message: impl Into<String>) -> Self {
        Self::ActionStore {
            message: message.into(),
        }
    }

    pub fn invalid_action(message: impl Into<String>) -> Self {
        Self::InvalidAction {
            message: message.into(),
        }
    }

    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }

    pub fn already_running(path: impl Into<String>) -> Self {
        Self::AlreadyRunning { path: path.into() }
    }

    /// Converts the error into a wire error.
    pub fn to_error_response(&self) -> ErrorResponse {
        let code = match self {
            Self::InvalidAction { .. } => ErrorCode::InvalidRequest,
            Self::ActionNotFound { .. } => ErrorCode::NotFound,
            Self::ActionNotPending { .. } => ErrorCode::Conflict,
            Self::Shutdown => ErrorCode::ShuttingDown,
            _ => ErrorCode::InternalError,
        };
        ErrorResponse::new(code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        let err = ServerError::ActionNotPending {
            id: "a1".into(),
            status: ActionStatus::Fired,
        };
        let response = err.to_error_response();
        assert_eq!(response.code, ErrorCode::Conflict);
        assert_eq!(response.message, "action a1 is fired, not pending");

        let err = ServerError::ActionNotFound { id: "zz".into() };
        assert_eq!(err.to_error_response().code, ErrorCode::NotFound);

        let err = ServerError::invalid_action("missing url");
        assert_eq!(err.to_error_response().code, ErrorCode::InvalidRequest);

        let err = ServerError::action_store("disk full");
        assert_eq!(err.to_error_response().code, ErrorCode::InternalError);
    }
}
