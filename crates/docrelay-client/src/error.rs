//! Client error types.

use docrelay_core::TracingError;
use docrelay_protocol::{ErrorResponse, ProtocolError};
use docrelay_providers::ProviderError;
use docrelay_server::ServerError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("daemon error: {0}")]
    Server(#[from] ServerError),

    #[error("logging setup failed: {0}")]
    Tracing(#[from] TracingError),

    /// The daemon could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// The daemon answered with an error response.
    #[error("{0}")]
    Rejected(ErrorResponse),

    /// The daemon answered with something the command did not ask for.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The authorization flow finished without a credential.
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    pub fn unexpected(response: &impl std::fmt::Debug) -> Self {
        Self::UnexpectedResponse(format!("{response:?}"))
    }
}
