//! Error types for provider and credential operations.

use std::fmt;

use docrelay_core::AuthFailure;
use thiserror::Error;

/// Category of a provider error, used for retry decisions and for mapping
/// onto [`AuthFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorCode {
    /// Credentials are invalid, expired or were rejected (401, `invalid_grant`).
    AuthenticationFailed,
    /// Caller lacks permission (403).
    AuthorizationFailed,
    /// Connection failure, timeout, DNS.
    NetworkError,
    /// Too many requests (429).
    RateLimited,
    /// Provider returned 5xx.
    ServerError,
    /// Response body could not be parsed.
    InvalidResponse,
    /// Request rejected as malformed (400 other than a grant rejection).
    BadRequest,
    /// Missing or invalid configuration.
    ConfigurationError,
    /// Credential persistence failed.
    StorageError,
    /// Unexpected internal state.
    InternalError,
}

impl ProviderErrorCode {
    /// Returns true if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RateLimited | Self::ServerError
        )
    }

    /// Returns a snake_case name for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::NetworkError => "network_error",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::InvalidResponse => "invalid_response",
            Self::BadRequest => "bad_request",
            Self::ConfigurationError => "configuration_error",
            Self::StorageError => "storage_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised while talking to the identity provider or persisting the
/// credential.
#[derive(Debug, Error)]
pub struct ProviderError {
    code: ProviderErrorCode,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthenticationFailed, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthorizationFailed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NetworkError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::RateLimited, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ServerError, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidResponse, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::BadRequest, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ConfigurationError, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::StorageError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InternalError, message)
    }

    /// Attaches the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error code.
    pub fn code(&self) -> ProviderErrorCode {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error is transient and may be retried.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Classifies a failed refresh exchange.
    ///
    /// Transient failures leave the credential in place; everything else
    /// means the refresh token is no longer usable.
    pub fn as_refresh_failure(&self) -> AuthFailure {
        if self.is_retryable() {
            AuthFailure::ProviderUnavailable(self.message.clone())
        } else {
            AuthFailure::RefreshRejected(self.message.clone())
        }
    }

    /// Classifies a failed grant-code exchange.
    pub fn as_grant_failure(&self) -> AuthFailure {
        AuthFailure::GrantExchangeFailed(self.message.clone())
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Maps a reqwest transport error onto a provider error.
pub(crate) fn from_transport(context: &str, e: reqwest::Error) -> ProviderError {
    let message = if e.is_timeout() {
        format!("{context}: request timed out")
    } else if e.is_connect() {
        format!("{context}: connection failed: {e}")
    } else {
        format!("{context}: {e}")
    };
    ProviderError::network(message).with_source(e)
}
