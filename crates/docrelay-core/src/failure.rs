//! Failure taxonomy for the credential lifecycle and deferred actions.

use thiserror::Error;

/// Why an authorized operation could not proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// The user never authenticated (or the credential was erased).
    #[error("not authenticated")]
    NoCredential,

    /// The access token expired; a refresh may recover it.
    #[error("credential expired")]
    ExpiredCredential,

    /// The provider invalidated the refresh token; re-authorization required.
    #[error("refresh rejected: {0}")]
    RefreshRejected(String),

    /// The grant code could not be exchanged; the user must sign in again.
    #[error("grant exchange failed: {0}")]
    GrantExchangeFailed(String),

    /// Transient network or server failure; safe to retry later.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The downstream executor failed when a scheduled action fired.
    #[error("scheduled action failed: {0}")]
    ScheduledActionFailed(String),
}

impl AuthFailure {
    /// Returns true if handling this failure erases the stored credential.
    pub fn clears_credential(&self) -> bool {
        matches!(self, Self::RefreshRejected(_))
    }
}
