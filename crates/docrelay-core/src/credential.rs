//! Delegated-authorization credential.
//!
//! A [`Credential`] is the access/refresh token pair handed out by the
//! identity provider, together with the absolute expiry of the access token.
//! The persisted JSON layout uses fixed camelCase keys (`accessToken`,
//! `refreshToken`, `expiry`, `lastUpdated`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::AuthFailure;

/// Safety margin subtracted from the expiry before a token is considered stale.
pub const REFRESH_SKEW: Duration = Duration::minutes(5);

/// The access/refresh token pair plus expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Bearer token attached to every authorized call.
    pub access_token: String,

    /// Token used to obtain a fresh access token without user interaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiry of the access token. Absent means already expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    /// When this credential was last written.
    pub last_updated: DateTime<Utc>,

    /// Scopes granted by the provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl Credential {
    /// Creates a credential from a token endpoint response.
    ///
    /// `expires_in_secs` is relative to now, as returned by OAuth token
    /// endpoints.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
        scopes: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            access_token: access_token.into(),
            refresh_token,
            expiry: expires_in_secs.map(|secs| now + Duration::seconds(secs)),
            last_updated: now,
            scopes,
        }
    }

    /// Builder: set an absolute expiry.
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Returns false when the access token is empty.
    ///
    /// A credential without an access token is treated exactly like no
    /// credential at all.
    pub fn is_usable(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Returns true if the access token must be refreshed before use at `now`.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry - now < REFRESH_SKEW,
            None => true,
        }
    }

    /// Returns true if the access token must be refreshed before use.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Utc::now())
    }

    /// Returns the access token if it can be attached to a call right now.
    ///
    /// An empty token is [`AuthFailure::NoCredential`]; one inside the
    /// refresh skew is [`AuthFailure::ExpiredCredential`].
    pub fn fresh_access_token(&self) -> Result<&str, AuthFailure> {
        if !self.is_usable() {
            Err(AuthFailure::NoCredential)
        } else if self.needs_refresh() {
            Err(AuthFailure::ExpiredCredential)
        } else {
            Ok(&self.access_token)
        }
    }

    /// Returns true if a refresh token is available.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Builds the successor credential after a refresh exchange.
    ///
    /// Providers may omit the refresh token from refresh responses; in that
    /// case the current one is carried over. Scopes are preserved.
    pub fn refreshed(
        &self,
        access_token: impl Into<String>,
        rotated_refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
    ) -> Self {
        Self::new(
            access_token,
            rotated_refresh_token.or_else(|| self.refresh_token.clone()),
            expires_in_secs,
            self.scopes.clone(),
        )
    }

    /// Returns the time until expiry, if known.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expiry.map(|expiry| expiry - Utc::now())
    }
}
