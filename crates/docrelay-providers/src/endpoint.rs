//! Provider token endpoint abstraction.

use std::future::Future;
use std::pin::Pin;

use docrelay_core::Credential;

use crate::error::ProviderResult;
use crate::pkce::PkceFlow;

/// A boxed future, used to keep the provider traits object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Successful response of a grant-code or refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present on code exchanges and when the provider rotates it.
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    pub expires_in: Option<i64>,
    /// Space-separated scopes echoed by the provider, split.
    pub scopes: Option<Vec<String>>,
}

impl TokenGrant {
    /// Creates a grant with just an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in: None,
            scopes: None,
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_expires_in(mut self, secs: i64) -> Self {
        self.expires_in = Some(secs);
        self
    }

    /// Builds the credential stored after a grant-code exchange.
    ///
    /// `requested` is used when the provider does not echo the granted scopes.
    pub fn into_credential(self, requested: &[String]) -> Credential {
        let scopes = self.scopes.unwrap_or_else(|| requested.to_vec());
        Credential::new(self.access_token, self.refresh_token, self.expires_in, scopes)
    }
}

/// The identity provider's authorization and token endpoints.
pub trait TokenEndpoint: Send + Sync {
    /// Scopes requested on authorization.
    fn scopes(&self) -> &[String];

    /// Builds the consent URL for one authorization attempt.
    fn authorization_url(&self, pkce: &PkceFlow, redirect_uri: &str) -> String;

    /// Exchanges a grant code for a credential.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, ProviderResult<TokenGrant>>;

    /// Exchanges a refresh token for a new access token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ProviderResult<TokenGrant>>;
}
