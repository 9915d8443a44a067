//! Google OAuth 2.0 for installed applications.
//!
//! - [`OAuthClient`] implements [`TokenEndpoint`](crate::TokenEndpoint)
//!   against Google's authorization and token endpoints, with PKCE and
//!   offline access so a refresh token is always issued.
//! - [`LoopbackSurface`] implements [`GrantSurface`](crate::GrantSurface) by
//!   opening the consent page in the user's browser and capturing the
//!   redirect on a `127.0.0.1` listener.

mod config;
mod loopback;
mod oauth;

pub use config::{DEFAULT_SCOPES, GoogleConfig, OAuthCredentials};
pub use loopback::LoopbackSurface;
pub use oauth::OAuthClient;
