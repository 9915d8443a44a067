//! Credential lifecycle and provider plumbing for docrelay.
//!
//! - [`CredentialStore`]: durable file-backed persistence of the credential
//! - [`CredentialRefresher`]: hands out valid access tokens, refreshing them
//!   proactively and serializing refresh exchanges
//! - [`TokenEndpoint`]: provider token exchange (grant code and refresh)
//! - [`GrantSurface`]: the user-visible surface the consent page opens in
//! - [`AuthorizedClient`]: bearer-token HTTP wrapper with 401 detection
//! - [`google`]: Google OAuth 2.0 (PKCE) endpoint and loopback surface

pub mod authorized;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod google;
pub mod pkce;
pub mod refresher;
pub mod surface;

pub use authorized::{AuthorizedClient, AuthorizedRequest, AuthorizedResponse};
pub use credentials::CredentialStore;
pub use endpoint::{BoxFuture, TokenEndpoint, TokenGrant};
pub use error::{ProviderError, ProviderErrorCode, ProviderResult};
pub use pkce::PkceFlow;
pub use refresher::{CredentialRefresher, InvalidationHook, TokenResolution};
pub use surface::{GrantSurface, SurfaceEvent, SurfaceHandle, SurfaceOutcome, UrlBuilder};
