//! Hands out valid access tokens.
//!
//! Tokens are refreshed proactively once they are within
//! [`REFRESH_SKEW`](docrelay_core::REFRESH_SKEW) of expiry. Refresh exchanges
//! are serialized: while one is in flight, other callers wait for it and then
//! pick up the stored result instead of spending the refresh token again.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::endpoint::TokenEndpoint;
use crate::error::ProviderResult;

/// Called with a reason whenever the stored credential is dropped.
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of asking for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenResolution {
    /// A token that stays valid for at least the refresh skew.
    Valid(String),
    /// Nothing is stored.
    NotAuthenticated,
    /// The credential could not be renewed and was cleared.
    Revoked(String),
    /// The provider could not be reached; the credential was kept.
    Unavailable(String),
}

impl TokenResolution {
    /// Returns the token, if valid.
    pub fn into_token(self) -> Option<String> {
        match self {
            Self::Valid(token) => Some(token),
            _ => None,
        }
    }
}

/// Serializing token refresher over a [`CredentialStore`].
pub struct CredentialRefresher {
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    refresh_lock: Mutex<()>,
    on_invalidated: Option<InvalidationHook>,
}

impl CredentialRefresher {
    pub fn new(store: Arc<CredentialStore>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            store,
            endpoint,
            refresh_lock: Mutex::new(()),
            on_invalidated: None,
        }
    }

    /// Registers a callback for credential invalidation.
    pub fn with_invalidation_hook(mut self, hook: InvalidationHook) -> Self {
        self.on_invalidated = Some(hook);
        self
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Returns a valid access token, or `None` when authorization is needed
    /// or the provider is unreachable.
    ///
    /// Errors only on persistence failures.
    pub async fn valid_token(&self) -> ProviderResult<Option<String>> {
        Ok(self.resolve().await?.into_token())
    }

    /// Like [`valid_token`](Self::valid_token) but says why no token is available.
    pub async fn resolve(&self) -> ProviderResult<TokenResolution> {
        let Some(credential) = self.store.load()? else {
            return Ok(TokenResolution::NotAuthenticated);
        };
        match credential.fresh_access_token() {
            Ok(token) => return Ok(TokenResolution::Valid(token.to_string())),
            Err(failure) => debug!(%failure, "Stored access token needs a refresh"),
        }

        let _guard = self.refresh_lock.lock().await;

        // Read before loading: a logout or a new grant bumps it, and the
        // outcome of this refresh must not be written over either.
        let generation = self.store.generation();

        // Another caller may have refreshed while we waited.
        let Some(credential) = self.store.load()? else {
            return Ok(TokenResolution::NotAuthenticated);
        };
        if let Ok(token) = credential.fresh_access_token() {
            debug!("Credential refreshed by a concurrent caller");
            return Ok(TokenResolution::Valid(token.to_string()));
        }

        let Some(refresh_token) = credential.refresh_token.clone().filter(|t| !t.is_empty())
        else {
            return self.revoke(
                generation,
                "access token expired and no refresh token is stored".to_string(),
            );
        };

        debug!("Refreshing access token");
        match self.endpoint.refresh(&refresh_token).await {
            Ok(grant) => {
                let updated =
                    credential.refreshed(grant.access_token, grant.refresh_token, grant.expires_in);
                if !self.store.save_if_unchanged(generation, &updated)? {
                    info!("Credential changed during refresh, discarding the refreshed token");
                    return self.current();
                }
                info!(
                    expires_in_secs = updated.time_until_expiry().map(|d| d.num_seconds()),
                    "Access token refreshed"
                );
                Ok(TokenResolution::Valid(updated.access_token))
            }
            Err(e) => match e.as_refresh_failure() {
                failure if failure.clears_credential() => {
                    warn!(error = %e, "Token refresh rejected");
                    self.revoke(generation, failure.to_string())
                }
                _ => {
                    warn!(error = %e, "Token refresh failed transiently, keeping credential");
                    Ok(TokenResolution::Unavailable(e.message().to_string()))
                }
            },
        }
    }

    /// What the store holds now, without refreshing.
    fn current(&self) -> ProviderResult<TokenResolution> {
        Ok(match self.store.load()? {
            Some(credential) => match credential.fresh_access_token() {
                Ok(token) => TokenResolution::Valid(token.to_string()),
                Err(_) => TokenResolution::NotAuthenticated,
            },
            None => TokenResolution::NotAuthenticated,
        })
    }

    /// Clears the credential this refresh started from. A credential stored
    /// since then is left alone.
    fn revoke(&self, generation: u64, reason: String) -> ProviderResult<TokenResolution> {
        match self.store.clear_if_unchanged(generation)? {
            Some(removed) => {
                if removed {
                    self.notify_invalidated(&reason);
                }
                Ok(TokenResolution::Revoked(reason))
            }
            None => self.current(),
        }
    }

    /// Drops the stored credential and fires the invalidation hook.
    ///
    /// Returns false if nothing was stored; the hook only fires when a
    /// credential was actually removed. A refresh in flight will not write
    /// its result back.
    pub fn invalidate(&self, reason: &str) -> ProviderResult<bool> {
        let removed = self.store.clear()?;
        if removed {
            self.notify_invalidated(reason);
        }
        Ok(removed)
    }

    fn notify_invalidated(&self, reason: &str) {
        info!(reason, "Credential invalidated");
        if let Some(hook) = &self.on_invalidated {
            hook(reason);
        }
    }
}

impl std::fmt::Debug for CredentialRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRefresher")
            .field("store", &self.store.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};
    use docrelay_core::Credential;
    use tempfile::TempDir;

    use crate::endpoint::{BoxFuture, TokenGrant};
    use crate::error::ProviderError;
    use crate::pkce::PkceFlow;

    /// Token endpoint that replays scripted refresh results and counts calls.
    struct ScriptedEndpoint {
        refreshes: AtomicUsize,
        results: StdMutex<Vec<ProviderResult<TokenGrant>>>,
        delay: StdDuration,
    }

    impl ScriptedEndpoint {
        fn new(results: Vec<ProviderResult<TokenGrant>>) -> Arc<Self> {
            Self::slow(results, StdDuration::from_millis(20))
        }

        fn slow(results: Vec<ProviderResult<TokenGrant>>, delay: StdDuration) -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicUsize::new(0),
                results: StdMutex::new(results),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn scopes(&self) -> &[String] {
            &[]
        }

        fn authorization_url(&self, _pkce: &PkceFlow, redirect_uri: &str) -> String {
            redirect_uri.to_string()
        }

        fn exchange_code<'a>(
            &'a self,
            _code: &'a str,
            _verifier: &'a str,
            _redirect_uri: &'a str,
        ) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
            Box::pin(async { Err(ProviderError::internal("not scripted")) })
        }

        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
            Box::pin(async move {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                let mut results = self.results.lock().unwrap();
                if results.is_empty() {
                    Err(ProviderError::internal("no more scripted results"))
                } else {
                    results.remove(0)
                }
            })
        }
    }

    fn setup(
        credential: Option<Credential>,
        results: Vec<ProviderResult<TokenGrant>>,
    ) -> (TempDir, Arc<ScriptedEndpoint>, CredentialRefresher) {
        setup_with(credential, ScriptedEndpoint::new(results))
    }

    fn setup_with(
        credential: Option<Credential>,
        endpoint: Arc<ScriptedEndpoint>,
    ) -> (TempDir, Arc<ScriptedEndpoint>, CredentialRefresher) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("credential.json")));
        if let Some(credential) = credential {
            store.save(&credential).unwrap();
        }
        let refresher = CredentialRefresher::new(store, endpoint.clone());
        (dir, endpoint, refresher)
    }

    fn expiring_in(minutes: i64, refresh: Option<&str>) -> Credential {
        Credential::new("A", refresh.map(String::from), None, vec![])
            .with_expiry(Utc::now() + Duration::minutes(minutes))
    }

    #[tokio::test]
    async fn no_credential() {
        let (_dir, endpoint, refresher) = setup(None, vec![]);
        assert_eq!(
            refresher.resolve().await.unwrap(),
            TokenResolution::NotAuthenticated
        );
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let (_dir, endpoint, refresher) = setup(Some(expiring_in(60, Some("R"))), vec![]);
        assert_eq!(refresher.valid_token().await.unwrap(), Some("A".into()));
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn token_inside_skew_is_refreshed() {
        let (_dir, endpoint, refresher) = setup(
            Some(expiring_in(4, Some("R"))),
            vec![Ok(TokenGrant::new("B").with_expires_in(3600))],
        );
        assert_eq!(refresher.valid_token().await.unwrap(), Some("B".into()));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn missing_expiry_forces_refresh() {
        let credential = Credential::new("A", Some("R".into()), None, vec![]);
        let (_dir, endpoint, refresher) = setup(
            Some(credential),
            vec![Ok(TokenGrant::new("B").with_expires_in(3600))],
        );
        assert_eq!(refresher.valid_token().await.unwrap(), Some("B".into()));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn expired_then_refreshed_then_cached() {
        let (_dir, endpoint, refresher) = setup(
            Some(expiring_in(-10, Some("R"))),
            vec![Ok(TokenGrant::new("B").with_expires_in(3600))],
        );

        assert_eq!(refresher.valid_token().await.unwrap(), Some("B".into()));
        assert_eq!(refresher.valid_token().await.unwrap(), Some("B".into()));
        assert_eq!(endpoint.calls(), 1);

        let stored = refresher.store().load().unwrap().unwrap();
        assert_eq!(stored.access_token, "B");
        assert_eq!(stored.refresh_token.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_persisted() {
        let (_dir, _endpoint, refresher) = setup(
            Some(expiring_in(-1, Some("R1"))),
            vec![Ok(TokenGrant::new("B")
                .with_refresh_token("R2")
                .with_expires_in(3600))],
        );
        refresher.valid_token().await.unwrap();
        let stored = refresher.store().load().unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let (_dir, endpoint, refresher) = setup(
            Some(expiring_in(-10, Some("R"))),
            vec![Ok(TokenGrant::new("B").with_expires_in(3600))],
        );
        let refresher = Arc::new(refresher);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let refresher = refresher.clone();
                tokio::spawn(async move { refresher.valid_token().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Some("B".into()));
        }
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn no_refresh_token_clears_store() {
        let (dir, endpoint, refresher) = setup(Some(expiring_in(-1, None)), vec![]);

        assert!(matches!(
            refresher.resolve().await.unwrap(),
            TokenResolution::Revoked(_)
        ));
        assert_eq!(endpoint.calls(), 0);
        assert!(refresher.store().load().unwrap().is_none());
        assert!(!dir.path().join("credential.json").exists());
    }

    #[tokio::test]
    async fn rejected_refresh_clears_store_and_fires_hook() {
        let (_dir, _endpoint, refresher) = setup(
            Some(expiring_in(-1, Some("R"))),
            vec![Err(ProviderError::authentication("invalid_grant"))],
        );
        let reasons = Arc::new(StdMutex::new(Vec::new()));
        let sink = reasons.clone();
        let refresher = refresher.with_invalidation_hook(Arc::new(move |reason: &str| {
            sink.lock().unwrap().push(reason.to_string());
        }));

        assert_eq!(refresher.valid_token().await.unwrap(), None);
        assert!(refresher.store().load().unwrap().is_none());
        assert_eq!(
            reasons.lock().unwrap().as_slice(),
            ["refresh rejected: invalid_grant".to_string()]
        );
    }

    #[tokio::test]
    async fn transient_failure_keeps_credential() {
        let (_dir, endpoint, refresher) = setup(
            Some(expiring_in(-1, Some("R"))),
            vec![
                Err(ProviderError::network("connection reset")),
                Ok(TokenGrant::new("B").with_expires_in(3600)),
            ],
        );

        assert_eq!(
            refresher.resolve().await.unwrap(),
            TokenResolution::Unavailable("connection reset".into())
        );
        let kept = refresher.store().load().unwrap().unwrap();
        assert_eq!(kept.refresh_token.as_deref(), Some("R"));

        assert_eq!(refresher.valid_token().await.unwrap(), Some("B".into()));
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn stale_token_is_never_returned() {
        for result in [
            Err(ProviderError::server("502")),
            Err(ProviderError::authentication("invalid_grant")),
            Ok(TokenGrant::new("fresh").with_expires_in(3600)),
        ] {
            let (_dir, _endpoint, refresher) =
                setup(Some(expiring_in(2, Some("R"))), vec![result]);
            assert_ne!(refresher.valid_token().await.unwrap(), Some("A".into()));
        }
    }

    #[tokio::test]
    async fn invalidate_on_empty_store_skips_hook() {
        let (_dir, _endpoint, refresher) = setup(None, vec![]);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let refresher = refresher.with_invalidation_hook(Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!refresher.invalidate("401").unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logout_during_refresh_stays_logged_out() {
        let endpoint = ScriptedEndpoint::slow(
            vec![Ok(TokenGrant::new("B").with_expires_in(3600))],
            StdDuration::from_millis(200),
        );
        let (dir, endpoint, refresher) = setup_with(Some(expiring_in(-10, Some("R"))), endpoint);
        let refresher = Arc::new(refresher);

        let pending = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.valid_token().await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(refresher.store().clear().unwrap());

        assert_eq!(pending.await.unwrap().unwrap(), None);
        assert_eq!(endpoint.calls(), 1);
        assert!(refresher.store().load().unwrap().is_none());
        assert!(!dir.path().join("credential.json").exists());
    }

    #[tokio::test]
    async fn invalidation_during_refresh_is_not_undone() {
        let endpoint = ScriptedEndpoint::slow(
            vec![Ok(TokenGrant::new("B").with_expires_in(3600))],
            StdDuration::from_millis(200),
        );
        let (_dir, _endpoint, refresher) =
            setup_with(Some(expiring_in(-10, Some("R"))), endpoint);
        let refresher = Arc::new(refresher);

        let pending = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.resolve().await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(refresher.invalidate("401").unwrap());

        assert_eq!(
            pending.await.unwrap().unwrap(),
            TokenResolution::NotAuthenticated
        );
        assert!(refresher.store().load().unwrap().is_none());
    }

    #[tokio::test]
    async fn new_grant_during_refresh_wins() {
        let endpoint = ScriptedEndpoint::slow(
            vec![Err(ProviderError::authentication("invalid_grant"))],
            StdDuration::from_millis(200),
        );
        let (_dir, _endpoint, refresher) =
            setup_with(Some(expiring_in(-10, Some("R"))), endpoint);
        let refresher = Arc::new(refresher);

        let pending = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.valid_token().await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let mut granted = expiring_in(60, Some("R2"));
        granted.access_token = "C".into();
        refresher.store().save(&granted).unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), Some("C".into()));
        assert_eq!(refresher.store().load().unwrap().unwrap().access_token, "C");
    }
}
