//! In-process fakes shared by the daemon's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docrelay_core::{Credential, ScheduledAction};
use docrelay_protocol::{EventKind, Notification};
use docrelay_providers::{
    AuthorizedClient, BoxFuture, CredentialRefresher, CredentialStore, GrantSurface, PkceFlow,
    ProviderError, ProviderResult, SurfaceEvent, SurfaceHandle, SurfaceOutcome, TokenEndpoint,
    TokenGrant, UrlBuilder,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use crate::bus::{NotificationBus, Subscription};
use crate::executor::{ActionExecutor, ExecutionError};

pub const REDIRECT_URI: &str = "http://127.0.0.1:1/callback";

/// Token endpoint that counts exchanges and can be told to reject them.
#[derive(Default)]
pub struct ScriptedEndpoint {
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
    reject_exchange: Option<String>,
    scopes: Vec<String>,
}

impl ScriptedEndpoint {
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject_exchange: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl TokenEndpoint for ScriptedEndpoint {
    fn scopes(&self) -> &[String] {
        &self.scopes
    }

    fn authorization_url(&self, pkce: &PkceFlow, redirect_uri: &str) -> String {
        format!(
            "https://consent.invalid/auth?state={}&redirect_uri={redirect_uri}",
            pkce.state
        )
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        _verifier: &'a str,
        _redirect_uri: &'a str,
    ) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
        Box::pin(async move {
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
            match &self.reject_exchange {
                Some(message) => Err(ProviderError::authentication(message.clone())),
                None => Ok(TokenGrant::new(format!("access-{code}-{n}"))
                    .with_refresh_token("R")
                    .with_expires_in(3600)),
            }
        })
    }

    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
        Box::pin(async move {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::authentication("invalid_grant"))
        })
    }
}

/// What a [`FakeSurface`] does after it is opened.
pub enum SurfaceScript {
    /// Reports these query strings on the redirect URI, then goes away.
    /// `{state}` is replaced with the state of the consent URL.
    Redirect(Vec<&'static str>),
    /// Reports the user closing the window.
    Close,
    /// Stays open and silent until the test sends events.
    Hold,
}

/// Grant surface driven by a script, one entry per `open`.
#[derive(Default)]
pub struct FakeSurface {
    opens: AtomicUsize,
    scripts: Mutex<VecDeque<SurfaceScript>>,
    held: Mutex<Vec<mpsc::Sender<SurfaceEvent>>>,
    outcomes: Arc<Mutex<Vec<SurfaceOutcome>>>,
}

impl FakeSurface {
    pub fn new(scripts: Vec<SurfaceScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn outcomes(&self) -> Vec<SurfaceOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Drops held surfaces, which reads as the user closing them.
    pub fn release_held(&self) {
        self.held.lock().unwrap().clear();
    }
}

impl GrantSurface for FakeSurface {
    fn open<'a>(&'a self, url_for: UrlBuilder<'a>) -> BoxFuture<'a, ProviderResult<SurfaceHandle>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let url = url_for(REDIRECT_URI);
            let state = url
                .split("state=")
                .nth(1)
                .and_then(|rest| rest.split('&').next())
                .unwrap_or_default()
                .to_string();

            let (tx, rx) = mpsc::channel(16);
            let (close_tx, close_rx) = oneshot::channel();
            let outcomes = self.outcomes.clone();
            tokio::spawn(async move {
                if let Ok(outcome) = close_rx.await {
                    outcomes.lock().unwrap().push(outcome);
                }
            });

            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SurfaceScript::Close);
            match script {
                SurfaceScript::Redirect(queries) => {
                    for query in queries {
                        let query = query.replace("{state}", &state);
                        let _ = tx
                            .send(SurfaceEvent::Navigated(format!("{REDIRECT_URI}?{query}")))
                            .await;
                    }
                }
                SurfaceScript::Close => {
                    let _ = tx.send(SurfaceEvent::Closed).await;
                }
                SurfaceScript::Hold => self.held.lock().unwrap().push(tx),
            }
            Ok(SurfaceHandle::new(REDIRECT_URI, rx, close_tx))
        })
    }
}

/// Executor that records what it ran and fails ids it was told to fail.
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, String>>,
}

impl RecordingExecutor {
    pub fn fail(&self, id: &str, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(id.to_string(), reason.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl ActionExecutor for RecordingExecutor {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), ExecutionError> {
        if payload.get("invalid").is_some() {
            return Err(ExecutionError::InvalidPayload("marked invalid".into()));
        }
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        action: &'a ScheduledAction,
        token: &'a str,
    ) -> BoxFuture<'a, Result<(), ExecutionError>> {
        Box::pin(async move {
            assert!(!token.is_empty());
            self.executed.lock().unwrap().push(action.id.clone());
            match self.failures.lock().unwrap().get(&action.id) {
                Some(reason) => Err(ProviderError::server(reason.clone()).into()),
                None => Ok(()),
            }
        })
    }
}

/// Credential store under `dir`, optionally holding a fresh credential.
pub fn credential_store(dir: &TempDir, authenticated: bool) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::new(dir.path().join("credential.json")));
    if authenticated {
        store
            .save(&Credential::new("tok", Some("R".into()), Some(3600), vec![]))
            .unwrap();
    }
    store
}

pub fn authorized_client(dir: &TempDir, endpoint: Arc<ScriptedEndpoint>) -> AuthorizedClient {
    let refresher = CredentialRefresher::new(credential_store(dir, true), endpoint);
    AuthorizedClient::new(Arc::new(refresher), Duration::from_secs(5)).unwrap()
}

/// Records every notification published on `bus`.
pub fn record(bus: &NotificationBus) -> (Arc<Mutex<Vec<Notification>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = bus.subscribe_all(&EventKind::ALL, move |n: &Notification| {
        sink.lock().unwrap().push(n.clone())
    });
    (seen, sub)
}

/// Polls `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
