//! Interactive authorization.
//!
//! One [`AuthorizationFlow`] exists per daemon. It walks
//! `Idle → GrantRequested → GrantSurfaceOpen → CodeReceived → Exchanging → Idle`
//! on a background task and reports the outcome on the [`NotificationBus`].
//! At most one flow runs at a time, and a grant code that was already
//! exchanged is never exchanged again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use docrelay_protocol::{FlowState, Notification};
use docrelay_providers::{
    CredentialStore, GrantSurface, PkceFlow, SurfaceEvent, SurfaceHandle, SurfaceOutcome,
    TokenEndpoint,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::{Position, Url};

use crate::bus::NotificationBus;

/// Recently exchanged grant codes, oldest evicted first.
///
/// Only SHA-256 digests are kept.
#[derive(Debug, Clone)]
pub struct ProcessedGrantCodes {
    digests: VecDeque<[u8; 32]>,
    capacity: usize,
}

impl Default for ProcessedGrantCodes {
    fn default() -> Self {
        Self::new(Self::CAPACITY)
    }
}

impl ProcessedGrantCodes {
    pub const CAPACITY: usize = 10;

    pub fn new(capacity: usize) -> Self {
        Self {
            digests: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records `code`. Returns false if it was already recorded.
    pub fn insert(&mut self, code: &str) -> bool {
        let digest = digest(code);
        if self.digests.contains(&digest) {
            return false;
        }
        if self.digests.len() == self.capacity {
            self.digests.pop_front();
        }
        self.digests.push_back(digest);
        true
    }

    pub fn contains(&self, code: &str) -> bool {
        self.digests.contains(&digest(code))
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

fn digest(code: &str) -> [u8; 32] {
    Sha256::digest(code.as_bytes()).into()
}

struct FlowInner {
    endpoint: Arc<dyn TokenEndpoint>,
    surface: Arc<dyn GrantSurface>,
    store: Arc<CredentialStore>,
    bus: NotificationBus,
    state: Mutex<FlowState>,
    processed: Mutex<ProcessedGrantCodes>,
}

impl FlowInner {
    fn state(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: FlowState) {
        let mut state = self.state();
        debug!(from = ?*state, to = ?next, "Authorization flow transition");
        *state = next;
    }

    fn fail(&self, surface: &mut SurfaceHandle, reason: String) {
        warn!(%reason, "Authorization failed");
        surface.close(SurfaceOutcome::Failed(reason.clone()));
        self.bus.publish(Notification::AuthError { reason });
    }
}

/// Returns the flow to `Idle` however the drive task ends.
struct IdleOnDrop<'a>(&'a FlowInner);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set_state(FlowState::Idle);
    }
}

/// Drives the interactive grant.
#[derive(Clone)]
pub struct AuthorizationFlow {
    inner: Arc<FlowInner>,
}

impl std::fmt::Debug for AuthorizationFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationFlow")
            .field("state", &self.state())
            .finish()
    }
}

impl AuthorizationFlow {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        surface: Arc<dyn GrantSurface>,
        store: Arc<CredentialStore>,
        bus: NotificationBus,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                endpoint,
                surface,
                store,
                bus,
                state: Mutex::new(FlowState::Idle),
                processed: Mutex::new(ProcessedGrantCodes::default()),
            }),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.inner.state()
    }

    /// Starts a flow on a background task.
    ///
    /// Returns false, doing nothing, if a flow is already running. Must be
    /// called from within a Tokio runtime.
    pub fn begin_authorization(&self) -> bool {
        {
            let mut state = self.inner.state();
            if !state.is_idle() {
                debug!(state = ?*state, "Authorization already in progress");
                return false;
            }
            *state = FlowState::GrantRequested;
        }

        info!("Starting authorization");
        tokio::spawn(drive(self.inner.clone()));
        true
    }
}

enum Redirect {
    /// Not ours: wrong path or a state from another attempt.
    Foreign,
    Denied(String),
    Code(String),
}

fn inspect_redirect(url: &str, redirect_uri: &str, pkce: &PkceFlow) -> Redirect {
    let Ok(parsed) = Url::parse(url) else {
        return Redirect::Foreign;
    };
    if &parsed[..Position::AfterPath] != redirect_uri {
        return Redirect::Foreign;
    }

    let mut state = None;
    let mut code = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "state" => state = Some(value.into_owned()),
            "code" => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if !state.as_deref().is_some_and(|s| pkce.state_matches(s)) {
        debug!("Ignoring redirect with foreign state");
        return Redirect::Foreign;
    }
    if let Some(error) = error {
        return Redirect::Denied(match description {
            Some(description) => format!("authorization denied: {error}: {description}"),
            None => format!("authorization denied: {error}"),
        });
    }
    match code {
        Some(code) if !code.is_empty() => Redirect::Code(code),
        _ => Redirect::Denied("redirect did not carry a grant code".into()),
    }
}

async fn drive(inner: Arc<FlowInner>) {
    let _idle = IdleOnDrop(&inner);

    let pkce = PkceFlow::new();
    let endpoint = inner.endpoint.clone();
    let consent = pkce.clone();
    let opened = inner
        .surface
        .open(Box::new(move |redirect: &str| {
            endpoint.authorization_url(&consent, redirect)
        }))
        .await;
    let mut surface = match opened {
        Ok(surface) => surface,
        Err(e) => {
            warn!(error = %e, "Failed to open authorization surface");
            inner.bus.publish(Notification::AuthError {
                reason: format!("failed to open authorization window: {e}"),
            });
            return;
        }
    };
    inner.set_state(FlowState::GrantSurfaceOpen);

    let code = loop {
        match surface.next_event().await {
            SurfaceEvent::Closed => {
                inner.fail(&mut surface, "authorization window was closed".into());
                return;
            }
            SurfaceEvent::Navigated(url) => {
                match inspect_redirect(&url, surface.redirect_uri(), &pkce) {
                    Redirect::Foreign => continue,
                    Redirect::Denied(reason) => {
                        inner.fail(&mut surface, reason);
                        return;
                    }
                    Redirect::Code(code) => break code,
                }
            }
        }
    };
    inner.set_state(FlowState::CodeReceived);

    let fresh = inner
        .processed
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(&code);
    if !fresh {
        info!("Ignoring duplicate grant code");
        surface.close(SurfaceOutcome::Failed(
            "this authorization code was already used".into(),
        ));
        return;
    }

    inner.set_state(FlowState::Exchanging);
    let redirect_uri = surface.redirect_uri().to_string();
    let grant = match inner
        .endpoint
        .exchange_code(&code, &pkce.verifier, &redirect_uri)
        .await
    {
        Ok(grant) => grant,
        Err(e) => {
            inner.fail(&mut surface, e.as_grant_failure().to_string());
            return;
        }
    };

    let credential = grant.into_credential(inner.endpoint.scopes());
    if let Err(e) = inner.store.save(&credential) {
        inner.fail(&mut surface, format!("failed to store credential: {e}"));
        return;
    }

    info!(
        refreshable = credential.can_refresh(),
        scopes = credential.scopes.len(),
        "Authorization succeeded"
    );
    surface.close(SurfaceOutcome::Authorized);
    inner.bus.publish(Notification::AuthSuccess {
        token: credential.access_token,
    });
}
