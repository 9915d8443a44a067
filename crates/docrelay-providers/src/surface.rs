//! The user-visible surface the consent page is opened in.
//!
//! A surface reports navigations to the redirect URI as [`SurfaceEvent`]s and
//! is closed by the orchestrator once the flow ends, successfully or not.

use tokio::sync::{mpsc, oneshot};

use crate::endpoint::BoxFuture;
use crate::error::ProviderResult;

/// Something observed on an open surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The surface navigated to this URL on the redirect URI.
    Navigated(String),
    /// The surface went away before the flow finished.
    Closed,
}

/// How the flow ended, shown to the user when the surface closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceOutcome {
    Authorized,
    Failed(String),
}

/// Builds the consent URL once the surface knows its redirect URI.
pub type UrlBuilder<'a> = Box<dyn FnOnce(&str) -> String + Send + 'a>;

/// Handle to an open surface.
///
/// Dropping the handle without calling [`SurfaceHandle::close`] closes the
/// surface with a generic failure.
#[derive(Debug)]
pub struct SurfaceHandle {
    redirect_uri: String,
    events: mpsc::Receiver<SurfaceEvent>,
    close: Option<oneshot::Sender<SurfaceOutcome>>,
}

impl SurfaceHandle {
    /// Creates a handle from the surface side of the channels.
    pub fn new(
        redirect_uri: impl Into<String>,
        events: mpsc::Receiver<SurfaceEvent>,
        close: oneshot::Sender<SurfaceOutcome>,
    ) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            events,
            close: Some(close),
        }
    }

    /// The redirect URI this surface captures.
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Waits for the next event. A surface that stopped reporting is closed.
    pub async fn next_event(&mut self) -> SurfaceEvent {
        self.events.recv().await.unwrap_or(SurfaceEvent::Closed)
    }

    /// Closes the surface.
    pub fn close(&mut self, outcome: SurfaceOutcome) {
        if let Some(tx) = self.close.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        self.close(SurfaceOutcome::Failed("authorization abandoned".into()));
    }
}

/// Opens consent pages.
pub trait GrantSurface: Send + Sync {
    /// Opens a new surface on the URL produced by `url_for`.
    fn open<'a>(&'a self, url_for: UrlBuilder<'a>) -> BoxFuture<'a, ProviderResult<SurfaceHandle>>;
}
