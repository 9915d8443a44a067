//! In-process notification bus.
//!
//! Components publish [`Notification`]s without knowing who listens. Handlers
//! are registered per [`EventKind`] and stay registered until their
//! [`Subscription`] is dropped. Nothing is buffered: a notification published
//! while nobody listens is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use docrelay_protocol::{EventKind, Notification};
use docrelay_providers::InvalidationHook;
use tracing::trace;

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Entry {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, ids: &[u64]) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| !ids.contains(&entry.id));
    }
}

/// Cloneable handle to a shared bus.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `notification` to every handler registered for its kind.
    ///
    /// Handlers run on the caller's task after the registry lock is
    /// released, so a handler may subscribe or unsubscribe. Returns the
    /// number of handlers invoked.
    pub fn publish(&self, notification: Notification) -> usize {
        let kind = notification.kind();
        let handlers: Vec<Handler> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.handler.clone())
            .collect();

        trace!(?kind, handlers = handlers.len(), "Publishing notification");
        for handler in &handlers {
            handler(&notification);
        }
        handlers.len()
    }

    /// Registers `handler` for one kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_all(&[kind], handler)
    }

    /// Registers one handler for several kinds.
    pub fn subscribe_all<F>(&self, kinds: &[EventKind], handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut ids = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            entries.push(Entry {
                id,
                kind,
                handler: handler.clone(),
            });
            ids.push(id);
        }

        Subscription {
            ids,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Invalidation hook for the credential refresher.
    ///
    /// Publishes `AUTH_REQUIRED` with the reason whenever the stored
    /// credential is dropped by a rejected refresh or a `401`.
    pub fn auth_required_hook(&self) -> InvalidationHook {
        let bus = self.clone();
        Arc::new(move |reason: &str| {
            bus.publish(Notification::AuthRequired {
                reason: reason.to_string(),
            });
        })
    }

    /// Number of registered (kind, handler) pairs.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Keeps a handler registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    ids: Vec<u64>,
    bus: Weak<Inner>,
}

impl Subscription {
    /// Unsubscribes now. Equivalent to dropping.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("ids", &self.ids).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use docrelay_core::Credential;
    use docrelay_providers::CredentialRefresher;

    use crate::testing::{ScriptedEndpoint, credential_store, record};

    fn recorder() -> (Arc<Mutex<Vec<Notification>>>, impl Fn(&Notification) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |n: &Notification| {
            sink.lock().unwrap().push(n.clone())
        })
    }

    #[test]
    fn delivers_only_matching_kind() {
        let bus = NotificationBus::new();
        let (seen, handler) = recorder();
        let _sub = bus.subscribe(EventKind::ActionFired, handler);

        bus.publish(Notification::AuthError {
            reason: "closed".into(),
        });
        let delivered = bus.publish(Notification::ActionFired { id: "a1".into() });

        assert_eq!(delivered, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Notification::ActionFired { id: "a1".into() }]
        );
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let bus = NotificationBus::new();
        assert_eq!(
            bus.publish(Notification::AuthSuccess { token: "t".into() }),
            0
        );

        let (seen, handler) = recorder();
        let _sub = bus.subscribe(EventKind::AuthSuccess, handler);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = NotificationBus::new();
        let (seen, handler) = recorder();
        let sub = bus.subscribe_all(&EventKind::ALL, handler);
        assert_eq!(bus.subscriber_count(), 5);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(Notification::AuthRequired {
            reason: "revoked".into(),
        });
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_may_resubscribe_during_publish() {
        let bus = NotificationBus::new();
        let inner_bus = bus.clone();
        let late = Arc::new(Mutex::new(Vec::new()));
        let late_clone = late.clone();

        let _sub = bus.subscribe(EventKind::AuthSuccess, move |_| {
            let (_, handler) = recorder();
            late_clone
                .lock()
                .unwrap()
                .push(inner_bus.subscribe(EventKind::AuthError, handler));
        });

        bus.publish(Notification::AuthSuccess { token: "t".into() });
        assert_eq!(late.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn rejected_refresh_publishes_auth_required() {
        let dir = tempfile::tempdir().unwrap();
        let store = credential_store(&dir, false);
        store
            .save(&Credential::new("A", Some("R".into()), None, vec![]))
            .unwrap();
        let bus = NotificationBus::new();
        let (seen, _sub) = record(&bus);
        let refresher = CredentialRefresher::new(store, Arc::new(ScriptedEndpoint::default()))
            .with_invalidation_hook(bus.auth_required_hook());

        assert_eq!(refresher.valid_token().await.unwrap(), None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Notification::AuthRequired {
                reason: "refresh rejected: invalid_grant".into()
            }]
        );
    }

    #[tokio::test]
    async fn api_rejection_publishes_auth_required_once() {
        let dir = tempfile::tempdir().unwrap();
        let bus = NotificationBus::new();
        let (seen, _sub) = record(&bus);
        let refresher = CredentialRefresher::new(
            credential_store(&dir, true),
            Arc::new(ScriptedEndpoint::default()),
        )
        .with_invalidation_hook(bus.auth_required_hook());

        assert!(refresher.invalidate("access token rejected by the API (401)").unwrap());
        assert!(!refresher.invalidate("access token rejected by the API (401)").unwrap());

        let kinds: Vec<_> = seen.lock().unwrap().iter().map(Notification::kind).collect();
        assert_eq!(kinds, vec![EventKind::AuthRequired]);
    }

    #[test]
    fn subscription_outlives_bus() {
        let bus = NotificationBus::new();
        let (_, handler) = recorder();
        let sub = bus.subscribe(EventKind::AuthError, handler);
        drop(bus);
        drop(sub);
    }
}
