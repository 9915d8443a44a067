//! Deferred action scheduler.
//!
//! Actions are persisted in the [`ActionStore`] when scheduled. A sweep runs
//! every `sweep_interval` (and on demand) and executes every pending action
//! whose trigger time has passed, one after another. The outcome of each
//! attempt is written durably before the next record is touched, and sweeps
//! never overlap.
//!
//! A crash after an action executed but before its outcome was written
//! executes it again on restart. [`HttpActionExecutor`](crate::HttpActionExecutor)
//! sends the action id as an idempotency key so the downstream API can drop
//! the repeat.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use docrelay_core::{ActionStatus, AuthFailure, ScheduledAction};
use docrelay_protocol::{ActionFilter, Notification};
use docrelay_providers::CredentialRefresher;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::actions::ActionStore;
use crate::bus::NotificationBus;
use crate::error::{ServerError, ServerResult};
use crate::executor::ActionExecutor;

/// Reason recorded when no valid token could be obtained at fire time.
const NO_AUTHORIZATION: &str = "authorization unavailable";
/// Reason recorded when an action is older than the misfire grace.
const MISSED_WINDOW: &str = "missed trigger window";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Overdue actions older than this are failed instead of executed.
    /// `None` executes every overdue action.
    pub misfire_grace: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            misfire_grace: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            sweep_interval,
            ..Default::default()
        }
    }

    pub fn with_misfire_grace(mut self, grace: Option<Duration>) -> Self {
        self.misfire_grace = grace;
        self
    }
}

/// Commands accepted by a running scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Sweep immediately instead of waiting for the interval.
    SweepNow,
    Stop,
}

/// Counters exposed through STATUS.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub last_sweep: Option<DateTime<Utc>>,
    pub fired: u64,
    pub failed: u64,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub fired: usize,
    pub failed: usize,
    /// Due records that were cancelled or claimed before this sweep got to them.
    pub skipped: usize,
}

/// Persists and fires deferred actions.
pub struct DeferredActionScheduler {
    config: SchedulerConfig,
    store: Arc<ActionStore>,
    refresher: Arc<CredentialRefresher>,
    executor: Arc<dyn ActionExecutor>,
    bus: NotificationBus,
    state: Arc<RwLock<SchedulerState>>,
    sweep_lock: Mutex<()>,
    command_tx: mpsc::Sender<SchedulerCommand>,
    command_rx: StdMutex<Option<mpsc::Receiver<SchedulerCommand>>>,
}

impl std::fmt::Debug for DeferredActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredActionScheduler")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl DeferredActionScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<ActionStore>,
        refresher: Arc<CredentialRefresher>,
        executor: Arc<dyn ActionExecutor>,
        bus: NotificationBus,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            config,
            store,
            refresher,
            executor,
            bus,
            state: Arc::new(RwLock::new(SchedulerState::default())),
            sweep_lock: Mutex::new(()),
            command_tx,
            command_rx: StdMutex::new(Some(command_rx)),
        }
    }

    /// Durably records a new pending action and returns its id.
    pub fn schedule(
        &self,
        payload: serde_json::Value,
        trigger_time: DateTime<Utc>,
    ) -> ServerResult<String> {
        self.executor
            .validate(&payload)
            .map_err(|e| ServerError::invalid_action(e.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert(ScheduledAction::new(id.clone(), payload, trigger_time))?;
        info!(action_id = %id, %trigger_time, "Action scheduled");
        Ok(id)
    }

    /// Cancels a pending action that is not being executed.
    pub fn cancel(&self, id: &str) -> ServerResult<ScheduledAction> {
        self.store.cancel(id)
    }

    /// Records matching `filter`, ordered by trigger time.
    pub fn list(&self, filter: &ActionFilter) -> Vec<ScheduledAction> {
        filter.apply(self.store.list())
    }

    pub fn pending_summary(&self) -> (usize, Option<DateTime<Utc>>) {
        self.store.pending_summary()
    }

    pub async fn state(&self) -> SchedulerState {
        self.state.read().await.clone()
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            command_tx: self.command_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Executes every due pending action once.
    pub async fn sweep(&self) -> SweepReport {
        let _sweeping = self.sweep_lock.lock().await;
        let now = Utc::now();
        let due = self.store.due(now);
        let mut report = SweepReport::default();

        if !due.is_empty() {
            debug!(due = due.len(), "Sweeping due actions");
        }

        for candidate in due {
            let Some(action) = self.store.claim(&candidate.id) else {
                report.skipped += 1;
                continue;
            };

            let (status, reason) = match self.attempt(&action, now).await {
                Ok(()) => (ActionStatus::Fired, None),
                Err(reason) => (ActionStatus::Failed, Some(reason)),
            };

            match self.store.complete(&action.id, status, reason.clone()) {
                Ok(_) => {}
                Err(e) => {
                    // Stays claimed, so it is not executed again before a restart.
                    error!(action_id = %action.id, error = %e, "Failed to record action outcome");
                    continue;
                }
            }

            match reason {
                None => {
                    info!(action_id = %action.id, "Action fired");
                    report.fired += 1;
                    self.bus.publish(Notification::ActionFired {
                        id: action.id.clone(),
                    });
                }
                Some(reason) => {
                    warn!(action_id = %action.id, %reason, "Action failed");
                    report.failed += 1;
                    self.bus.publish(Notification::ActionFailed {
                        id: action.id.clone(),
                        reason,
                    });
                }
            }
        }

        let mut state = self.state.write().await;
        state.last_sweep = Some(Utc::now());
        state.fired += report.fired as u64;
        state.failed += report.failed as u64;
        report
    }

    async fn attempt(&self, action: &ScheduledAction, now: DateTime<Utc>) -> Result<(), String> {
        if let Some(grace) = self.config.misfire_grace {
            let late = (now - action.trigger_time).to_std().unwrap_or_default();
            if late > grace {
                return Err(MISSED_WINDOW.to_string());
            }
        }

        let token = match self.refresher.valid_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(NO_AUTHORIZATION.to_string()),
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "Could not obtain a token");
                return Err(NO_AUTHORIZATION.to_string());
            }
        };

        self.executor
            .execute(action, &token)
            .await
            .map_err(|e| AuthFailure::ScheduledActionFailed(e.to_string()).to_string())
    }

    /// Runs the sweep loop until stopped.
    ///
    /// Sweeps once immediately, so actions that came due while the daemon
    /// was down fire right after a restart.
    pub async fn run(self: Arc<Self>) {
        let receiver = self
            .command_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut commands) = receiver else {
            warn!("Scheduler is already running");
            return;
        };

        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "Scheduler started"
        );
        self.sweep().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    self.sweep().await;
                }
                command = commands.recv() => match command {
                    Some(SchedulerCommand::SweepNow) => {
                        debug!("Received SweepNow command");
                        self.sweep().await;
                    }
                    Some(SchedulerCommand::Stop) | None => {
                        info!("Scheduler stopping");
                        break;
                    }
                },
            }
        }
    }
}

/// Handle for sending commands to a running scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Requests an immediate sweep. A sweep already queued absorbs this one.
    pub fn sweep_now(&self) {
        if self.command_tx.try_send(SchedulerCommand::SweepNow).is_err() {
            debug!("Sweep already queued");
        }
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<SchedulerCommand>> {
        self.command_tx.send(SchedulerCommand::Stop).await
    }

    pub async fn state(&self) -> SchedulerState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingExecutor, ScriptedEndpoint, credential_store, eventually, record};
    use chrono::Duration as ChronoDuration;
    use docrelay_protocol::EventKind;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        scheduler: Arc<DeferredActionScheduler>,
        executor: Arc<RecordingExecutor>,
        store: Arc<ActionStore>,
        bus: NotificationBus,
        dir: TempDir,
    }

    fn fixture_in(dir: TempDir, authenticated: bool, config: SchedulerConfig) -> Fixture {
        let store = Arc::new(ActionStore::open(dir.path().join("actions.jsonl")).unwrap());
        let refresher = Arc::new(CredentialRefresher::new(
            credential_store(&dir, authenticated),
            Arc::new(ScriptedEndpoint::default()),
        ));
        let executor = Arc::new(RecordingExecutor::default());
        let bus = NotificationBus::new();
        let scheduler = Arc::new(DeferredActionScheduler::new(
            config,
            store.clone(),
            refresher,
            executor.clone(),
            bus.clone(),
        ));
        Fixture {
            scheduler,
            executor,
            store,
            bus,
            dir,
        }
    }

    fn fixture(authenticated: bool) -> Fixture {
        fixture_in(TempDir::new().unwrap(), authenticated, SchedulerConfig::default())
    }

    fn in_secs(secs: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn fires_past_and_leaves_future() {
        let fx = fixture(true);
        let past = fx.scheduler.schedule(json!({"n": 1}), in_secs(-5)).unwrap();
        let future = fx.scheduler.schedule(json!({"n": 2}), in_secs(3600)).unwrap();

        let report = fx.scheduler.sweep().await;
        assert_eq!(report.fired, 1);
        assert_eq!(fx.executor.executed(), vec![past.clone()]);
        assert_eq!(fx.store.get(&past).unwrap().status, ActionStatus::Fired);
        assert_eq!(fx.store.get(&future).unwrap().status, ActionStatus::Pending);

        // A second sweep does not fire anything again.
        assert_eq!(fx.scheduler.sweep().await, SweepReport::default());
        assert_eq!(fx.executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn restart_fires_each_pending_record_once() {
        let dir = TempDir::new().unwrap();
        {
            let store = ActionStore::open(dir.path().join("actions.jsonl")).unwrap();
            store
                .insert(ScheduledAction::new("one", json!({}), in_secs(-60)))
                .unwrap();
            store
                .insert(ScheduledAction::new("two", json!({}), in_secs(-30)))
                .unwrap();
        }

        let fx = fixture_in(dir, true, SchedulerConfig::default());
        assert_eq!(fx.scheduler.pending_summary().0, 2);

        fx.scheduler.sweep().await;
        fx.scheduler.sweep().await;

        assert_eq!(fx.executor.executed(), vec!["one".to_string(), "two".to_string()]);
        assert_eq!(fx.scheduler.pending_summary(), (0, None));

        // Outcomes survive another restart.
        let fx = fixture_in(fx.dir, true, SchedulerConfig::default());
        fx.scheduler.sweep().await;
        assert!(fx.executor.executed().is_empty());
        assert_eq!(fx.store.get("one").unwrap().status, ActionStatus::Fired);
    }

    #[tokio::test]
    async fn cancel_pending_but_not_fired() {
        let fx = fixture(true);
        let fired = fx.scheduler.schedule(json!({}), in_secs(-1)).unwrap();
        fx.scheduler.sweep().await;

        let err = fx.scheduler.cancel(&fired).unwrap_err();
        assert!(matches!(
            err,
            ServerError::ActionNotPending {
                status: ActionStatus::Fired,
                ..
            }
        ));

        let pending = fx.scheduler.schedule(json!({}), in_secs(-1)).unwrap();
        let cancelled = fx.scheduler.cancel(&pending).unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);

        assert_eq!(fx.scheduler.sweep().await.fired, 0);
        assert_eq!(fx.executor.executed(), vec![fired]);
    }

    #[tokio::test]
    async fn missing_authorization_fails_record() {
        let fx = fixture(false);
        let (seen, _sub) = record(&fx.bus);
        let id = fx.scheduler.schedule(json!({}), in_secs(-1)).unwrap();

        let report = fx.scheduler.sweep().await;
        assert_eq!(report.failed, 1);
        assert!(fx.executor.executed().is_empty());

        let record = fx.store.get(&id).unwrap();
        assert_eq!(record.status, ActionStatus::Failed);
        assert_eq!(record.reason.as_deref(), Some(NO_AUTHORIZATION));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Notification::ActionFailed {
                id,
                reason: NO_AUTHORIZATION.into()
            }]
        );
    }

    #[tokio::test]
    async fn executor_failure_does_not_block_others() {
        let fx = fixture(true);
        let (seen, _sub) = record(&fx.bus);
        let bad = fx.scheduler.schedule(json!({}), in_secs(-20)).unwrap();
        let good = fx.scheduler.schedule(json!({}), in_secs(-10)).unwrap();
        fx.executor.fail(&bad, "smtp down");

        let report = fx.scheduler.sweep().await;
        assert_eq!((report.fired, report.failed), (1, 1));

        let failed = fx.store.get(&bad).unwrap();
        assert_eq!(failed.status, ActionStatus::Failed);
        let reason = failed.reason.unwrap();
        assert!(reason.starts_with("scheduled action failed: "));
        assert!(reason.contains("smtp down"));
        assert_eq!(fx.store.get(&good).unwrap().status, ActionStatus::Fired);

        let kinds: Vec<_> = seen.lock().unwrap().iter().map(Notification::kind).collect();
        assert_eq!(kinds, vec![EventKind::ActionFailed, EventKind::ActionFired]);

        let state = fx.scheduler.state().await;
        assert_eq!((state.fired, state.failed), (1, 1));
        assert!(state.last_sweep.is_some());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_up_front() {
        let fx = fixture(true);
        let err = fx
            .scheduler
            .schedule(json!({"invalid": true}), in_secs(60))
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAction { .. }));
        assert!(fx.store.list().is_empty());
    }

    #[tokio::test]
    async fn misfire_grace_fails_stale_actions() {
        let config = SchedulerConfig::default().with_misfire_grace(Some(Duration::from_secs(60)));
        let fx = fixture_in(TempDir::new().unwrap(), true, config);
        let stale = fx.scheduler.schedule(json!({}), in_secs(-3600)).unwrap();
        let recent = fx.scheduler.schedule(json!({}), in_secs(-5)).unwrap();

        fx.scheduler.sweep().await;

        let stale = fx.store.get(&stale).unwrap();
        assert_eq!(stale.status, ActionStatus::Failed);
        assert_eq!(stale.reason.as_deref(), Some(MISSED_WINDOW));
        assert_eq!(fx.executor.executed(), vec![recent]);
    }

    #[tokio::test]
    async fn run_loop_sweeps_on_demand_and_stops() {
        let fx = fixture_in(
            TempDir::new().unwrap(),
            true,
            SchedulerConfig::new(Duration::from_secs(3600)),
        );
        let handle = fx.scheduler.handle();
        let task = tokio::spawn(fx.scheduler.clone().run());

        let id = fx.scheduler.schedule(json!({}), in_secs(-1)).unwrap();
        handle.sweep_now();
        let executor = fx.executor.clone();
        eventually(move || executor.executed() == vec![id.clone()]).await;

        handle.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.state().await.last_sweep.is_some());
    }
}
