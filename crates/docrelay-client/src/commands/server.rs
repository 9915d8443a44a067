//! `docrelay server`: runs the daemon in the foreground.
//!
//! Startup order:
//! - PID file (refuses a second daemon)
//! - signal listener (SIGTERM/SIGINT)
//! - credential store, refresher and authorization flow
//! - action table and scheduler
//! - socket server, until shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use docrelay_providers::google::{LoopbackSurface, OAuthClient};
use docrelay_providers::{AuthorizedClient, CredentialRefresher, CredentialStore};
use docrelay_server::{
    ActionStore, AuthorizationFlow, DeferredActionScheduler, HttpActionExecutor,
    NotificationBus, PidFile, RequestHandler, ServerConfig, Services, SignalHandler,
    SocketServer, default_pid_path, make_connection_handler,
};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Overrides given on the `server` command line.
#[derive(Debug, Default)]
pub struct ServerOptions {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub no_browser: bool,
    pub socket_path: Option<std::path::PathBuf>,
}

/// Starts the daemon and blocks until SIGTERM/SIGINT or a SHUTDOWN request.
pub async fn run(options: ServerOptions, config: &ClientConfig) -> ClientResult<()> {
    let mut google = config
        .google
        .to_provider_config(options.client_id.as_deref(), options.client_secret.as_deref())?;
    if options.no_browser {
        google = google.with_open_browser(false);
    }

    let _pid_file = PidFile::create(default_pid_path())?;

    let signals = SignalHandler::new();
    signals.spawn_listener()?;

    let bus = NotificationBus::new();

    let store = Arc::new(CredentialStore::new(&google.token_path));
    let surface = Arc::new(LoopbackSurface::from_config(&google));
    let timeout = google.timeout;
    let endpoint = Arc::new(OAuthClient::new(google)?);

    let refresher = Arc::new(
        CredentialRefresher::new(store.clone(), endpoint.clone())
            .with_invalidation_hook(bus.auth_required_hook()),
    );

    match store.load() {
        Ok(Some(_)) => info!(path = %store.path().display(), "Credential found"),
        Ok(None) => warn!("No credential stored; run `docrelay auth login` to authorize"),
        Err(e) => warn!(error = %e, "Stored credential is unreadable"),
    }

    let flow = AuthorizationFlow::new(endpoint, surface, store, bus.clone());

    let actions = Arc::new(ActionStore::open(config.actions_path())?);
    let executor = Arc::new(HttpActionExecutor::new(AuthorizedClient::new(
        refresher.clone(),
        timeout,
    )?));
    let scheduler = Arc::new(DeferredActionScheduler::new(
        config.to_scheduler_config(),
        actions,
        refresher.clone(),
        executor,
        bus.clone(),
    ));
    let scheduler_handle = scheduler.handle();
    let scheduler_task = tokio::spawn(scheduler.clone().run());

    let socket_path = config.socket_path(options.socket_path.as_deref());
    let server = SocketServer::new(ServerConfig::new(&socket_path)).await?;
    info!(path = %socket_path.display(), "Daemon listening");

    let handler = RequestHandler::new(Services {
        refresher,
        flow,
        scheduler,
        bus,
        shutdown: signals.shutdown_handle(),
        started_at: Instant::now(),
    });

    server
        .run_until_shutdown(
            make_connection_handler(Arc::new(handler)),
            signals.shutdown().wait(),
        )
        .await?;

    info!("Shutting down");
    if let Err(e) = scheduler_handle.stop().await {
        warn!(error = %e, "Failed to stop the scheduler");
    }
    if tokio::time::timeout(Duration::from_secs(5), scheduler_task)
        .await
        .is_err()
    {
        warn!("Scheduler did not stop within 5s");
    }

    info!("Daemon stopped");
    Ok(())
}
