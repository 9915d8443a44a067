//! Request dispatch for UI connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use docrelay_protocol::{
    ErrorCode, EventKind, Notification, ProtocolError, Request, Response, StatusInfo,
};
use docrelay_providers::{CredentialRefresher, TokenResolution};
use tokio::sync::mpsc;
use tracing::{Span, debug, warn};

use crate::auth_flow::AuthorizationFlow;
use crate::bus::NotificationBus;
use crate::error::{ServerError, ServerResult};
use crate::scheduler::DeferredActionScheduler;
use crate::signals::ShutdownHandle;
use crate::socket::Connection;

/// Notifications buffered per subscribed connection before new ones are dropped.
const SUBSCRIBER_BUFFER: usize = 64;

/// Everything the daemon exposes over the socket.
#[derive(Clone)]
pub struct Services {
    pub refresher: Arc<CredentialRefresher>,
    pub flow: AuthorizationFlow,
    pub scheduler: Arc<DeferredActionScheduler>,
    pub bus: NotificationBus,
    pub shutdown: ShutdownHandle,
    pub started_at: Instant,
}

/// Answers requests from UI processes.
pub struct RequestHandler {
    services: Services,
}

impl RequestHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Handles a single request.
    #[tracing::instrument(skip(self, request), fields(request_type = request.kind(), duration_ms))]
    pub async fn handle(&self, request: &Request) -> Response {
        let start = Instant::now();
        let services = &self.services;

        let mutating = matches!(
            request,
            Request::StartAuth | Request::ScheduleAction { .. } | Request::CancelAction { .. }
        );
        if mutating && services.shutdown.is_shutdown() {
            return Response::error(ErrorCode::ShuttingDown, "daemon is shutting down");
        }

        let response = match request {
            Request::CheckToken => match services.refresher.resolve().await {
                Ok(TokenResolution::Valid(token)) => Response::token_status(Some(token)),
                Ok(resolution) => {
                    debug!(?resolution, "No valid token");
                    Response::token_status(None)
                }
                Err(e) => {
                    warn!(error = %e, "Token check failed");
                    Response::token_status(None)
                }
            },
            Request::ClearAuth => {
                let result = services.refresher.store().clear();
                if let Err(e) = &result {
                    warn!(error = %e, "Failed to clear credential");
                }
                Response::Cleared {
                    success: result.is_ok(),
                }
            }
            Request::StartAuth => {
                if services.flow.begin_authorization() {
                    Response::AuthStarted
                } else {
                    Response::error(
                        ErrorCode::AuthInProgress,
                        "an authorization flow is already in progress",
                    )
                }
            }
            Request::ScheduleAction {
                payload,
                trigger_time,
            } => match services.scheduler.schedule(payload.clone(), *trigger_time) {
                Ok(id) => {
                    if *trigger_time <= Utc::now() {
                        services.scheduler.handle().sweep_now();
                    }
                    Response::Scheduled { id }
                }
                Err(e) => error_response(&e),
            },
            Request::CancelAction { id } => match services.scheduler.cancel(id) {
                Ok(_) => Response::Ok,
                Err(e) => error_response(&e),
            },
            Request::ListActions { filter } => Response::Actions {
                actions: services.scheduler.list(filter),
            },
            Request::Subscribe { .. } => Response::error(
                ErrorCode::InvalidRequest,
                "SUBSCRIBE must be sent as a connection's first request",
            ),
            Request::Status => Response::status(self.status().await),
            Request::Ping => Response::Pong,
            Request::Shutdown => {
                debug!("Shutdown requested by client");
                services.shutdown.trigger();
                Response::Ok
            }
        };

        Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        response
    }

    async fn status(&self) -> StatusInfo {
        let services = &self.services;
        let uptime = services.started_at.elapsed().as_secs();

        let credential = match services.refresher.store().load() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Failed to read credential for status");
                None
            }
        };
        let (pending, next) = services.scheduler.pending_summary();

        let mut info = StatusInfo::new(uptime)
            .with_credential(
                credential.is_some(),
                credential.and_then(|c| c.expiry),
            )
            .with_flow_state(services.flow.state())
            .with_pending(pending, next);
        if let Some(at) = services.scheduler.state().await.last_sweep {
            info = info.with_last_sweep(at);
        }
        info
    }

    /// Serves requests until the client disconnects.
    ///
    /// A SUBSCRIBE turns the connection into a notification stream for the
    /// rest of its life.
    pub async fn handle_connection(&self, mut conn: Connection) -> ServerResult<()> {
        loop {
            let Some(envelope) = conn.read_request().await? else {
                debug!("Client disconnected");
                return Ok(());
            };

            if let Request::Subscribe { events } = &envelope.payload {
                return self
                    .serve_subscription(conn, &envelope.request_id, events)
                    .await;
            }

            let response = self.handle(&envelope.payload).await;
            conn.respond(&envelope.request_id, response).await?;

            if self.services.shutdown.is_shutdown() {
                return Err(ServerError::Shutdown);
            }
        }
    }

    async fn serve_subscription(
        &self,
        mut conn: Connection,
        request_id: &str,
        events: &[EventKind],
    ) -> ServerResult<()> {
        let kinds = if events.is_empty() {
            EventKind::ALL.to_vec()
        } else {
            events.to_vec()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let subscription = self
            .services
            .bus
            .subscribe_all(&kinds, move |notification: &Notification| {
                if tx.try_send(notification.clone()).is_err() {
                    warn!(kind = ?notification.kind(), "Subscriber is not keeping up, dropping notification");
                }
            });
        debug!(?kinds, "Client subscribed");

        conn.respond(request_id, Response::Subscribed).await?;
        let result = conn.stream_notifications(request_id, rx).await;
        drop(subscription);
        result
    }
}

fn error_response(error: &ServerError) -> Response {
    Response::Error {
        error: error.to_error_response(),
    }
}

/// Builds the per-connection closure for [`SocketServer::run`](crate::SocketServer::run).
pub fn make_connection_handler(
    handler: Arc<RequestHandler>,
) -> impl Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
    move |conn| {
        let handler = handler.clone();
        Box::pin(async move {
            match handler.handle_connection(conn).await {
                Ok(()) | Err(ServerError::Shutdown) => {}
                Err(ServerError::Protocol(ProtocolError::Timeout { .. })) => {
                    debug!("Idle connection timed out");
                }
                Err(e) => warn!(error = %e, "Connection handler error"),
            }
        })
    }
}
