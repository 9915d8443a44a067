//! Request, response and notification types exchanged with the daemon.
//!
//! Message and notification tags are `SCREAMING_SNAKE_CASE` (`CHECK_TOKEN`,
//! `AUTH_SUCCESS`); field names are `camelCase` (`isValid`).

use chrono::{DateTime, Utc};
use docrelay_core::{ActionStatus, ScheduledAction};
use serde::{Deserialize, Serialize};

use crate::PROTOCOL_VERSION;

/// Message envelope wrapping all protocol messages.
///
/// Carries the protocol version and the id that correlates a reply with its
/// request. Notifications pushed to a subscriber reuse the id of the
/// `SUBSCRIBE` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Protocol version.
    pub protocol_version: String,
    /// Correlation id.
    pub request_id: String,
    /// The actual payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current protocol version.
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            request_id: request_id.into(),
            payload,
        }
    }

    /// Creates a request envelope.
    pub fn request(request_id: impl Into<String>, request: T) -> Self {
        Self::new(request_id, request)
    }

    /// Creates a response envelope.
    pub fn response(request_id: impl Into<String>, response: T) -> Self {
        Self::new(request_id, response)
    }

    /// Checks if this envelope uses a compatible protocol version.
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

/// Requests sent from a UI process to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    /// Ask for a currently valid access token, refreshing if needed.
    CheckToken,

    /// Drop the stored credential.
    ClearAuth,

    /// Start the interactive authorization flow. Rejected with
    /// [`ErrorCode::AuthInProgress`] while one is active.
    StartAuth,

    /// Durably schedule an action.
    ScheduleAction {
        /// Opaque payload handed to the executor.
        payload: serde_json::Value,
        /// When the action becomes due.
        trigger_time: DateTime<Utc>,
    },

    /// Cancel a pending action.
    CancelAction {
        /// Action id.
        id: String,
    },

    /// List scheduled actions.
    ListActions {
        /// Optional status filter.
        #[serde(default, skip_serializing_if = "ActionFilter::is_empty")]
        filter: ActionFilter,
    },

    /// Turn this connection into a push stream of notifications.
    Subscribe {
        /// Kinds to receive. Empty means all.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        events: Vec<EventKind>,
    },

    /// Get daemon status.
    Status,

    /// Liveness check.
    Ping,

    /// Request daemon shutdown.
    Shutdown,
}

impl Request {
    /// Creates a ScheduleAction request.
    pub fn schedule_action(payload: serde_json::Value, trigger_time: DateTime<Utc>) -> Self {
        Self::ScheduleAction {
            payload,
            trigger_time,
        }
    }

    /// Creates a CancelAction request.
    pub fn cancel_action(id: impl Into<String>) -> Self {
        Self::CancelAction { id: id.into() }
    }

    /// Creates a ListActions request.
    pub fn list_actions(filter: ActionFilter) -> Self {
        Self::ListActions { filter }
    }

    /// Creates a Subscribe request for the given kinds (empty = all).
    pub fn subscribe(events: Vec<EventKind>) -> Self {
        Self::Subscribe { events }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckToken => "check_token",
            Self::ClearAuth => "clear_auth",
            Self::StartAuth => "start_auth",
            Self::ScheduleAction { .. } => "schedule_action",
            Self::CancelAction { .. } => "cancel_action",
            Self::ListActions { .. } => "list_actions",
            Self::Subscribe { .. } => "subscribe",
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Filter for [`Request::ListActions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFilter {
    /// Only return records in this status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,

    /// Maximum number of records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ActionFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a status.
    pub fn status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Caps the number of records.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the filter matches everything.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.limit.is_none()
    }

    /// Applies the filter to records already ordered by trigger time.
    pub fn apply(&self, actions: Vec<ScheduledAction>) -> Vec<ScheduledAction> {
        let filtered = actions
            .into_iter()
            .filter(|a| self.status.is_none_or(|s| a.status == s));
        match self.limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        }
    }
}

/// Push notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    /// The grant exchange succeeded and a credential was stored.
    AuthSuccess {
        /// The new access token.
        token: String,
    },

    /// The authorization flow failed or the surface was closed.
    AuthError {
        /// Human-readable reason.
        reason: String,
    },

    /// The stored credential was dropped; interactive authorization is needed.
    AuthRequired {
        /// Why the credential was dropped.
        reason: String,
    },

    /// A scheduled action executed successfully.
    ActionFired {
        /// Action id.
        id: String,
    },

    /// A scheduled action failed.
    ActionFailed {
        /// Action id.
        id: String,
        /// Failure reason.
        reason: String,
    },
}

impl Notification {
    /// Returns the kind of this notification.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AuthSuccess { .. } => EventKind::AuthSuccess,
            Self::AuthError { .. } => EventKind::AuthError,
            Self::AuthRequired { .. } => EventKind::AuthRequired,
            Self::ActionFired { .. } => EventKind::ActionFired,
            Self::ActionFailed { .. } => EventKind::ActionFailed,
        }
    }
}

/// Notification kinds, used to pick what a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AuthSuccess,
    AuthError,
    AuthRequired,
    ActionFired,
    ActionFailed,
}

impl EventKind {
    /// All kinds.
    pub const ALL: [EventKind; 5] = [
        Self::AuthSuccess,
        Self::AuthError,
        Self::AuthRequired,
        Self::ActionFired,
        Self::ActionFailed,
    ];
}

/// Responses sent from the daemon to a UI process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Response {
    /// Reply to CHECK_TOKEN.
    TokenStatus {
        /// Whether a usable token was obtained.
        is_valid: bool,
        /// The token, when valid.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Reply to CLEAR_AUTH.
    Cleared {
        /// Whether the credential was removed.
        success: bool,
    },

    /// Reply to START_AUTH. The outcome arrives later as a notification.
    AuthStarted,

    /// Reply to SCHEDULE_ACTION.
    Scheduled {
        /// Id of the new record.
        id: String,
    },

    /// Reply to LIST_ACTIONS.
    Actions {
        /// Records ordered by trigger time.
        actions: Vec<ScheduledAction>,
    },

    /// Acknowledges SUBSCRIBE; notifications follow on the same connection.
    Subscribed,

    /// A pushed notification.
    Notification {
        /// The event.
        event: Notification,
    },

    /// Daemon status.
    Status {
        /// Status details.
        #[serde(flatten)]
        info: StatusInfo,
    },

    /// Generic success.
    Ok,

    /// Reply to PING.
    Pong,

    /// Error response.
    Error {
        /// Error details.
        #[serde(flatten)]
        error: ErrorResponse,
    },
}

impl Response {
    /// Creates a TokenStatus response.
    pub fn token_status(token: Option<String>) -> Self {
        Self::TokenStatus {
            is_valid: token.is_some(),
            token,
        }
    }

    /// Creates a Notification response.
    pub fn notification(event: Notification) -> Self {
        Self::Notification { event }
    }

    /// Creates a Status response.
    pub fn status(info: StatusInfo) -> Self {
        Self::Status { info }
    }

    /// Creates an Error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorResponse::new(code, message),
        }
    }

    /// Returns true unless this is an error response.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }

    /// Returns the error if this is an error response.
    pub fn as_error(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Authorization flow state as reported by STATUS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    #[default]
    Idle,
    GrantRequested,
    GrantSurfaceOpen,
    CodeReceived,
    Exchanging,
}

impl FlowState {
    /// Returns true when no flow is running.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Daemon status information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Whether a credential is stored.
    pub authenticated: bool,
    /// Expiry of the stored access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
    /// Authorization flow state.
    pub flow_state: FlowState,
    /// Number of pending actions.
    pub pending_actions: usize,
    /// Earliest pending trigger time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_trigger: Option<DateTime<Utc>>,
    /// When the last sweep finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sweep: Option<DateTime<Utc>>,
}

impl StatusInfo {
    /// Creates status info with only uptime set.
    pub fn new(uptime_seconds: u64) -> Self {
        Self {
            uptime_seconds,
            authenticated: false,
            token_expiry: None,
            flow_state: FlowState::Idle,
            pending_actions: 0,
            next_trigger: None,
            last_sweep: None,
        }
    }

    /// Sets credential presence and expiry.
    pub fn with_credential(mut self, authenticated: bool, expiry: Option<DateTime<Utc>>) -> Self {
        self.authenticated = authenticated;
        self.token_expiry = expiry;
        self
    }

    /// Sets the flow state.
    pub fn with_flow_state(mut self, state: FlowState) -> Self {
        self.flow_state = state;
        self
    }

    /// Sets pending count and the next trigger.
    pub fn with_pending(mut self, count: usize, next: Option<DateTime<Utc>>) -> Self {
        self.pending_actions = count;
        self.next_trigger = next;
        self
    }

    /// Sets the last sweep time.
    pub fn with_last_sweep(mut self, at: DateTime<Utc>) -> Self {
        self.last_sweep = Some(at);
        self
    }
}

/// Error codes carried by [`Response::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No usable credential; authorize first.
    NotAuthenticated,
    /// An authorization flow is already running.
    AuthInProgress,
    /// Unknown action id.
    NotFound,
    /// The record is not in a state that allows the operation.
    Conflict,
    /// Malformed or unsupported request.
    InvalidRequest,
    /// Daemon is shutting down.
    ShuttingDown,
    /// Anything else.
    InternalError,
}

impl ErrorCode {
    /// Returns a human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "Not authenticated",
            Self::AuthInProgress => "Authorization already in progress",
            Self::NotFound => "Requested action not found",
            Self::Conflict => "Action is not pending",
            Self::InvalidRequest => "The request was invalid",
            Self::ShuttingDown => "Daemon is shutting down",
            Self::InternalError => "An internal error occurred",
        }
    }
}

/// Error details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: ErrorCode,
    /// Message for the user.
    pub message: String,
}

impl ErrorResponse {
    /// Creates a new error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResponse {}
