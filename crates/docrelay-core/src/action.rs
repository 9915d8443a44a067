//! Deferred actions and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a scheduled action.
///
/// `Pending` is the only non-terminal status. A record leaves it exactly once
/// and never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for its trigger time.
    Pending,
    /// Executed successfully.
    Fired,
    /// Execution was attempted (or skipped) and failed.
    Failed,
    /// Cancelled by the user before it fired.
    Cancelled,
}

impl ActionStatus {
    /// Returns true for fired, failed and cancelled.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns the wire/storage name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "fired" => Ok(Self::Fired),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown action status: {}", other)),
        }
    }
}

/// A user-requested action that fires at or after `trigger_time`.
///
/// The payload is opaque to the scheduler; only the executor interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledAction {
    /// Unique identifier.
    pub id: String,
    /// What to do when the action fires.
    pub payload: serde_json::Value,
    /// Absolute time at or after which the action fires.
    pub trigger_time: DateTime<Utc>,
    /// Current status.
    pub status: ActionStatus,
    /// Failure or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the action was scheduled.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledAction {
    /// Creates a new pending action.
    pub fn new(
        id: impl Into<String>,
        payload: serde_json::Value,
        trigger_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            payload,
            trigger_time,
            status: ActionStatus::Pending,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the action is pending and its trigger time has passed.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.trigger_time <= now
    }

    /// Returns a copy moved to a terminal status.
    ///
    /// Returns `None` if the action is already terminal.
    pub fn transitioned(&self, status: ActionStatus, reason: Option<String>) -> Option<Self> {
        if self.status.is_terminal() || !status.is_terminal() {
            return None;
        }
        Some(Self {
            status,
            reason,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }
}
