//! Core types: credentials, scheduled actions, failure taxonomy, tracing

pub mod action;
pub mod credential;
pub mod failure;
pub mod tracing;

pub use action::{ActionStatus, ScheduledAction};
pub use credential::{Credential, REFRESH_SKEW};
pub use failure::AuthFailure;
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
