//! The docrelay daemon.
//!
//! A single long-lived process owns the credential and the scheduled-action
//! table. It hosts:
//! - [`NotificationBus`]: in-process publish/subscribe for auth and action events
//! - [`AuthorizationFlow`]: the interactive grant, with duplicate-code suppression
//! - [`DeferredActionScheduler`]: durable actions fired once at or after their
//!   trigger time, backed by [`ActionStore`]
//! - [`SocketServer`] + [`RequestHandler`]: the Unix socket UI processes talk to
//!
//! # Example
//!
//! ```rust,no_run
//! use docrelay_server::{ServerConfig, SocketServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SocketServer::new(ServerConfig::default()).await?;
//!     // Hand connections to a RequestHandler...
//!     # drop(server);
//!     Ok(())
//! }
//! ```

mod actions;
mod auth_flow;
mod bus;
mod config;
mod error;
mod executor;
mod handler;
mod pidfile;
mod scheduler;
mod signals;
mod socket;

#[cfg(test)]
mod testing;

pub use actions::ActionStore;
pub use auth_flow::{AuthorizationFlow, ProcessedGrantCodes};
pub use bus::{NotificationBus, Subscription};
pub use config::{ServerConfig, default_socket_path};
pub use error::{ServerError, ServerResult};
pub use executor::{ActionExecutor, ExecutionError, HttpActionExecutor};
pub use handler::{RequestHandler, Services, make_connection_handler};
pub use pidfile::{PidFile, default_pid_path};
pub use scheduler::{
    DeferredActionScheduler, SchedulerCommand, SchedulerConfig, SchedulerHandle, SchedulerState,
    SweepReport,
};
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
pub use socket::{Connection, SocketServer};
