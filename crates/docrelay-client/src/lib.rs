//! docrelay command-line interface.
//!
//! `docrelay server` runs the daemon in the foreground; every other command
//! talks to it over the Unix socket.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod secret;
pub mod socket;

pub use cli::Cli;
pub use error::{ClientError, ClientResult};
pub use socket::{NotificationStream, SocketClient};
