//! Command implementations.
//!
//! `server` runs the daemon in-process; every other command is a thin
//! request over the daemon socket.

pub mod actions;
pub mod auth;
pub mod config;
pub mod server;
pub mod status;
