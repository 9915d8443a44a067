//! Command-line interface definition.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use docrelay_core::ActionStatus;
use docrelay_protocol::EventKind;

/// docrelay - relay authorized Google Workspace calls, now or later
#[derive(Debug, Parser)]
#[command(name = "docrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, env = "DOCRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the daemon socket
    #[arg(long = "socket", global = true, env = "DOCRELAY_SOCKET")]
    pub socket_path: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the foreground
    Server {
        /// OAuth client ID (from Google Cloud Console)
        #[arg(long, env = "GOOGLE_CLIENT_ID")]
        client_id: Option<String>,

        /// OAuth client secret (from Google Cloud Console)
        #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true)]
        client_secret: Option<String>,

        /// Only print the consent URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Authorization commands
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Schedule an authorized call
    Schedule(ScheduleArgs),

    /// Cancel a pending action
    Cancel {
        /// Action id
        id: String,
    },

    /// List scheduled actions
    List {
        /// Only show actions in this status (pending, fired, failed, cancelled)
        #[arg(long, value_parser = parse_status)]
        status: Option<ActionStatus>,

        /// Maximum number of actions
        #[arg(long)]
        limit: Option<usize>,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Print daemon notifications as they happen
    Watch {
        /// Only these events (can be repeated; default all)
        #[arg(long = "event", value_parser = parse_event_kind, action = clap::ArgAction::Append)]
        events: Vec<EventKind>,
    },

    /// Show daemon status
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Authorization actions.
#[derive(Debug, Subcommand)]
pub enum AuthAction {
    /// Run the interactive authorization and wait for its outcome
    Login {
        /// Seconds to wait for the outcome
        #[arg(long, default_value = "300")]
        wait: u64,
    },

    /// Show whether a valid token is available
    Status,

    /// Forget the stored credential
    Logout,
}

/// Arguments of `docrelay schedule`.
#[derive(Debug, Args)]
pub struct ScheduleArgs {
    /// When to fire: `now`, a relative offset (`+30s`, `+15m`, `+2h`, `+1d`)
    /// or an RFC 3339 timestamp
    #[arg(long, default_value = "now")]
    pub at: String,

    /// Read the whole JSON payload from a file (`-` for stdin)
    #[arg(long, conflicts_with_all = ["method", "url", "body"])]
    pub payload_file: Option<PathBuf>,

    /// HTTP method of the call
    #[arg(long, default_value = "POST")]
    pub method: String,

    /// Absolute URL of the call
    #[arg(long, required_unless_present = "payload_file")]
    pub url: Option<String>,

    /// JSON body of the call
    #[arg(long)]
    pub body: Option<String>,
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

fn parse_status(s: &str) -> Result<ActionStatus, String> {
    s.parse()
}

fn parse_event_kind(s: &str) -> Result<EventKind, String> {
    let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
    EventKind::ALL
        .into_iter()
        .find(|kind| {
            serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.as_str().map(|name| name == normalized))
                .unwrap_or(false)
        })
        .ok_or_else(|| format!("unknown event: {s}"))
}

/// Parses a trigger time relative to `now`.
pub fn parse_trigger(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(offset) = input.strip_prefix('+') {
        let split = offset
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(offset.len());
        let (amount, unit) = offset.split_at(split);
        let amount: i64 = amount
            .parse()
            .map_err(|_| format!("invalid offset: {input}"))?;
        let delta = match unit {
            "s" => Duration::try_seconds(amount),
            "m" | "" => Duration::try_minutes(amount),
            "h" => Duration::try_hours(amount),
            "d" => Duration::try_days(amount),
            _ => return Err(format!("unknown unit `{unit}` in {input}; use s, m, h or d")),
        };
        return delta
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| format!("offset out of range: {input}"));
    }

    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid time `{input}`: {e}"))
}
