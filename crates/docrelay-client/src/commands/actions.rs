//! Scheduled action commands: `schedule`, `cancel`, `list`, `watch`.

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use docrelay_core::ScheduledAction;
use docrelay_protocol::{ActionFilter, EventKind, Notification, Request, Response};
use docrelay_providers::AuthorizedRequest;
use serde_json::Value;

use crate::cli::{ScheduleArgs, parse_trigger};
use crate::error::{ClientError, ClientResult};
use crate::socket::SocketClient;

/// Builds the action payload from `schedule` arguments.
///
/// Either the whole payload comes from `--payload-file`, or it is an
/// authorized HTTP call assembled from `--method`, `--url` and `--body`.
pub fn build_payload(args: &ScheduleArgs) -> ClientResult<Value> {
    if let Some(ref path) = args.payload_file {
        let raw = read_payload_file(path)?;
        return serde_json::from_str(&raw).map_err(|e| {
            ClientError::InvalidArgument(format!("{} is not valid JSON: {e}", path.display()))
        });
    }

    let url = args
        .url
        .as_deref()
        .ok_or_else(|| ClientError::InvalidArgument("--url is required".into()))?;
    let mut request = AuthorizedRequest::new(args.method.to_ascii_uppercase(), url);
    if let Some(ref body) = args.body {
        let body = serde_json::from_str(body)
            .map_err(|e| ClientError::InvalidArgument(format!("--body is not valid JSON: {e}")))?;
        request = request.with_body(body);
    }

    serde_json::to_value(&request)
        .map_err(|e| ClientError::InvalidArgument(format!("unserializable payload: {e}")))
}

fn read_payload_file(path: &Path) -> ClientResult<String> {
    if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        Ok(raw)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Schedules an action and prints its id.
pub async fn schedule(client: &SocketClient, args: &ScheduleArgs) -> ClientResult<()> {
    let trigger = parse_trigger(&args.at, Utc::now()).map_err(ClientError::InvalidArgument)?;
    let payload = build_payload(args)?;

    match client
        .request(Request::schedule_action(payload, trigger))
        .await?
    {
        Response::Scheduled { id } => {
            println!("{id}");
            eprintln!("scheduled for {}", format_time(trigger));
            Ok(())
        }
        other => Err(ClientError::unexpected(&other)),
    }
}

/// Cancels a pending action.
pub async fn cancel(client: &SocketClient, id: &str) -> ClientResult<()> {
    match client.request(Request::cancel_action(id)).await? {
        Response::Ok => {
            println!("Cancelled {id}.");
            Ok(())
        }
        other => Err(ClientError::unexpected(&other)),
    }
}

/// Lists scheduled actions.
pub async fn list(client: &SocketClient, filter: ActionFilter, json: bool) -> ClientResult<()> {
    let actions = match client.request(Request::list_actions(filter)).await? {
        Response::Actions { actions } => actions,
        other => return Err(ClientError::unexpected(&other)),
    };

    if json {
        let out = serde_json::to_string_pretty(&actions)
            .map_err(|e| ClientError::UnexpectedResponse(e.to_string()))?;
        println!("{out}");
    } else if actions.is_empty() {
        println!("No scheduled actions.");
    } else {
        for action in &actions {
            println!("{}", format_action(action));
        }
    }
    Ok(())
}

/// Prints notifications until the daemon goes away.
pub async fn watch(client: &SocketClient, events: Vec<EventKind>) -> ClientResult<()> {
    let mut stream = client.subscribe(events).await?;
    while let Some(notification) = stream.next().await? {
        println!("{}", format_notification(&notification));
    }
    eprintln!("daemon closed the stream");
    Ok(())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}

fn describe_payload(payload: &Value) -> String {
    match serde_json::from_value::<AuthorizedRequest>(payload.clone()) {
        Ok(request) => format!("{} {}", request.method, request.url),
        Err(_) => payload.to_string(),
    }
}

fn format_action(action: &ScheduledAction) -> String {
    let mut line = format!(
        "{}  {:<9}  {}  {}",
        action.id,
        action.status.as_str(),
        format_time(action.trigger_time),
        describe_payload(&action.payload)
    );
    if let Some(ref reason) = action.reason {
        line.push_str(&format!("  ({reason})"));
    }
    line
}

/// One line per notification. Tokens are not printed.
fn format_notification(notification: &Notification) -> String {
    match notification {
        Notification::AuthSuccess { .. } => "AUTH_SUCCESS".to_string(),
        Notification::AuthError { reason } => format!("AUTH_ERROR {reason}"),
        Notification::AuthRequired { reason } => format!("AUTH_REQUIRED {reason}"),
        Notification::ActionFired { id } => format!("ACTION_FIRED {id}"),
        Notification::ActionFailed { id, reason } => format!("ACTION_FAILED {id} {reason}"),
    }
}
