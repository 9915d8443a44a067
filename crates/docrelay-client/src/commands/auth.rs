//! `docrelay auth`: drive the daemon's authorization flow.

use std::time::Duration;

use docrelay_protocol::{ErrorCode, ErrorResponse, EventKind, Notification, Request, Response};
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};
use crate::socket::SocketClient;

/// Starts the authorization flow and waits for its outcome.
///
/// The subscription is opened before START_AUTH so the outcome cannot be
/// missed. A flow already running is joined instead of failing.
pub async fn login(client: &SocketClient, wait: Duration) -> ClientResult<()> {
    let mut outcomes = client
        .subscribe(vec![EventKind::AuthSuccess, EventKind::AuthError])
        .await?;

    match client.request(Request::StartAuth).await {
        Ok(Response::AuthStarted) => {
            println!("Authorization started. Complete the consent page in your browser.");
            println!("If no browser opened, the consent URL is in the daemon log.");
        }
        Err(ClientError::Rejected(error)) if error.code == ErrorCode::AuthInProgress => {
            println!("An authorization is already in progress; waiting for it to finish.");
        }
        Ok(other) => return Err(ClientError::unexpected(&other)),
        Err(e) => return Err(e),
    }

    let outcome = outcomes.next_within(wait).await.map_err(|e| match e {
        ClientError::Timeout(_) => ClientError::Timeout(format!(
            "no authorization outcome within {}s",
            wait.as_secs()
        )),
        other => other,
    })?;

    match outcome {
        Some(Notification::AuthSuccess { .. }) => {
            info!("Authorization succeeded");
            println!("Authorized. The credential is stored by the daemon.");
            Ok(())
        }
        Some(Notification::AuthError { reason }) => Err(ClientError::AuthFailed(reason)),
        Some(other) => Err(ClientError::unexpected(&other)),
        None => Err(ClientError::Connection(
            "daemon closed the connection before the flow finished".into(),
        )),
    }
}

/// Reports whether the daemon can hand out a valid token.
///
/// The token itself is never printed.
pub async fn status(client: &SocketClient) -> ClientResult<()> {
    match client.request(Request::CheckToken).await? {
        Response::TokenStatus { is_valid: true, .. } => {
            println!("Authorized: a valid access token is available.");
            Ok(())
        }
        Response::TokenStatus { is_valid: false, .. } => {
            println!("Not authorized. Run `docrelay auth login`.");
            Err(ClientError::Rejected(ErrorResponse::new(
                ErrorCode::NotAuthenticated,
                ErrorCode::NotAuthenticated.description(),
            )))
        }
        other => Err(ClientError::unexpected(&other)),
    }
}

/// Drops the stored credential.
pub async fn logout(client: &SocketClient) -> ClientResult<()> {
    match client.request(Request::ClearAuth).await? {
        Response::Cleared { success: true } => {
            println!("Credential removed.");
            Ok(())
        }
        Response::Cleared { success: false } => {
            debug!("ClearAuth reported failure");
            Err(ClientError::Rejected(ErrorResponse::internal(
                "the daemon could not remove the credential file",
            )))
        }
        other => Err(ClientError::unexpected(&other)),
    }
}
