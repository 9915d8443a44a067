//! Executes the payload of a due action.

use docrelay_core::ScheduledAction;
use docrelay_providers::{AuthorizedClient, AuthorizedRequest, BoxFuture, ProviderError};
use thiserror::Error;
use tracing::info;

/// Why an action could not be executed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The payload is not something this executor understands.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Runs scheduled actions with an already validated access token.
pub trait ActionExecutor: Send + Sync {
    /// Checks a payload when it is scheduled, so bad input is rejected up
    /// front instead of failing at trigger time.
    fn validate(&self, _payload: &serde_json::Value) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Executes `action`. The action id doubles as the idempotency key.
    fn execute<'a>(
        &'a self,
        action: &'a ScheduledAction,
        token: &'a str,
    ) -> BoxFuture<'a, Result<(), ExecutionError>>;
}

/// Interprets payloads as `{method, url, body?}` authorized HTTP calls.
#[derive(Debug, Clone)]
pub struct HttpActionExecutor {
    client: AuthorizedClient,
}

impl HttpActionExecutor {
    pub fn new(client: AuthorizedClient) -> Self {
        Self { client }
    }

    fn parse(payload: &serde_json::Value) -> Result<AuthorizedRequest, ExecutionError> {
        let request: AuthorizedRequest = serde_json::from_value(payload.clone())
            .map_err(|e| ExecutionError::InvalidPayload(e.to_string()))?;
        let url = url::Url::parse(&request.url)
            .map_err(|e| ExecutionError::InvalidPayload(format!("bad url {}: {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExecutionError::InvalidPayload(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if request.method.trim().is_empty() {
            return Err(ExecutionError::InvalidPayload("empty method".into()));
        }
        Ok(request)
    }
}

impl ActionExecutor for HttpActionExecutor {
    fn validate(&self, payload: &serde_json::Value) -> Result<(), ExecutionError> {
        Self::parse(payload).map(|_| ())
    }

    fn execute<'a>(
        &'a self,
        action: &'a ScheduledAction,
        token: &'a str,
    ) -> BoxFuture<'a, Result<(), ExecutionError>> {
        Box::pin(async move {
            let request = Self::parse(&action.payload)?;
            let response = self
                .client
                .send_with_token(token, &request, Some(&action.id))
                .await?;
            info!(
                action_id = %action.id,
                method = %request.method,
                status = response.status,
                "Action request completed"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedEndpoint, authorized_client};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn executor(dir: &tempfile::TempDir) -> HttpActionExecutor {
        HttpActionExecutor::new(authorized_client(dir, Arc::new(ScriptedEndpoint::default())))
    }

    #[test]
    fn validates_http_payloads() {
        let dir = tempdir().unwrap();
        let executor = executor(&dir);

        assert!(
            executor
                .validate(&json!({
                    "method": "POST",
                    "url": "https://gmail.googleapis.com/gmail/v1/users/me/messages/send",
                    "body": {"raw": "aGk="}
                }))
                .is_ok()
        );

        for bad in [
            json!({"url": "https://example.invalid"}),
            json!({"method": "GET", "url": "not a url"}),
            json!({"method": "GET", "url": "file:///etc/passwd"}),
            json!({"method": " ", "url": "https://example.invalid"}),
            json!("send it"),
        ] {
            assert!(
                matches!(executor.validate(&bad), Err(ExecutionError::InvalidPayload(_))),
                "accepted {bad}"
            );
        }
    }

    #[tokio::test]
    async fn invalid_payload_fails_without_network() {
        let dir = tempdir().unwrap();
        let executor = executor(&dir);
        let action = ScheduledAction::new("a1", json!({"nope": true}), Utc::now());

        let err = executor.execute(&action, "tok").await.unwrap_err();
        assert!(err.to_string().starts_with("invalid payload"));
    }
}
