//! Bearer-token HTTP wrapper for downstream API calls.
//!
//! A `401` from the downstream API drops the stored credential (which fires
//! the refresher's invalidation hook) and fails the call. The call is not
//! retried with a refreshed token.

use std::sync::Arc;
use std::time::Duration;

use docrelay_core::AuthFailure;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult, from_transport};
use crate::refresher::{CredentialRefresher, TokenResolution};

/// An authorized HTTP call, as carried in an action payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedRequest {
    /// HTTP method, e.g. `POST`.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl AuthorizedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct AuthorizedResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP client that attaches the current access token.
#[derive(Debug, Clone)]
pub struct AuthorizedClient {
    http: reqwest::Client,
    refresher: Arc<CredentialRefresher>,
}

impl AuthorizedClient {
    /// Creates a client with the given request timeout.
    pub fn new(refresher: Arc<CredentialRefresher>, timeout: Duration) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::configuration("failed to build HTTP client").with_source(e))?;
        Ok(Self { http, refresher })
    }

    /// Sends `request` with a token obtained from the refresher.
    pub async fn send(&self, request: &AuthorizedRequest) -> ProviderResult<AuthorizedResponse> {
        let token = match self.refresher.resolve().await? {
            TokenResolution::Valid(token) => token,
            TokenResolution::NotAuthenticated => {
                return Err(ProviderError::authentication(
                    AuthFailure::NoCredential.to_string(),
                ));
            }
            TokenResolution::Revoked(reason) => return Err(ProviderError::authentication(reason)),
            TokenResolution::Unavailable(reason) => return Err(ProviderError::network(reason)),
        };
        self.send_with_token(&token, request, None).await
    }

    /// Sends `request` with an already obtained token.
    ///
    /// `idempotency_key` is sent as the `Idempotency-Key` header.
    pub async fn send_with_token(
        &self,
        token: &str,
        request: &AuthorizedRequest,
        idempotency_key: Option<&str>,
    ) -> ProviderResult<AuthorizedResponse> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ProviderError::bad_request(format!("invalid method {}", request.method)))?;
        let url = url::Url::parse(&request.url)
            .map_err(|e| ProviderError::bad_request(format!("invalid url {}: {e}", request.url)))?;

        let mut builder = self.http.request(method, url).bearer_auth(token);
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, "Sending authorized request");
        let response = builder
            .send()
            .await
            .map_err(|e| from_transport("authorized request failed", e))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!(url = %request.url, "Access token rejected");
            self.refresher
                .invalidate("access token rejected by the API (401)")?;
            return Err(ProviderError::authentication("access token rejected (401)"));
        }

        let body = response
            .text()
            .await
            .map_err(|e| from_transport("failed to read response body", e))?;
        classify_status(status, &body)?;
        Ok(AuthorizedResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// Maps a non-success downstream status onto a provider error.
fn classify_status(status: StatusCode, body: &str) -> ProviderResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("API error ({status}): {}", body.trim());
    Err(match status {
        StatusCode::UNAUTHORIZED => ProviderError::authentication(message),
        StatusCode::FORBIDDEN => ProviderError::authorization(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::rate_limited(message),
        s if s.is_server_error() => ProviderError::server(message),
        _ => ProviderError::bad_request(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use docrelay_core::Credential;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::endpoint::{BoxFuture, TokenEndpoint, TokenGrant};
    use crate::pkce::PkceFlow;
    use crate::{CredentialStore, ProviderErrorCode};

    struct NoRefresh;

    impl TokenEndpoint for NoRefresh {
        fn scopes(&self) -> &[String] {
            &[]
        }

        fn authorization_url(&self, _pkce: &PkceFlow, redirect_uri: &str) -> String {
            redirect_uri.to_string()
        }

        fn exchange_code<'a>(
            &'a self,
            _code: &'a str,
            _verifier: &'a str,
            _redirect_uri: &'a str,
        ) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
            Box::pin(async { Err(ProviderError::internal("unused")) })
        }

        fn refresh<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
            Box::pin(async { Err(ProviderError::internal("unused")) })
        }
    }

    /// Serves one HTTP response and hands back the raw request head.
    async fn serve_once(status_line: &'static str) -> (String, oneshot::Receiver<String>) {
        serve_raw(format!(
            "HTTP/1.1 {status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
        ))
        .await
    }

    async fn serve_raw(response: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        });
        (format!("http://{addr}/send"), rx)
    }

    fn client_with_credential(dir: &TempDir, fired: Arc<AtomicUsize>) -> AuthorizedClient {
        let store = Arc::new(CredentialStore::new(dir.path().join("credential.json")));
        store
            .save(&Credential::new("tok", Some("R".into()), Some(3600), vec![]))
            .unwrap();
        let refresher = CredentialRefresher::new(store, Arc::new(NoRefresh))
            .with_invalidation_hook(Arc::new(move |_: &str| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        AuthorizedClient::new(Arc::new(refresher), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn sends_bearer_and_idempotency_key() {
        let dir = TempDir::new().unwrap();
        let client = client_with_credential(&dir, Arc::new(AtomicUsize::new(0)));
        let (url, head) = serve_once("200 OK").await;

        let request = AuthorizedRequest::new("post", url).with_body(serde_json::json!({"a": 1}));
        let response = client.send_with_token("tok", &request, Some("act-1")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");

        let head = head.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("post /send"));
        assert!(head.contains("authorization: bearer tok"));
        assert!(head.contains("idempotency-key: act-1"));
    }

    #[tokio::test]
    async fn unauthorized_clears_credential() {
        let dir = TempDir::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let client = client_with_credential(&dir, fired.clone());
        let (url, _head) = serve_once("401 Unauthorized").await;

        let err = client
            .send(&AuthorizedRequest::new("GET", url))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthenticationFailed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(client.refresher.store().load().unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let dir = TempDir::new().unwrap();
        let client = client_with_credential(&dir, Arc::new(AtomicUsize::new(0)));
        let (url, _head) = serve_raw(
            "HTTP/1.1 200 OK\r\nContent-Length: 64\r\nConnection: close\r\n\r\npartial".into(),
        )
        .await;

        let err = client
            .send_with_token("tok", &AuthorizedRequest::new("GET", url), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn send_without_credential_fails_fast() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("none.json")));
        let refresher = Arc::new(CredentialRefresher::new(store, Arc::new(NoRefresh)));
        let client = AuthorizedClient::new(refresher, Duration::from_secs(1)).unwrap();

        let err = client
            .send(&AuthorizedRequest::new("GET", "http://127.0.0.1:9/"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthenticationFailed);
    }

    #[test]
    fn request_payload_shape() {
        let request: AuthorizedRequest = serde_json::from_value(serde_json::json!({
            "method": "POST",
            "url": "https://gmail.googleapis.com/gmail/v1/users/me/messages/send",
            "body": {"raw": "abc"}
        }))
        .unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, Some(serde_json::json!({"raw": "abc"})));

        let bare: AuthorizedRequest =
            serde_json::from_str(r#"{"method":"GET","url":"https://example.com"}"#).unwrap();
        assert!(bare.body.is_none());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK, "").is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT, "").is_ok());

        let cases = [
            (StatusCode::FORBIDDEN, ProviderErrorCode::AuthorizationFailed),
            (StatusCode::TOO_MANY_REQUESTS, ProviderErrorCode::RateLimited),
            (StatusCode::BAD_GATEWAY, ProviderErrorCode::ServerError),
            (StatusCode::BAD_REQUEST, ProviderErrorCode::BadRequest),
        ];
        for (status, code) in cases {
            assert_eq!(classify_status(status, "x").unwrap_err().code(), code);
        }
    }
}
