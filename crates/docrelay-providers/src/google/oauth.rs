//! Google authorization and token endpoints.

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::endpoint::{BoxFuture, TokenEndpoint, TokenGrant};
use crate::error::{ProviderError, ProviderResult, from_transport};
use crate::pkce::PkceFlow;

use super::config::GoogleConfig;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Google OAuth client.
#[derive(Debug)]
pub struct OAuthClient {
    config: GoogleConfig,
    http: reqwest::Client,
    auth_url: Url,
    token_url: String,
}

impl OAuthClient {
    /// Creates a client for the given configuration.
    pub fn new(config: GoogleConfig) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::configuration("failed to build HTTP client").with_source(e))?;
        let auth_url = Url::parse(GOOGLE_AUTH_URL)
            .map_err(|e| ProviderError::configuration(format!("invalid authorization URL: {e}")))?;
        Ok(Self {
            config,
            http,
            auth_url,
            token_url: GOOGLE_TOKEN_URL.to_string(),
        })
    }

    /// Points token requests at a different URL.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    async fn post_token(&self, params: &[(&str, &str)], context: &str) -> ProviderResult<TokenGrant> {
        let response = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| from_transport(context, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| from_transport(context, e))?;

        if !status.is_success() {
            return Err(classify_rejection(status, &body, context));
        }
        parse_grant(&body)
    }
}

impl TokenEndpoint for OAuthClient {
    fn scopes(&self) -> &[String] {
        &self.config.scopes
    }

    fn authorization_url(&self, pkce: &PkceFlow, redirect_uri: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.credentials.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &pkce.state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("include_granted_scopes", "true");
        url.into()
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
        Box::pin(async move {
            debug!("Exchanging grant code");
            let credentials = &self.config.credentials;
            let grant = self
                .post_token(
                    &[
                        ("client_id", credentials.client_id.as_str()),
                        ("client_secret", credentials.client_secret.as_str()),
                        ("code", code),
                        ("code_verifier", verifier),
                        ("grant_type", "authorization_code"),
                        ("redirect_uri", redirect_uri),
                    ],
                    "token exchange",
                )
                .await?;
            info!(
                has_refresh_token = grant.refresh_token.is_some(),
                "Grant code exchanged"
            );
            Ok(grant)
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ProviderResult<TokenGrant>> {
        Box::pin(async move {
            let credentials = &self.config.credentials;
            self.post_token(
                &[
                    ("client_id", credentials.client_id.as_str()),
                    ("client_secret", credentials.client_secret.as_str()),
                    ("refresh_token", refresh_token),
                    ("grant_type", "refresh_token"),
                ],
                "token refresh",
            )
            .await
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn parse_grant(body: &str) -> ProviderResult<TokenGrant> {
    let response: TokenResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::invalid_response(format!("malformed token response: {e}"))
    })?;
    if response.access_token.is_empty() {
        return Err(ProviderError::invalid_response(
            "token response has an empty access_token",
        ));
    }
    Ok(TokenGrant {
        access_token: response.access_token,
        refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
        expires_in: response.expires_in,
        scopes: response
            .scope
            .map(|s| s.split_whitespace().map(String::from).collect()),
    })
}

/// Classifies a non-2xx token endpoint response.
///
/// 4xx means the code or refresh token was refused; 429 and 5xx are transient.
fn classify_rejection(status: StatusCode, body: &str, context: &str) -> ProviderError {
    let detail = match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => match err.error_description {
            Some(description) => format!("{}: {description}", err.error),
            None => err.error,
        },
        Err(_) => body.trim().chars().take(200).collect(),
    };
    let message = format!("{context} failed ({status}): {detail}");

    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::rate_limited(message)
    } else if status.is_server_error() {
        ProviderError::server(message)
    } else {
        ProviderError::authentication(message)
    }
}
