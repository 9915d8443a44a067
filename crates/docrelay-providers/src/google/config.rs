//! Google OAuth configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Scopes requested by default.
pub const DEFAULT_SCOPES: [&str; 4] = [
    "https://www.googleapis.com/auth/spreadsheets.readonly",
    "https://www.googleapis.com/auth/documents",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/drive.readonly",
];

/// OAuth client id and secret registered in the Google Cloud Console.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Checks that both values look plausible.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.client_id.is_empty() {
            return Err("client_id is required");
        }
        if !self.client_id.ends_with(".apps.googleusercontent.com") {
            return Err("client_id should end with .apps.googleusercontent.com");
        }
        if self.client_secret.is_empty() {
            return Err("client_secret is required");
        }
        Ok(())
    }
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Settings for the Google endpoint and loopback surface.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub credentials: OAuthCredentials,

    /// Where the credential is persisted.
    ///
    /// Defaults to `~/.local/share/docrelay/google-credential.json`.
    pub token_path: PathBuf,

    pub scopes: Vec<String>,

    /// Timeout for token endpoint and API requests.
    pub timeout: Duration,

    /// Ports tried, in order, for the loopback redirect listener.
    pub loopback_port_range: (u16, u16),

    /// How long the loopback surface waits for the redirect before it
    /// reports itself closed.
    pub callback_timeout: Duration,

    /// Whether the loopback surface launches the system browser.
    pub open_browser: bool,
}

impl GoogleConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;

    pub fn new(credentials: OAuthCredentials) -> Self {
        Self {
            credentials,
            token_path: Self::default_token_path(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            loopback_port_range: (8080, 8090),
            callback_timeout: Duration::from_secs(Self::DEFAULT_CALLBACK_TIMEOUT_SECS),
            open_browser: true,
        }
    }

    /// Returns the default credential path.
    pub fn default_token_path() -> PathBuf {
        dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docrelay")
            .join("google-credential.json")
    }

    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_loopback_port_range(mut self, start: u16, end: u16) -> Self {
        self.loopback_port_range = (start, end);
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn with_open_browser(mut self, open: bool) -> Self {
        self.open_browser = open;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GoogleConfig::new(OAuthCredentials::new("id", "secret"));
        assert_eq!(config.scopes.len(), 4);
        assert!(config.scopes[2].ends_with("gmail.send"));
        assert_eq!(config.loopback_port_range, (8080, 8090));
        assert!(config.token_path.ends_with("docrelay/google-credential.json"));
    }

    #[test]
    fn validate_client_id() {
        assert!(OAuthCredentials::new("", "s").validate().is_err());
        assert!(OAuthCredentials::new("abc", "s").validate().is_err());
        assert!(
            OAuthCredentials::new("abc.apps.googleusercontent.com", "")
                .validate()
                .is_err()
        );
        assert!(
            OAuthCredentials::new("abc.apps.googleusercontent.com", "s")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let creds = OAuthCredentials::new("abc.apps.googleusercontent.com", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
