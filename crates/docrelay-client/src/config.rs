//! Client and daemon configuration.
//!
//! All settings live in a single `config.toml`, by default
//! `~/.config/docrelay/config.toml`.
//!
//! `client_id` and `client_secret` accept secret references
//! (`pass::path/in/store`, `env::VAR`), see [`crate::secret`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use docrelay_providers::google::{DEFAULT_SCOPES, GoogleConfig, OAuthCredentials};
use docrelay_server::SchedulerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Configuration for the `docrelay` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Google OAuth settings.
    pub google: GoogleSettings,

    /// Deferred action scheduler settings.
    pub scheduler: SchedulerSettings,

    /// Socket settings shared by the daemon and the commands.
    pub server: ServerSettings,
}

/// Google OAuth client and loopback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleSettings {
    /// OAuth client id (supports `pass::` and `env::`).
    pub client_id: Option<String>,

    /// OAuth client secret (supports `pass::` and `env::`).
    pub client_secret: Option<String>,

    /// Scopes requested during authorization.
    pub scopes: Vec<String>,

    /// Where the credential is persisted.
    pub token_path: Option<PathBuf>,

    pub loopback_port_start: u16,
    pub loopback_port_end: u16,

    /// Timeout for token endpoint and action calls, in seconds.
    pub timeout_secs: u64,

    /// How long the consent page may stay open, in seconds.
    pub callback_timeout_secs: u64,

    /// Launch the system browser for the consent page.
    pub open_browser: bool,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            token_path: None,
            loopback_port_start: 8080,
            loopback_port_end: 8090,
            timeout_secs: GoogleConfig::DEFAULT_TIMEOUT_SECS,
            callback_timeout_secs: GoogleConfig::DEFAULT_CALLBACK_TIMEOUT_SECS,
            open_browser: true,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,

    /// Action table location.
    pub actions_path: Option<PathBuf>,

    /// Overdue actions older than this are failed instead of fired.
    pub misfire_grace_secs: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            actions_path: None,
            misfire_grace_secs: None,
        }
    }
}

/// Socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path to the daemon socket.
    pub socket_path: Option<PathBuf>,

    /// Request timeout in seconds.
    ///
    /// CHECK_TOKEN may wait on a refresh round trip, so this stays above the
    /// Google timeout.
    pub timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout: 35,
        }
    }
}

impl ClientConfig {
    /// Loads the default file, or defaults when it does not exist.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docrelay")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docrelay")
    }

    /// Socket path: explicit override, then the file, then the runtime default.
    pub fn socket_path(&self, cli_override: Option<&Path>) -> PathBuf {
        cli_override
            .map(Path::to_path_buf)
            .or_else(|| self.server.socket_path.clone())
            .unwrap_or_else(docrelay_server::default_socket_path)
    }

    /// Request timeout: explicit override, then the file.
    pub fn request_timeout(&self, cli_override: Option<u64>) -> Duration {
        Duration::from_secs(cli_override.unwrap_or(self.server.timeout))
    }

    pub fn actions_path(&self) -> PathBuf {
        self.scheduler
            .actions_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("actions.jsonl"))
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(Duration::from_secs(self.scheduler.sweep_interval_secs.max(1)))
            .with_misfire_grace(self.scheduler.misfire_grace_secs.map(Duration::from_secs))
    }
}

impl GoogleSettings {
    /// Builds the provider configuration.
    ///
    /// `client_id`/`client_secret` given on the command line take precedence
    /// over the file. Both go through secret resolution.
    pub fn to_provider_config(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> ClientResult<GoogleConfig> {
        let credentials = self.resolve_credentials(client_id, client_secret)?;
        credentials
            .validate()
            .map_err(|e| ClientError::Config(format!("invalid Google credentials: {e}")))?;

        if self.loopback_port_start > self.loopback_port_end {
            return Err(ClientError::Config(format!(
                "loopback_port_start ({}) is above loopback_port_end ({})",
                self.loopback_port_start, self.loopback_port_end
            )));
        }
        if self.scopes.is_empty() {
            return Err(ClientError::Config("[google] scopes must not be empty".into()));
        }

        let mut config = GoogleConfig::new(credentials)
            .with_scopes(self.scopes.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_loopback_port_range(self.loopback_port_start, self.loopback_port_end)
            .with_callback_timeout(Duration::from_secs(self.callback_timeout_secs))
            .with_open_browser(self.open_browser);

        if let Some(ref path) = self.token_path {
            config = config.with_token_path(path);
        }

        Ok(config)
    }

    pub(crate) fn resolve_credentials(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> ClientResult<OAuthCredentials> {
        let raw_id = client_id
            .or(self.client_id.as_deref())
            .ok_or_else(|| {
                ClientError::Config(format!(
                    "Google client id not found. Add to {}:\n  \
                     [google]\n  \
                     client_id = \"YOUR_ID.apps.googleusercontent.com\"\n  \
                     client_secret = \"env::GOOGLE_CLIENT_SECRET\"\n\n  \
                     or pass --client-id / set GOOGLE_CLIENT_ID",
                    ClientConfig::default_path().display()
                ))
            })?;
        let raw_secret = client_secret
            .or(self.client_secret.as_deref())
            .ok_or_else(|| {
                ClientError::Config("client_secret is missing from the [google] section".into())
            })?;

        let id = crate::secret::resolve(raw_id)
            .map_err(|e| ClientError::Config(format!("failed to resolve client_id: {e}")))?;
        let secret = crate::secret::resolve(raw_secret)
            .map_err(|e| ClientError::Config(format!("failed to resolve client_secret: {e}")))?;

        Ok(OAuthCredentials::new(id, secret))
    }
}
