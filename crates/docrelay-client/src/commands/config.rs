//! `docrelay config`: inspect the configuration file.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Prints the effective configuration.
///
/// A literal client secret is masked; secret references are shown as-is.
pub fn dump(config: &ClientConfig) -> ClientResult<()> {
    let mut shown = config.clone();
    shown.google.client_secret = shown.google.client_secret.map(|s| mask(&s));

    let toml_str = toml::to_string_pretty(&shown)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {e}")))?;
    println!("# {}", ClientConfig::default_path().display());
    println!("{toml_str}");
    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.starts_with("pass::") || secret.starts_with("env::") {
        secret.to_string()
    } else {
        "<redacted>".to_string()
    }
}

/// Checks that the daemon could start with this configuration.
pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    config.google.to_provider_config(None, None)?;
    println!("Google credentials are valid.");

    if config.scheduler.sweep_interval_secs == 0 {
        return Err(ClientError::Config(
            "[scheduler] sweep_interval_secs must be at least 1".into(),
        ));
    }

    println!("Configuration is valid.");
    Ok(())
}

/// Shows the configuration file path.
pub fn path() -> ClientResult<()> {
    println!("config: {}", ClientConfig::default_path().display());
    Ok(())
}
