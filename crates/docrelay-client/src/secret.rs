//! Secret references in configuration values.
//!
//! `client_id` and `client_secret` may name where the value lives instead of
//! holding it:
//!
//! - `pass::path/in/store` reads the first line of `pass show path/in/store`
//! - `env::VAR` reads `$VAR`
//!
//! Anything else is taken literally.

use std::process::Command;

use thiserror::Error;

/// A secret reference that could not be resolved.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("`pass show {path}` failed: {reason}")]
    Pass { path: String, reason: String },

    #[error("`pass show {path}` printed nothing")]
    EmptyPass { path: String },

    #[error("environment variable `{0}` is not set")]
    MissingEnv(String),
}

/// Resolves `value`, following a `pass::` or `env::` reference.
pub fn resolve(value: &str) -> Result<String, SecretError> {
    if let Some(path) = value.strip_prefix("pass::") {
        from_pass(path)
    } else if let Some(var) = value.strip_prefix("env::") {
        std::env::var(var).map_err(|_| SecretError::MissingEnv(var.to_string()))
    } else {
        Ok(value.to_string())
    }
}

fn from_pass(path: &str) -> Result<String, SecretError> {
    let output = Command::new("pass")
        .args(["show", path])
        .output()
        .map_err(|e| SecretError::Pass {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(SecretError::Pass {
            path: path.to_string(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| SecretError::EmptyPass {
            path: path.to_string(),
        })
}
