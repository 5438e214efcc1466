//! Configuration loading and schema definitions for railsync.
//!
//! This module provides types and functions for loading railsync
//! configuration from TOML files or strings, applying secrets from the
//! environment, and validating the result before any network call is made.

pub mod schema;

pub use schema::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::api::RetryPolicy;

/// Environment variable overriding `server.password`.
pub const ENV_PASSWORD: &str = "RAILSYNC_PASSWORD";
/// Environment variable overriding `server.api_key`.
pub const ENV_API_KEY: &str = "RAILSYNC_API_KEY";
/// Environment variable overriding `server.token`.
pub const ENV_TOKEN: &str = "RAILSYNC_TOKEN";

/// Loads railsync configuration from a TOML file.
///
/// Secrets found in the environment replace the ones in the file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use railsync::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("railsync.toml"))?;
/// println!("Batch size: {}", config.upload.batch_size);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    apply_env(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Loads railsync configuration from a TOML string.
///
/// The environment is not consulted.
///
/// # Example
///
/// ```
/// use railsync::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [server]
///     host = "https://example.testrail.io"
///     username = "ci@example.com"
///     api_key = "secret"
///
///     [project]
///     name = "Checkout"
/// "#)?;
///
/// assert_eq!(config.upload.batch_size, 50);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Replaces configured secrets with values returned by `lookup`.
pub fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
    if let Some(password) = non_empty(ENV_PASSWORD) {
        config.server.password = Some(password);
    }
    if let Some(api_key) = non_empty(ENV_API_KEY) {
        config.server.api_key = Some(api_key);
    }
    if let Some(token) = non_empty(ENV_TOKEN) {
        config.server.token = Some(token);
    }
}

/// Checks the settings that cannot be expressed in the schema.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.host.trim().is_empty() {
        bail!("server.host must not be empty");
    }
    if !config.server.has_secret() {
        bail!(
            "No credentials configured: set server.password, server.api_key or server.token (or {}, {}, {})",
            ENV_PASSWORD,
            ENV_API_KEY,
            ENV_TOKEN
        );
    }
    if config.server.token.is_none() && config.server.username.trim().is_empty() {
        bail!("server.username is required for basic authentication");
    }
    if config.project.name.trim().is_empty() && config.project.id.is_none() {
        bail!("project.name must not be empty");
    }
    if config.upload.batch_size < 2 {
        bail!(
            "upload.batch_size must be at least 2 (got {})",
            config.upload.batch_size
        );
    }
    if config.upload.result_workers == 0 {
        bail!("upload.result_workers must be at least 1");
    }
    if config.upload.case_workers == 0 {
        bail!("upload.case_workers must be at least 1");
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be at least 1");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
    }
    Ok(())
}

impl Config {
    /// Retry policy described by `[retry]`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    /// Per-request timeout. Zero disables it.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.timeout_secs)
    }
}
