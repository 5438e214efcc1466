//! Configuration schema definitions for railsync.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ServerConfig      - Host and credentials
//! ├── ProjectConfig     - Target project and suite
//! ├── UploadConfig      - Batching, timeouts, worker pools, creation policy
//! ├── RetrySettings     - Attempts and backoff bounds
//! ├── RunConfig         - Run title, reuse, close, metadata
//! └── FieldsConfig      - Global custom case/result fields
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{Fields, Id};
use crate::resolve::MatchStrategy;

/// Root configuration structure for railsync.
///
/// # TOML Structure
///
/// ```toml
/// [server]
/// host = "https://example.testrail.io"
/// username = "ci@example.com"
/// api_key = "..."
///
/// [project]
/// name = "Checkout"
/// suite_name = "Regression"
///
/// [upload]
/// batch_size = 50
/// auto_create = "yes"
///
/// [run]
/// title = "Nightly"
/// close_run = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,

    pub project: ProjectConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub fields: FieldsConfig,
}

/// Remote host and credentials.
///
/// Exactly one of `password`, `api_key` or `token` is used, in the order
/// `token`, `api_key`, `password`. Secrets may be supplied through
/// `RAILSYNC_TOKEN`, `RAILSYNC_API_KEY` and `RAILSYNC_PASSWORD` instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Base URL of the instance, e.g. `https://example.testrail.io`.
    pub host: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Bearer token. Replaces basic authentication when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// How requests are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, secret: String },
    Bearer(String),
}

impl ServerConfig {
    /// Returns the credentials requests should carry.
    pub fn credentials(&self) -> Credentials {
        if let Some(token) = &self.token {
            return Credentials::Bearer(token.clone());
        }
        let secret = self
            .api_key
            .clone()
            .or_else(|| self.password.clone())
            .unwrap_or_default();
        Credentials::Basic {
            username: self.username.clone(),
            secret,
        }
    }

    /// Returns `true` if some secret is configured.
    pub fn has_secret(&self) -> bool {
        self.token.is_some() || self.api_key.is_some() || self.password.is_some()
    }
}

/// Target project and suite.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    pub name: String,

    /// Selects one project when several share `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_id: Option<Id>,

    /// Suite to find or create in multi-suite projects. Falls back to the
    /// input model's suite name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_name: Option<String>,
}

/// Answer to "create the missing entity?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoCreate {
    Yes,
    No,
}

/// Upload tuning and resolution policy.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `batch_size` | 50 (minimum 2) |
/// | `timeout_secs` | 30 (0 disables) |
/// | `result_workers` | 10 |
/// | `case_workers` | 5 |
/// | `auto_create` | unset (prompt) |
/// | `case_matcher` | `auto` |
/// | `verify` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_result_workers")]
    pub result_workers: usize,

    #[serde(default = "default_case_workers")]
    pub case_workers: usize,

    /// Unset means every missing category is confirmed interactively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_create: Option<AutoCreate>,

    #[serde(default)]
    pub case_matcher: MatchStrategy,

    /// Check that created entities echo the submitted name.
    #[serde(default)]
    pub verify: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            timeout_secs: default_timeout(),
            result_workers: default_result_workers(),
            case_workers: default_case_workers(),
            auto_create: None,
            case_matcher: MatchStrategy::default(),
            verify: false,
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_timeout() -> u64 {
    30
}

fn default_result_workers() -> usize {
    10
}

fn default_case_workers() -> usize {
    5
}

/// Retry bounds for every remote call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

/// Run creation and reuse.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunConfig {
    /// Title of a newly created run. Defaults to a timestamped title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Existing run to add results to instead of creating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Id>,

    #[serde(default)]
    pub close_run: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<Id>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<Id>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<String>,

    /// Include every case of the suite instead of only the reported ones.
    #[serde(default)]
    pub include_all: bool,
}

/// Custom fields merged into every case and result. Per-entity values win.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FieldsConfig {
    #[serde(default)]
    pub case: Fields,

    #[serde(default)]
    pub result: Fields,
}
