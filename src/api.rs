//! Remote entity client for the TestRail REST API.
//!
//! This module defines the [`TestRailApi`] trait, the single seam between the
//! reconciliation engine and the remote service, together with the wire
//! types it exchanges and the [`ApiError`] classification the retry policy
//! depends on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Resolver / BatchScheduler                    │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ RetryPolicy::run(op)
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TestRailApi                            │
//! │                                                               │
//! │  get_projects / get_suites / add_suite                        │
//! │  get_sections / add_section                                   │
//! │  get_case_fields / get_cases / add_case                       │
//! │  get_run / get_tests / add_run / update_run / close_run       │
//! │  add_results_for_cases / add_attachment_to_result             │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │
//!                                 ▼
//!                    HttpApi (reqwest, JSON bodies)
//! ```
//!
//! # Error Classification
//!
//! | Variant | Retried | Fatal for the run |
//! |---------|---------|-------------------|
//! | `Timeout` | yes | no |
//! | `Connection` | yes | no |
//! | `RateLimited` (429) | yes, honoring `Retry-After` | no |
//! | `ServerError` (5xx) | yes | no |
//! | `ClientError` (4xx) | no | no |
//! | `AuthError` (401/403) | no | yes |
//! | `Decode` | no | no |

pub mod http;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::Id;

pub use http::HttpApi;
pub use retry::RetryPolicy;

/// Custom case fields that carry the automation id, in lookup order.
pub const AUTOMATION_ID_FIELDS: [&str; 2] = ["custom_automation_id", "custom_case_automation_id"];

/// Result type for remote API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Classified failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No response arrived within the configured per-request timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP 429. `retry_after` carries the server's wait hint if present.
    #[error("Rate limited by server{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// HTTP 4xx other than 401, 403 and 429.
    #[error("Client error {status}: {message}")]
    ClientError { status: u16, message: String },

    /// HTTP 401 or 403. No later call can succeed with the same credentials.
    #[error("Authentication failed ({status}): {message}")]
    AuthError { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("Invalid response: {0}")]
    Decode(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl ApiError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ApiError::AuthError { status, message },
            429 => ApiError::RateLimited { retry_after },
            500..=599 => ApiError::ServerError { status, message },
            _ => ApiError::ClientError { status, message },
        }
    }

    /// Returns `true` if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout(_)
                | ApiError::Connection(_)
                | ApiError::RateLimited { .. }
                | ApiError::ServerError { .. }
        )
    }

    /// Returns `true` if the whole invocation must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::AuthError { .. })
    }

    /// Short machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Timeout(_) => "timeout",
            ApiError::Connection(_) => "connection",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::ServerError { .. } => "server_error",
            ApiError::ClientError { .. } => "client_error",
            ApiError::AuthError { .. } => "auth_error",
            ApiError::Decode(_) => "decode",
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// A remote project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProject {
    pub id: Id,
    pub name: String,
    /// 1 = single suite, 2 = single suite with baselines, 3 = multiple suites.
    #[serde(default = "default_suite_mode")]
    pub suite_mode: u8,
}

fn default_suite_mode() -> u8 {
    1
}

/// A remote suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSuite {
    pub id: Id,
    pub name: String,
}

/// A remote section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSection {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub suite_id: Option<Id>,
    #[serde(default)]
    pub parent_id: Option<Id>,
}

/// A remote case. Custom fields are kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCase {
    pub id: Id,
    pub title: String,
    #[serde(default)]
    pub section_id: Option<Id>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RemoteCase {
    /// Raw automation id value, from the first populated automation field.
    pub fn automation_id(&self) -> Option<&str> {
        AUTOMATION_ID_FIELDS
            .iter()
            .filter_map(|name| self.fields.get(*name))
            .find_map(Value::as_str)
    }
}

/// A custom case field definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCaseField {
    pub system_name: String,
}

/// A remote run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRun {
    pub id: Id,
    #[serde(default)]
    pub suite_id: Option<Id>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub include_all: bool,
    #[serde(default)]
    pub is_completed: bool,
}

/// A test: one case included in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTest {
    pub id: Id,
    pub case_id: Id,
}

/// A result created by `add_results_for_cases`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub id: Id,
    #[serde(default)]
    pub test_id: Option<Id>,
}

/// A file attached to a created result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// Body of `add_suite`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSuite {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Body of `add_section`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSection {
    pub suite_id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Body of `add_case`. Custom fields are flattened into the body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewCase {
    pub title: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Body of `add_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRun {
    pub suite_id: Id,
    pub name: String,
    pub description: String,
    pub include_all: bool,
    pub case_ids: Vec<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<Id>,
    #[serde(rename = "assignedto_id", skip_serializing_if = "Option::is_none")]
    pub assigned_to_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<String>,
}

/// Operations the reconciliation engine needs from the remote service.
///
/// Each method issues exactly one logical request (list endpoints may follow
/// pagination links internally). Implementations must not retry; retrying is
/// the job of [`RetryPolicy`].
#[async_trait]
pub trait TestRailApi: Send + Sync {
    async fn get_projects(&self) -> ApiResult<Vec<RemoteProject>>;

    async fn get_suites(&self, project_id: Id) -> ApiResult<Vec<RemoteSuite>>;

    async fn add_suite(&self, project_id: Id, suite: &NewSuite) -> ApiResult<RemoteSuite>;

    async fn get_sections(&self, project_id: Id, suite_id: Id) -> ApiResult<Vec<RemoteSection>>;

    async fn add_section(&self, project_id: Id, section: &NewSection) -> ApiResult<RemoteSection>;

    async fn get_case_fields(&self) -> ApiResult<Vec<RemoteCaseField>>;

    async fn get_cases(&self, project_id: Id, suite_id: Id) -> ApiResult<Vec<RemoteCase>>;

    async fn add_case(&self, section_id: Id, case: &NewCase) -> ApiResult<RemoteCase>;

    async fn get_run(&self, run_id: Id) -> ApiResult<RemoteRun>;

    /// Tests of a run, one per included case.
    async fn get_tests(&self, run_id: Id) -> ApiResult<Vec<RemoteTest>>;

    async fn add_run(&self, project_id: Id, run: &NewRun) -> ApiResult<RemoteRun>;

    /// Replaces the run's case selection.
    async fn update_run(&self, run_id: Id, case_ids: &[Id]) -> ApiResult<RemoteRun>;

    /// Submits one batch of result bodies. The batch is accepted or rejected as a whole.
    async fn add_results_for_cases(&self, run_id: Id, results: &[Value]) -> ApiResult<Vec<RemoteResult>>;

    /// Uploads one file as a multipart `attachment` part.
    async fn add_attachment_to_result(&self, result_id: Id, attachment: &Attachment) -> ApiResult<()>;

    async fn close_run(&self, run_id: Id) -> ApiResult<RemoteRun>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ApiError::from_status(401, "no", None),
            ApiError::AuthError { status: 401, .. }
        ));
        assert!(matches!(
            ApiError::from_status(403, "no", None),
            ApiError::AuthError { .. }
        ));
        assert!(matches!(
            ApiError::from_status(429, "", Some(Duration::from_secs(3))),
            ApiError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            ApiError::from_status(502, "bad gateway", None),
            ApiError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            ApiError::from_status(400, "Field :title is required", None),
            ApiError::ClientError { status: 400, .. }
        ));
    }

    #[test]
    fn test_retryable_and_fatal() {
        assert!(ApiError::Timeout("t".into()).is_retryable());
        assert!(ApiError::RateLimited { retry_after: None }.is_retryable());
        assert!(ApiError::from_status(500, "", None).is_retryable());
        assert!(!ApiError::from_status(404, "", None).is_retryable());
        assert!(!ApiError::from_status(401, "", None).is_retryable());
        assert!(ApiError::from_status(401, "", None).is_fatal());
        assert!(!ApiError::from_status(500, "", None).is_fatal());
    }

    #[test]
    fn test_remote_case_automation_id() {
        let case: RemoteCase = serde_json::from_str(
            r#"{"id": 4, "title": "t", "section_id": 2, "custom_case_automation_id": "a.b"}"#,
        )
        .unwrap();
        assert_eq!(case.automation_id(), Some("a.b"));

        let case: RemoteCase =
            serde_json::from_str(r#"{"id": 4, "title": "t", "custom_automation_id": null}"#).unwrap();
        assert_eq!(case.automation_id(), None);
    }

    #[test]
    fn test_new_run_body() {
        let run = NewRun {
            suite_id: 3,
            name: "Nightly".into(),
            description: String::new(),
            include_all: false,
            case_ids: vec![1, 2],
            milestone_id: None,
            assigned_to_id: Some(7),
            refs: None,
        };
        let body = serde_json::to_value(&run).unwrap();
        assert_eq!(body["assignedto_id"], 7);
        assert!(body.get("milestone_id").is_none());
        assert_eq!(body["case_ids"], serde_json::json!([1, 2]));
    }
}
