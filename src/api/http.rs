//! [`TestRailApi`] implementation over HTTPS.
//!
//! Requests go to `{host}/index.php?/api/v2/{uri}` with JSON bodies. List
//! endpoints are paginated: the response is an object holding the page
//! items and a `_links.next` URI, which is followed until it is null.
//! Attachments are sent as multipart forms with a single `attachment` part.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    ApiError, ApiResult, Attachment, NewCase, NewRun, NewSection, NewSuite, RemoteCase,
    RemoteCaseField, RemoteProject, RemoteResult, RemoteRun, RemoteSection, RemoteSuite,
    RemoteTest, TestRailApi,
};
use crate::config::{Credentials, ServerConfig};
use crate::model::Id;

const API_PATH: &str = "index.php?/api/v2/";
const NEXT_PREFIX: &str = "/api/v2/";

/// Prefix some server versions put in front of the JSON body.
const LEGACY_AUTH_PREFIX: &str = "USER AUTHENTICATION SUCCESSFUL!\n";

/// HTTP client for the remote service.
pub struct HttpApi {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpApi {
    /// Creates a client for `server`.
    ///
    /// A zero `timeout` disables the per-request timeout.
    pub fn new(server: &ServerConfig, timeout: Duration) -> ApiResult<Self> {
        let mut builder = Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ApiError::Connection(e.to_string()))?;

        let mut base_url = server.host.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        base_url.push_str(API_PATH);

        Ok(Self {
            client,
            base_url,
            credentials: server.credentials(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::Basic { username, secret } => request.basic_auth(username, Some(secret)),
            Credentials::Bearer(token) => request.bearer_auth(token),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.authorize(self.client.request(method, url))
            .header(USER_AGENT, concat!("railsync/", env!("CARGO_PKG_VERSION")))
    }

    async fn send(&self, method: Method, uri: &str, body: Option<&Value>) -> ApiResult<Value> {
        let url = format!("{}{}", self.base_url, uri);
        debug!("{} {}", method, url);
        if let Some(body) = body {
            debug!("Request body: {}", body);
        }

        let mut request = self
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(request).await
    }

    async fn send_file(&self, uri: &str, attachment: &Attachment) -> ApiResult<Value> {
        let url = format!("{}{}", self.base_url, uri);
        debug!(
            "POST {} ({}, {} bytes)",
            url,
            attachment.file_name,
            attachment.content.len()
        );

        let part = Part::bytes(attachment.content.clone()).file_name(attachment.file_name.clone());
        let form = Form::new().part("attachment", part);
        self.execute(self.request(Method::POST, &url).multipart(form))
            .await
    }

    async fn execute(&self, request: RequestBuilder) -> ApiResult<Value> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let text = response.text().await.map_err(classify_transport)?;
        let text = text.strip_prefix(LEGACY_AUTH_PREFIX).unwrap_or(&text);
        debug!("Response {}: {}", status.as_u16(), text);

        if !status.is_success() {
            return Err(ApiError::from_status(
                status.as_u16(),
                error_message(text),
                retry_after,
            ));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(text)?)
    }

    async fn get<T: DeserializeOwned>(&self, uri: &str) -> ApiResult<T> {
        let value = self.send(Method::GET, uri, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, uri: &str, body: &B) -> ApiResult<T> {
        let body = serde_json::to_value(body)?;
        let value = self.send(Method::POST, uri, Some(&body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetches every page of a list endpoint. `key` names the items array
    /// inside a paginated page object.
    async fn get_all<T: DeserializeOwned>(&self, uri: &str, key: &str) -> ApiResult<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(uri.to_string());
        while let Some(uri) = next.take() {
            let page = self.send(Method::GET, &uri, None).await?;
            next = merge_page(page, key, &uri, &mut items)?;
        }
        Ok(serde_json::from_value(Value::Array(items))?)
    }
}

/// Appends the items of one list response to `items` and returns the URI
/// of the next page, relative to the API root.
///
/// Older servers answer with a bare array, which is always the last page.
fn merge_page(page: Value, key: &str, uri: &str, items: &mut Vec<Value>) -> ApiResult<Option<String>> {
    match page {
        Value::Array(values) => {
            items.extend(values);
            Ok(None)
        }
        Value::Object(mut object) => {
            match object.remove(key) {
                Some(Value::Array(values)) => items.extend(values),
                _ => {
                    return Err(ApiError::Decode(format!(
                        "Expected '{}' in response to {}",
                        key, uri
                    )));
                }
            }
            Ok(object
                .get("_links")
                .and_then(|links| links.get("next"))
                .and_then(Value::as_str)
                .map(|link| link.strip_prefix(NEXT_PREFIX).unwrap_or(link).to_string()))
        }
        other => Err(ApiError::Decode(format!(
            "Unexpected response to {}: {}",
            uri, other
        ))),
    }
}

/// Reads a `Retry-After` header given in seconds. HTTP dates are ignored.
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_transport(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(err.to_string())
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Connection(err.to_string())
    }
}

/// Extracts the server's `error` field, falling back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl TestRailApi for HttpApi {
    async fn get_projects(&self) -> ApiResult<Vec<RemoteProject>> {
        self.get_all("get_projects", "projects").await
    }

    async fn get_suites(&self, project_id: Id) -> ApiResult<Vec<RemoteSuite>> {
        self.get_all(&format!("get_suites/{}", project_id), "suites")
            .await
    }

    async fn add_suite(&self, project_id: Id, suite: &NewSuite) -> ApiResult<RemoteSuite> {
        self.post(&format!("add_suite/{}", project_id), suite).await
    }

    async fn get_sections(&self, project_id: Id, suite_id: Id) -> ApiResult<Vec<RemoteSection>> {
        self.get_all(
            &format!("get_sections/{}&suite_id={}", project_id, suite_id),
            "sections",
        )
        .await
    }

    async fn add_section(&self, project_id: Id, section: &NewSection) -> ApiResult<RemoteSection> {
        self.post(&format!("add_section/{}", project_id), section)
            .await
    }

    async fn get_case_fields(&self) -> ApiResult<Vec<RemoteCaseField>> {
        self.get("get_case_fields").await
    }

    async fn get_cases(&self, project_id: Id, suite_id: Id) -> ApiResult<Vec<RemoteCase>> {
        self.get_all(
            &format!("get_cases/{}&suite_id={}", project_id, suite_id),
            "cases",
        )
        .await
    }

    async fn add_case(&self, section_id: Id, case: &NewCase) -> ApiResult<RemoteCase> {
        self.post(&format!("add_case/{}", section_id), case).await
    }

    async fn get_run(&self, run_id: Id) -> ApiResult<RemoteRun> {
        self.get(&format!("get_run/{}", run_id)).await
    }

    async fn get_tests(&self, run_id: Id) -> ApiResult<Vec<RemoteTest>> {
        self.get_all(&format!("get_tests/{}", run_id), "tests")
            .await
    }

    async fn add_run(&self, project_id: Id, run: &NewRun) -> ApiResult<RemoteRun> {
        self.post(&format!("add_run/{}", project_id), run).await
    }

    async fn update_run(&self, run_id: Id, case_ids: &[Id]) -> ApiResult<RemoteRun> {
        self.post(
            &format!("update_run/{}", run_id),
            &json!({ "case_ids": case_ids }),
        )
        .await
    }

    async fn add_results_for_cases(&self, run_id: Id, results: &[Value]) -> ApiResult<Vec<RemoteResult>> {
        let created: Option<Vec<RemoteResult>> = self
            .post(
                &format!("add_results_for_cases/{}", run_id),
                &json!({ "results": results }),
            )
            .await?;
        Ok(created.unwrap_or_default())
    }

    async fn add_attachment_to_result(&self, result_id: Id, attachment: &Attachment) -> ApiResult<()> {
        self.send_file(&format!("add_attachment_to_result/{}", result_id), attachment)
            .await?;
        Ok(())
    }

    async fn close_run(&self, run_id: Id) -> ApiResult<RemoteRun> {
        self.post(&format!("close_run/{}", run_id), &json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str) -> ServerConfig {
        ServerConfig {
            host: host.to_string(),
            username: "user@example.com".to_string(),
            password: Some("secret".to_string()),
            api_key: None,
            token: None,
        }
    }

    #[test]
    fn test_base_url_normalized() {
        let api = HttpApi::new(&server("https://example.testrail.io"), Duration::from_secs(30)).unwrap();
        assert_eq!(
            api.base_url,
            "https://example.testrail.io/index.php?/api/v2/"
        );

        let api = HttpApi::new(&server("https://example.testrail.io/"), Duration::ZERO).unwrap();
        assert_eq!(
            api.base_url,
            "https://example.testrail.io/index.php?/api/v2/"
        );
    }

    #[test]
    fn test_error_message_prefers_error_field() {
        assert_eq!(
            error_message(r#"{"error": "Field :project_id is not a valid project."}"#),
            "Field :project_id is not a valid project."
        );
        assert_eq!(error_message(" Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn test_page_follows_next_link() {
        let mut items = Vec::new();
        let page = json!({
            "offset": 0,
            "limit": 250,
            "_links": {"next": "/api/v2/get_cases/1&suite_id=2&limit=250&offset=250", "prev": null},
            "cases": [{"id": 1}, {"id": 2}]
        });
        let next = merge_page(page, "cases", "get_cases/1&suite_id=2", &mut items).unwrap();
        assert_eq!(next.as_deref(), Some("get_cases/1&suite_id=2&limit=250&offset=250"));
        assert_eq!(items.len(), 2);

        let last = json!({"_links": {"next": null}, "cases": [{"id": 3}]});
        let next = merge_page(last, "cases", "get_cases/1", &mut items).unwrap();
        assert_eq!(next, None);
        assert_eq!(items, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
    }

    #[test]
    fn test_bare_array_is_last_page() {
        let mut items = vec![json!({"id": 1})];
        let next = merge_page(json!([{"id": 2}]), "projects", "get_projects", &mut items).unwrap();
        assert_eq!(next, None);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_page_without_items_is_decode_error() {
        let mut items = Vec::new();
        let err = merge_page(json!({"sections": []}), "cases", "get_cases/1", &mut items).unwrap_err();
        assert!(matches!(err, ApiError::Decode(msg) if msg.contains("'cases'")));

        let err = merge_page(json!("nope"), "cases", "get_cases/1", &mut items).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(parse_retry_after(Some("5")), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(Some(" 12 ")), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
