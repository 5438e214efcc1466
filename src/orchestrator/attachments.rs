//! Upload of files attached to results.
//!
//! Attachments are sent after their batch was accepted, one
//! `add_attachment_to_result` request per file. The created result is found
//! through the run's tests (case id to test id, then test id to result id).
//! Without a known test id, results are matched by position, which is the
//! order the batch was submitted in.
//!
//! A failed attachment never fails its batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::scheduler::UploadEntry;
use crate::api::{ApiError, Attachment, RemoteResult, RetryPolicy, TestRailApi};
use crate::model::Id;

/// Status the server answers with when a file exceeds its upload limit.
const PAYLOAD_TOO_LARGE: u16 = 413;

/// Why one attachment could not be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentError {
    #[error("Could not read {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },

    #[error("{} exceeds the server's attachment size limit", .path.display())]
    TooLarge { path: PathBuf },

    #[error("No result was created for case C{case_id}")]
    NoResult { case_id: Id },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AttachmentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AttachmentError::Io { .. } => "io",
            AttachmentError::TooLarge { .. } => "too_large",
            AttachmentError::NoResult { .. } => "no_result",
            AttachmentError::Api(err) => err.kind(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AttachmentError::Api(err) if err.is_fatal())
    }
}

/// An attachment that was not uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFailure {
    /// Identity of the case the file belongs to.
    pub identity: String,
    pub path: PathBuf,
    pub error: AttachmentError,
}

/// Attachments handled for one accepted batch.
#[derive(Debug, Clone, Default)]
pub struct AttachmentOutcome {
    pub uploaded: usize,
    pub failures: Vec<AttachmentFailure>,
}

impl AttachmentOutcome {
    /// The authentication failure hit while uploading, if any.
    pub fn fatal_error(&self) -> Option<&ApiError> {
        self.failures.iter().find_map(|f| match &f.error {
            AttachmentError::Api(err) if err.is_fatal() => Some(err),
            _ => None,
        })
    }
}

/// Sends the attachments of accepted batches.
pub struct AttachmentUploader<'a, A: TestRailApi> {
    api: &'a A,
    retry: &'a RetryPolicy,
    /// Case id to test id for the run.
    tests: HashMap<Id, Id>,
}

impl<'a, A: TestRailApi> AttachmentUploader<'a, A> {
    pub fn new(api: &'a A, retry: &'a RetryPolicy, tests: HashMap<Id, Id>) -> Self {
        Self { api, retry, tests }
    }

    /// Uploads the files of `entries`. `results` is the server's answer to
    /// the batch holding them.
    pub async fn upload(&self, entries: &[UploadEntry], results: &[RemoteResult]) -> AttachmentOutcome {
        let mut outcome = AttachmentOutcome::default();
        for (position, entry) in entries.iter().enumerate() {
            if entry.attachments.is_empty() {
                continue;
            }
            let Some(result_id) = self.result_for(entry.case_id, position, results) else {
                for path in &entry.attachments {
                    outcome.failures.push(AttachmentFailure {
                        identity: entry.identity.clone(),
                        path: path.clone(),
                        error: AttachmentError::NoResult {
                            case_id: entry.case_id,
                        },
                    });
                }
                continue;
            };

            for path in &entry.attachments {
                match self.send(result_id, path).await {
                    Ok(()) => {
                        debug!("Attached {} to result {}", path.display(), result_id);
                        outcome.uploaded += 1;
                    }
                    Err(error) => {
                        warn!(
                            "Attachment {} for '{}' failed: {}",
                            path.display(),
                            entry.identity,
                            error
                        );
                        let fatal = error.is_fatal();
                        outcome.failures.push(AttachmentFailure {
                            identity: entry.identity.clone(),
                            path: path.clone(),
                            error,
                        });
                        if fatal {
                            return outcome;
                        }
                    }
                }
            }
        }
        outcome
    }

    fn result_for(&self, case_id: Id, position: usize, results: &[RemoteResult]) -> Option<Id> {
        let test_id = self
            .tests
            .get(&case_id)
            .filter(|_| results.iter().any(|r| r.test_id.is_some()));
        match test_id {
            Some(test_id) => results.iter().find(|r| r.test_id == Some(*test_id)).map(|r| r.id),
            None => results.get(position).map(|r| r.id),
        }
    }

    async fn send(&self, result_id: Id, path: &Path) -> Result<(), AttachmentError> {
        let content = tokio::fs::read(path).await.map_err(|e| AttachmentError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let attachment = Attachment {
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            content,
        };

        let (api, attachment) = (self.api, &attachment);
        self.retry
            .run("add_attachment_to_result", move |_| {
                api.add_attachment_to_result(result_id, attachment)
            })
            .await
            .map_err(|err| match err {
                ApiError::ClientError { status, .. } if status == PAYLOAD_TOO_LARGE => {
                    AttachmentError::TooLarge {
                        path: path.to_path_buf(),
                    }
                }
                other => AttachmentError::Api(other),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;
    use crate::testing::{FakeApi, fast_retry};

    fn entry(case_id: Id, paths: Vec<PathBuf>) -> UploadEntry {
        UploadEntry::new(case_id, format!("tests.case_{}", case_id), json!({"case_id": case_id}))
            .with_attachments(paths)
    }

    fn screenshot() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x89PNG").unwrap();
        file
    }

    fn results(pairs: &[(Id, Option<Id>)]) -> Vec<RemoteResult> {
        pairs
            .iter()
            .map(|&(id, test_id)| RemoteResult { id, test_id })
            .collect()
    }

    #[tokio::test]
    async fn test_attachment_goes_to_result_of_its_test() {
        let api = FakeApi::new();
        let retry = fast_retry();
        let file = screenshot();
        let uploader = AttachmentUploader::new(&api, &retry, HashMap::from([(1, 501), (2, 502)]));

        let entries = vec![entry(1, Vec::new()), entry(2, vec![file.path().to_path_buf()])];
        let outcome = uploader
            .upload(&entries, &results(&[(91, Some(502)), (90, Some(501))]))
            .await;

        assert_eq!(outcome.uploaded, 1);
        assert!(outcome.failures.is_empty());
        let uploads = api.attachments();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, 91);
        assert_eq!(uploads[0].2, 4);
    }

    #[tokio::test]
    async fn test_results_without_test_ids_match_by_position() {
        let api = FakeApi::new();
        let retry = fast_retry();
        let file = screenshot();
        let uploader = AttachmentUploader::new(&api, &retry, HashMap::new());

        let entries = vec![entry(1, Vec::new()), entry(2, vec![file.path().to_path_buf()])];
        let outcome = uploader
            .upload(&entries, &results(&[(90, None), (91, None)]))
            .await;

        assert_eq!(outcome.uploaded, 1);
        assert_eq!(api.attachments()[0].0, 91);
    }

    #[tokio::test]
    async fn test_missing_file_reported_without_request() {
        let api = FakeApi::new();
        let retry = fast_retry();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.png");
        let uploader = AttachmentUploader::new(&api, &retry, HashMap::from([(1, 501)]));

        let outcome = uploader
            .upload(&[entry(1, vec![missing.clone()])], &results(&[(90, Some(501))]))
            .await;

        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, missing);
        assert_eq!(outcome.failures[0].error.kind(), "io");
        assert_eq!(api.calls_to("add_attachment_to_result"), 0);
    }

    #[tokio::test]
    async fn test_payload_too_large_is_its_own_kind() {
        let api = FakeApi::new();
        api.fail_next(
            "add_attachment_to_result",
            1,
            ApiError::ClientError {
                status: 413,
                message: "Request Entity Too Large".into(),
            },
        );
        let retry = fast_retry();
        let (big, small) = (screenshot(), screenshot());
        let uploader = AttachmentUploader::new(&api, &retry, HashMap::from([(1, 501)]));

        let paths = vec![big.path().to_path_buf(), small.path().to_path_buf()];
        let outcome = uploader
            .upload(&[entry(1, paths)], &results(&[(90, Some(501))]))
            .await;

        assert_eq!(outcome.uploaded, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].error.kind(), "too_large");
        assert!(outcome.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_unknown_result_fails_each_file() {
        let api = FakeApi::new();
        let retry = fast_retry();
        let (a, b) = (screenshot(), screenshot());
        let uploader = AttachmentUploader::new(&api, &retry, HashMap::from([(1, 501)]));

        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let outcome = uploader
            .upload(&[entry(1, paths)], &results(&[(90, Some(777))]))
            .await;

        assert_eq!(outcome.failures.len(), 2);
        assert!(
            outcome
                .failures
                .iter()
                .all(|f| f.error == AttachmentError::NoResult { case_id: 1 })
        );
    }

    #[tokio::test]
    async fn test_auth_error_stops_remaining_attachments() {
        let api = FakeApi::new();
        api.fail_next(
            "add_attachment_to_result",
            1,
            ApiError::AuthError {
                status: 403,
                message: "forbidden".into(),
            },
        );
        let retry = fast_retry();
        let (a, b) = (screenshot(), screenshot());
        let uploader = AttachmentUploader::new(&api, &retry, HashMap::from([(1, 501)]));

        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let outcome = uploader
            .upload(&[entry(1, paths)], &results(&[(90, Some(501))]))
            .await;

        assert_eq!(api.calls_to("add_attachment_to_result"), 1);
        assert!(outcome.fatal_error().is_some());
    }
}
