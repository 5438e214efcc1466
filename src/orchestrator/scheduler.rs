//! Batch partitioning and concurrent upload of results.
//!
//! Results are split into ordered batches of at most `batch_size` entries
//! and handed to a [`WorkerPool`]. Each batch is one atomic
//! `add_results_for_cases` request, retried as a whole by the
//! [`RetryPolicy`]. A failed batch never stops its siblings, except on an
//! authentication failure: then batches not yet started are not sent.
//!
//! Once a batch is accepted its attachments are uploaded by the same worker
//! (see [`super::attachments`]).
//!
//! # Example
//!
//! ```
//! use railsync::orchestrator::scheduler::{UploadEntry, partition};
//!
//! let entries: Vec<UploadEntry> = (1..=127)
//!     .map(|id| UploadEntry::new(id, format!("case {}", id), serde_json::json!({"case_id": id})))
//!     .collect();
//!
//! let batches = partition(9, entries, 50);
//! let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
//! assert_eq!(sizes, vec![50, 50, 27]);
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::attachments::{AttachmentFailure, AttachmentOutcome, AttachmentUploader};
use super::pool::WorkerPool;
use super::{ProgressCallback, ProgressEvent, Stage};
use crate::api::{ApiError, RetryPolicy, TestRailApi};
use crate::model::Id;

/// Smallest accepted batch size.
pub const MIN_BATCH_SIZE: usize = 2;

/// One result body ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadEntry {
    pub case_id: Id,
    pub identity: String,
    pub payload: Value,
    /// Files attached to the result once it exists.
    pub attachments: Vec<PathBuf>,
}

impl UploadEntry {
    pub fn new(case_id: Id, identity: impl Into<String>, payload: Value) -> Self {
        Self {
            case_id,
            identity: identity.into(),
            payload,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A group of results submitted in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Position in submission order, 0-based.
    pub index: usize,
    pub run_id: Id,
    pub entries: Vec<UploadEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.payload.clone()).collect()
    }

    pub fn case_identities(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.identity.clone()).collect()
    }
}

/// Splits `entries` into batches of at most `batch_size`, preserving order.
///
/// `batch_size` below [`MIN_BATCH_SIZE`] is raised to it.
pub fn partition(run_id: Id, entries: Vec<UploadEntry>, batch_size: usize) -> Vec<Batch> {
    let size = batch_size.max(MIN_BATCH_SIZE);
    let mut batches = Vec::with_capacity(entries.len().div_ceil(size));
    let mut entries = entries.into_iter().peekable();
    while entries.peek().is_some() {
        let chunk: Vec<UploadEntry> = entries.by_ref().take(size).collect();
        batches.push(Batch {
            index: batches.len(),
            run_id,
            entries: chunk,
        });
    }
    batches
}

/// A batch that was not accepted.
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub batch: Batch,
    pub error: ApiError,
    /// `false` if the batch was never sent because an earlier one hit an
    /// authentication failure.
    pub attempted: bool,
}

/// Outcome of uploading every batch of a run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub total_batches: usize,
    pub succeeded: usize,
    pub uploaded_results: usize,
    pub failed: Vec<FailedBatch>,
    pub uploaded_attachments: usize,
    pub attachment_failures: Vec<AttachmentFailure>,
    /// Authentication failure that stopped the upload.
    pub aborted: Option<ApiError>,
}

impl BatchReport {
    /// The authentication failure that stopped the upload, if any.
    pub fn fatal_error(&self) -> Option<&ApiError> {
        self.aborted.as_ref()
    }

    pub fn failed_results(&self) -> usize {
        self.failed.iter().map(|f| f.batch.len()).sum()
    }

    fn absorb_attachments(&mut self, outcome: AttachmentOutcome) {
        self.uploaded_attachments += outcome.uploaded;
        self.attachment_failures.extend(outcome.failures);
    }
}

/// Uploads result batches with bounded concurrency.
pub struct BatchScheduler<'a, A: TestRailApi> {
    api: &'a A,
    retry: &'a RetryPolicy,
    batch_size: usize,
    pool: WorkerPool,
    progress: Option<ProgressCallback>,
}

impl<'a, A: TestRailApi> BatchScheduler<'a, A> {
    pub fn new(api: &'a A, retry: &'a RetryPolicy, batch_size: usize, workers: usize) -> Self {
        Self {
            api,
            retry,
            batch_size: batch_size.max(MIN_BATCH_SIZE),
            pool: WorkerPool::new(workers),
            progress: None,
        }
    }

    /// Calls `callback` after each completed batch.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Uploads `entries` to run `run_id`. Every batch is attempted before
    /// this returns, unless authentication fails.
    pub async fn upload(&self, run_id: Id, entries: Vec<UploadEntry>) -> BatchReport {
        let batches = partition(run_id, entries, self.batch_size);
        let total = batches.len();
        if total == 0 {
            return BatchReport::default();
        }
        info!(
            "Uploading {} batches of up to {} results with {} workers",
            total,
            self.batch_size,
            self.pool.workers()
        );

        let (api, retry) = (self.api, self.retry);
        let progress = self.progress.as_ref();
        let abort: Mutex<Option<ApiError>> = Mutex::new(None);
        let completed = AtomicUsize::new(0);
        let has_attachments = batches
            .iter()
            .any(|b| b.entries.iter().any(|e| !e.attachments.is_empty()));
        let tests = if has_attachments {
            self.run_tests(run_id, &abort).await
        } else {
            HashMap::new()
        };
        let uploader = AttachmentUploader::new(api, retry, tests);
        let (abort, completed, uploader) = (&abort, &completed, &uploader);

        let outcomes = self
            .pool
            .run(batches, |batch| async move {
                let stopped = abort.lock().await.clone();
                if let Some(err) = stopped {
                    return (batch, Err((err, false)));
                }

                let payloads = batch.payloads();
                let payloads = &payloads;
                let result = retry
                    .run("add_results_for_cases", move |_| {
                        api.add_results_for_cases(run_id, payloads)
                    })
                    .await;

                let result = match result {
                    Ok(created) => Ok(uploader.upload(&batch.entries, &created).await),
                    Err(err) => Err(err),
                };
                let fatal = match &result {
                    Ok(attachments) => attachments.fatal_error().cloned(),
                    Err(err) if err.is_fatal() => Some(err.clone()),
                    Err(_) => None,
                };
                if let Some(err) = fatal {
                    let mut slot = abort.lock().await;
                    if slot.is_none() {
                        error!("Authentication failed; not sending remaining batches: {}", err);
                        *slot = Some(err);
                    }
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = progress {
                    callback(ProgressEvent {
                        stage: Stage::UploadingResults,
                        completed: done,
                        total,
                    });
                }
                (batch, result.map_err(|err| (err, true)))
            })
            .await;

        let mut report = BatchReport {
            total_batches: total,
            aborted: abort.lock().await.take(),
            ..Default::default()
        };
        for (batch, result) in outcomes {
            match result {
                Ok(attachments) => {
                    report.succeeded += 1;
                    report.uploaded_results += batch.len();
                    report.absorb_attachments(attachments);
                }
                Err((error, attempted)) => {
                    if attempted {
                        warn!(
                            "Batch {} ({} results) failed: {}",
                            batch.index + 1,
                            batch.len(),
                            error
                        );
                    }
                    report.failed.push(FailedBatch {
                        batch,
                        error,
                        attempted,
                    });
                }
            }
        }
        report
    }

    /// Case id to test id for `run_id`. An authentication failure is stored
    /// in `abort`; any other failure leaves results to be matched by position.
    async fn run_tests(&self, run_id: Id, abort: &Mutex<Option<ApiError>>) -> HashMap<Id, Id> {
        let api = self.api;
        match self.retry.run("get_tests", move |_| api.get_tests(run_id)).await {
            Ok(tests) => tests.into_iter().map(|t| (t.case_id, t.id)).collect(),
            Err(err) => {
                if err.is_fatal() {
                    error!("Authentication failed; not sending any batch: {}", err);
                    *abort.lock().await = Some(err);
                } else {
                    warn!("Could not list tests of run {}: {}", run_id, err);
                }
                HashMap::new()
            }
        }
    }
}
