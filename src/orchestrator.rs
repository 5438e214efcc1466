//! End-to-end coordination of one upload invocation.
//!
//! The [`RunCoordinator`] drives a single model through resolution, run
//! selection, batch upload and the optional close, and folds everything that
//! went wrong into an [`UploadReport`].
//!
//! # Phases
//!
//! ```text
//!   Start ──► Resolving ──► RunReady ──► Uploading ──┬──► Closing ──► Done
//!                │              │            │       │                 ▲
//!                │              │            │       └─────────────────┘
//!                ▼              ▼            ▼
//!              Fatal          Fatal     Fatal (auth only)
//! ```
//!
//! | Phase | Work | Fatal when |
//! |-------|------|------------|
//! | Resolving | [`Resolver`] fills suite/section/case ids | invalid input, project/suite unresolved, auth |
//! | RunReady | Reuse `run.run_id` or create a run | wrong suite, closed run, no cases, remote error |
//! | Uploading | [`BatchScheduler`] sends result batches and their attachments | auth, every batch rejected |
//! | Closing | `close_run`, only if `run.close_run` and one batch succeeded | never |
//!
//! # Concurrency
//!
//! Resolution is sequential apart from case creation. The run exists before
//! the first batch is dispatched. Upload failures are collected and reported
//! after all batches finish.
//!
//! # Example
//!
//! ```no_run
//! use railsync::api::HttpApi;
//! use railsync::config::load_config;
//! use railsync::model::InputModel;
//! use railsync::orchestrator::RunCoordinator;
//! use railsync::resolve::TerminalConfirmation;
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("railsync.toml"))?;
//!     let api = HttpApi::new(&config.server, config.request_timeout())?;
//!     let model = InputModel::from_json(&std::fs::read_to_string("model.json")?)?;
//!
//!     let coordinator = RunCoordinator::new(api, config, Box::new(TerminalConfirmation::new()));
//!     let report = coordinator.run(model).await;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod attachments;
pub mod pool;
pub mod scheduler;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::api::{ApiError, NewRun, RemoteRun, RetryPolicy, TestRailApi};
use crate::config::Config;
use crate::model::{Id, InputModel, Run, RunStatus, ValidationError};
use crate::report::{EntityKind, Failure, UploadReport};
use crate::resolve::{ConfirmationProvider, ResolveError, ResolveOptions, ResolvedSet, Resolver};

pub use attachments::{AttachmentError, AttachmentFailure};
pub use pool::WorkerPool;
pub use scheduler::{Batch, BatchReport, BatchScheduler, FailedBatch, UploadEntry, partition};

/// What a progress event is counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CreatingCases,
    UploadingResults,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::CreatingCases => write!(f, "Creating cases"),
            Stage::UploadingResults => write!(f, "Uploading results"),
        }
    }
}

/// Progress notification. Purely observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
}

/// Callback receiving progress events.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use railsync::orchestrator::ProgressCallback;
///
/// let callback: ProgressCallback = Arc::new(|event| {
///     println!("{}: {}/{}", event.stage, event.completed, event.total);
/// });
/// ```
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Resolving,
    RunReady,
    Uploading,
    Closing,
    Done,
}

/// Errors that prevent a run from being used.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cannot create test run: No test cases were matched")]
    NoCases,

    #[error("Created run '{expected}' but the server returned '{actual}'")]
    VerificationFailed { expected: String, actual: String },

    #[error("{operation} failed: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: ApiError,
    },
}

impl RunError {
    fn api(operation: &'static str) -> impl FnOnce(ApiError) -> RunError {
        move |source| RunError::Api { operation, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Validation(_) => "validation",
            RunError::NoCases => "no_cases",
            RunError::VerificationFailed { .. } => "verification",
            RunError::Api { source, .. } => source.kind(),
        }
    }
}

/// Drives one upload from input model to [`UploadReport`].
pub struct RunCoordinator<A: TestRailApi> {
    api: A,
    config: Config,
    confirm: Box<dyn ConfirmationProvider>,
    progress: Option<ProgressCallback>,
}

impl<A: TestRailApi> RunCoordinator<A> {
    pub fn new(api: A, config: Config, confirm: Box<dyn ConfirmationProvider>) -> Self {
        Self {
            api,
            config,
            confirm,
            progress: None,
        }
    }

    /// Forwards case-creation and upload progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn enter(&self, phase: &mut Phase, next: Phase) {
        debug!("Phase {:?} -> {:?}", phase, next);
        *phase = next;
    }

    /// Runs every phase. Never fails: errors end up in the report.
    pub async fn run(&self, mut model: InputModel) -> UploadReport {
        let start = Instant::now();
        let mut phase = Phase::Start;
        let mut report = UploadReport::new(model.result_count());
        let retry = self.config.retry_policy();
        let options = ResolveOptions::from_config(&self.config);

        self.enter(&mut phase, Phase::Resolving);
        let mut resolver = Resolver::new(&self.api, &retry, self.confirm.as_ref(), &options);
        if let Some(callback) = &self.progress {
            resolver = resolver.with_progress(Arc::clone(callback));
        }
        let resolved = match resolver.resolve(&mut model).await {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("Resolution failed: {}", err);
                report.fatal = Some(resolve_failure(&err));
                report.skipped_results = report.total_results;
                report.finish(start.elapsed());
                return report;
            }
        };
        report.suite = Some(resolved.suite.clone());
        report.created = resolved.created;
        report.skipped_results = resolved.skipped_results;
        report.failures.extend(resolved.failures.iter().cloned());

        self.enter(&mut phase, Phase::RunReady);
        let mut run = match self.obtain_run(&resolved, &model, &retry).await {
            Ok(run) => run,
            Err(err) => {
                error!("{}", err);
                report.fatal = Some(Failure::new(
                    EntityKind::Run,
                    self.config
                        .run
                        .run_id
                        .map(|id| format!("R{}", id))
                        .unwrap_or_else(|| "new run".to_string()),
                    err.kind(),
                    err.to_string(),
                ));
                report.skipped_results = report.total_results;
                report.finish(start.elapsed());
                return report;
            }
        };
        let run_id = remote_id(&run);
        info!("Using run '{}' (id {})", run.title, run_id);

        self.enter(&mut phase, Phase::Uploading);
        let entries: Vec<UploadEntry> = resolved
            .entries
            .iter()
            .map(|entry| {
                UploadEntry::new(
                    entry.case_id,
                    entry.identity.clone(),
                    entry.result.to_payload(entry.case_id, &self.config.fields.result),
                )
                .with_attachments(entry.result.attachments.clone())
            })
            .collect();
        let mut scheduler = BatchScheduler::new(
            &self.api,
            &retry,
            self.config.upload.batch_size,
            self.config.upload.result_workers,
        );
        if let Some(callback) = &self.progress {
            scheduler = scheduler.with_progress(Arc::clone(callback));
        }
        let batches = scheduler.upload(run_id, entries).await;
        absorb_batches(&mut report, &batches);

        if let Some(err) = batches.fatal_error() {
            report.fatal = Some(Failure::new(
                EntityKind::Run,
                format!("R{}", run_id),
                err.kind(),
                err.to_string(),
            ));
        } else if self.config.run.close_run && batches.succeeded > 0 {
            self.enter(&mut phase, Phase::Closing);
            let api = &self.api;
            match retry.run("close_run", move |_| api.close_run(run_id)).await {
                Ok(_) => {
                    info!("Closed run {}", run_id);
                    run.status = RunStatus::Closed;
                    report.run_closed = true;
                }
                Err(err) => {
                    warn!("Could not close run {}: {}", run_id, err);
                    report.failures.push(Failure::new(
                        EntityKind::Run,
                        format!("R{}", run_id),
                        err.kind(),
                        err.to_string(),
                    ));
                }
            }
        } else if self.config.run.close_run {
            warn!("No batch succeeded; leaving run {} open", run_id);
        }

        self.enter(&mut phase, Phase::Done);
        report.run = Some(run);
        report.finish(start.elapsed());
        info!(
            "Upload finished: {} uploaded, {} failed, {} skipped",
            report.uploaded_results, report.failed_results, report.skipped_results
        );
        report
    }

    /// Reuses the configured run or creates one for the resolved cases.
    async fn obtain_run(
        &self,
        resolved: &ResolvedSet,
        model: &InputModel,
        retry: &RetryPolicy,
    ) -> Result<Run, RunError> {
        let api = &self.api;
        let settings = &self.config.run;

        if let Some(run_id) = settings.run_id {
            let remote = retry
                .run("get_run", move |_| api.get_run(run_id))
                .await
                .map_err(RunError::api("get_run"))?;
            if remote.suite_id != Some(resolved.suite_id) {
                return Err(ValidationError::RunSuiteMismatch {
                    run_id,
                    run_suite: remote.suite_id.unwrap_or_default(),
                    suite: resolved.suite_id,
                }
                .into());
            }
            if remote.is_completed {
                return Err(ValidationError::RunClosed(run_id).into());
            }

            let mut included: BTreeSet<Id> = BTreeSet::new();
            if !remote.include_all {
                included = retry
                    .run("get_tests", move |_| api.get_tests(run_id))
                    .await
                    .map_err(RunError::api("get_tests"))?
                    .into_iter()
                    .map(|test| test.case_id)
                    .collect();
                let missing = resolved.case_ids.difference(&included).count();
                if missing > 0 {
                    included.extend(resolved.case_ids.iter().copied());
                    let case_ids: Vec<Id> = included.iter().copied().collect();
                    let case_ids = &case_ids;
                    retry
                        .run("update_run", move |_| api.update_run(run_id, case_ids))
                        .await
                        .map_err(RunError::api("update_run"))?;
                    info!("Added {} cases to run {}", missing, run_id);
                }
            }
            return Ok(to_run(remote, included));
        }

        if resolved.case_ids.is_empty() && !settings.include_all {
            return Err(RunError::NoCases);
        }

        let title = settings.title.clone().unwrap_or_else(|| {
            format!(
                "Automated Run {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            )
        });
        let description: Vec<String> = settings
            .description
            .iter()
            .cloned()
            .chain(model.run_description())
            .collect();
        let body = NewRun {
            suite_id: resolved.suite_id,
            name: title.clone(),
            description: description.join("\n"),
            include_all: settings.include_all,
            case_ids: if settings.include_all {
                Vec::new()
            } else {
                resolved.case_ids.iter().copied().collect()
            },
            milestone_id: settings.milestone_id,
            assigned_to_id: settings.assigned_to_id,
            refs: settings.refs.clone(),
        };
        let (project_id, body) = (resolved.project_id, &body);
        let remote = retry
            .run("add_run", move |_| api.add_run(project_id, body))
            .await
            .map_err(RunError::api("add_run"))?;
        if self.config.upload.verify && remote.name != title {
            return Err(RunError::VerificationFailed {
                expected: title,
                actual: remote.name,
            });
        }
        info!("Created run '{}' (id {})", remote.name, remote.id);
        Ok(to_run(remote, resolved.case_ids.clone()))
    }
}

fn to_run(remote: RemoteRun, included_case_ids: BTreeSet<Id>) -> Run {
    Run {
        id: Some(remote.id),
        suite_id: remote.suite_id.unwrap_or_default(),
        title: remote.name,
        description: remote.description.unwrap_or_default(),
        included_case_ids,
        status: if remote.is_completed {
            RunStatus::Closed
        } else {
            RunStatus::Open
        },
    }
}

fn remote_id(run: &Run) -> Id {
    run.id.unwrap_or_default()
}

fn resolve_failure(err: &ResolveError) -> Failure {
    Failure::new(err.entity(), err.subject(), err.kind(), err.to_string())
}

fn absorb_batches(report: &mut UploadReport, batches: &BatchReport) {
    report.total_batches = batches.total_batches;
    report.succeeded_batches = batches.succeeded;
    report.failed_batches = batches.failed.len();
    report.uploaded_results = batches.uploaded_results;
    report.failed_results = batches.failed_results();
    report.uploaded_attachments = batches.uploaded_attachments;
    for failed in &batches.failed {
        let message = if failed.attempted {
            failed.error.to_string()
        } else {
            format!("Not sent after authentication failure: {}", failed.error)
        };
        report.failures.push(
            Failure::new(
                EntityKind::Batch,
                format!("batch {}", failed.batch.index + 1),
                failed.error.kind(),
                message,
            )
            .with_cases(failed.batch.case_identities()),
        );
    }
    for failed in &batches.attachment_failures {
        report.failures.push(
            Failure::new(
                EntityKind::Attachment,
                failed.path.display().to_string(),
                failed.error.kind(),
                failed.error.to_string(),
            )
            .with_cases(vec![failed.identity.clone()]),
        );
    }
}
