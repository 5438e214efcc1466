//! Resource resolution: make every referenced entity exist remotely.
//!
//! The [`Resolver`] walks the input model and, for each suite, section and
//! case, looks it up remotely and creates it when the creation policy allows.
//! It fills the model's `id` fields in place and returns a [`ResolvedSet`]
//! of case-id-resolved results ready for upload.
//!
//! # Resolution Flow
//!
//! ```text
//!   project ──► automation field check ──► suite
//!                                            │
//!                          get_sections ◄────┘
//!                               │
//!             section tree, depth-first, parents before children
//!                               │   missing + declined ──► subtree blocked
//!                               ▼
//!                          get_cases ──► CaseIndex
//!                               │
//!       Matched ──► id set      │      Dangling ──► failure (that case only)
//!                               ▼
//!                            NoMatch ──► add_case via WorkerPool
//!                               │
//!                               ▼
//!                          ResolvedSet
//! ```
//!
//! # Concurrency
//!
//! Lookups and section creation run sequentially. Case creation fans out to
//! a [`WorkerPool`] only after every section id is known; the returned ids
//! are written back by the resolver alone, so the id cache has one writer.
//!
//! # Duplicate Creation
//!
//! When a create call has to be retried, the next attempt first lists the
//! existing entities and reuses one with the same name. The remote service
//! does not enforce name uniqueness, so this is best effort: a concurrent
//! external writer can still produce duplicates.

pub mod confirm;
pub mod matcher;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::{
    AUTOMATION_ID_FIELDS, ApiError, ApiResult, NewCase, NewSection, NewSuite, RemoteCase,
    RemoteProject, RemoteSection, RemoteSuite, RetryPolicy, TestRailApi,
};
use crate::config::Config;
use crate::model::{Case, CaseResult, Fields, Id, InputModel, SectionPath, Suite, ValidationError};
use crate::orchestrator::{ProgressCallback, ProgressEvent, Stage, WorkerPool};
use crate::report::{EntityKind, Failure};

pub use confirm::{ConfirmationProvider, PolicyConfirmation, ResourceKind, TerminalConfirmation};
pub use matcher::{CaseIndex, MatchOutcome, MatchStrategy, normalize_automation_id};

/// Errors that abort resolution as a whole.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Project '{0}' does not exist")]
    ProjectNotFound(String),

    /// Several projects share the configured name.
    #[error("Project name '{name}' matches projects {ids:?}; set project.id to pick one")]
    AmbiguousProject { name: String, ids: Vec<Id> },

    #[error("Suite '{0}' does not exist in the project")]
    SuiteNotFound(String),

    /// A single-suite-with-baselines project has more than one suite.
    #[error("Project has {0} suites; set project.suite_id to pick one")]
    AmbiguousSuite(usize),

    #[error("No suite id or name given for a multi-suite project")]
    NoSuiteSelected,

    /// Creation of a required entity was declined.
    #[error("{kind} '{name}' does not exist and was not created")]
    MissingResource { kind: ResourceKind, name: String },

    #[error("Automation id case field is missing on the server (expected one of {fields:?})")]
    MissingAutomationField { fields: [&'static str; 2] },

    /// A remote call failed terminally.
    #[error("{operation} failed: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    /// A created entity did not echo the submitted name.
    #[error("Created {kind} '{expected}' but the server returned '{actual}'")]
    VerificationFailed {
        kind: ResourceKind,
        expected: String,
        actual: String,
    },
}

impl ResolveError {
    fn api(operation: &'static str) -> impl FnOnce(ApiError) -> ResolveError {
        move |source| ResolveError::Api { operation, source }
    }

    /// Short machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Validation(_) => "validation",
            ResolveError::Api { source, .. } => source.kind(),
            ResolveError::MissingResource { .. } => "missing_resource",
            ResolveError::VerificationFailed { .. } => "verification",
            _ => "resolution",
        }
    }

    /// Entity the failure is about.
    pub fn entity(&self) -> EntityKind {
        match self {
            ResolveError::Validation(_) => EntityKind::Input,
            ResolveError::ProjectNotFound(_)
            | ResolveError::AmbiguousProject { .. }
            | ResolveError::MissingAutomationField { .. } => EntityKind::Project,
            ResolveError::SuiteNotFound(_)
            | ResolveError::AmbiguousSuite(_)
            | ResolveError::NoSuiteSelected => EntityKind::Suite,
            ResolveError::MissingResource { kind, .. } | ResolveError::VerificationFailed { kind, .. } => {
                match kind {
                    ResourceKind::Suite => EntityKind::Suite,
                    ResourceKind::Section => EntityKind::Section,
                    ResourceKind::Case => EntityKind::Case,
                }
            }
            ResolveError::Api { operation, .. } => match *operation {
                "get_projects" | "get_case_fields" => EntityKind::Project,
                "get_suites" | "add_suite" => EntityKind::Suite,
                "get_sections" | "add_section" => EntityKind::Section,
                _ => EntityKind::Case,
            },
        }
    }

    /// Name or id of the entity the failure is about.
    pub fn subject(&self) -> String {
        match self {
            ResolveError::ProjectNotFound(name) | ResolveError::SuiteNotFound(name) => name.clone(),
            ResolveError::AmbiguousProject { name, .. }
            | ResolveError::MissingResource { name, .. } => name.clone(),
            ResolveError::VerificationFailed { expected, .. } => expected.clone(),
            ResolveError::Api { operation, .. } => operation.to_string(),
            _ => self.entity().to_string(),
        }
    }
}

/// Settings that drive resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub project_name: String,
    pub project_id: Option<Id>,
    pub suite_id: Option<Id>,
    pub suite_name: Option<String>,
    pub strategy: MatchStrategy,
    pub case_workers: usize,
    pub verify: bool,
    /// Merged into every created case; per-case fields win.
    pub case_fields: Fields,
}

impl ResolveOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            project_name: config.project.name.clone(),
            project_id: config.project.id,
            suite_id: config.project.suite_id,
            suite_name: config.project.suite_name.clone(),
            strategy: config.upload.case_matcher,
            case_workers: config.upload.case_workers,
            verify: config.upload.verify,
            case_fields: config.fields.case.clone(),
        }
    }
}

/// Number of entities created during resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreatedCounts {
    pub suites: usize,
    pub sections: usize,
    pub cases: usize,
}

/// A result whose case id is known.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    pub case_id: Id,
    /// Case identity shown in failure reports.
    pub identity: String,
    pub result: CaseResult,
}

/// Everything the coordinator needs after resolution.
#[derive(Debug, Clone)]
pub struct ResolvedSet {
    pub project_id: Id,
    pub suite: Suite,
    /// Resolved suite id, same as `suite.id`.
    pub suite_id: Id,
    /// Every resolved case, with or without a result.
    pub case_ids: BTreeSet<Id>,
    pub entries: Vec<ResolvedEntry>,
    /// Per-entity failures that did not abort resolution.
    pub failures: Vec<Failure>,
    /// Results left out because their case could not be resolved.
    pub skipped_results: usize,
    pub created: CreatedCounts,
}

impl ResolvedSet {
    fn block_subtree(&mut self, model: &InputModel, path: &[usize], failure: Failure) {
        self.skipped_results += model.results_under(path);
        self.failures.push(failure.with_cases(model.identities_under(path)));
    }
}

struct CaseJob {
    path: SectionPath,
    index: usize,
    section_id: Id,
    identity: String,
    body: NewCase,
    /// Other pending cases with the same identity; they get the same id.
    duplicates: Vec<(SectionPath, usize)>,
}

impl CaseJob {
    fn members(&self) -> impl Iterator<Item = (&SectionPath, usize)> {
        std::iter::once((&self.path, self.index))
            .chain(self.duplicates.iter().map(|(path, i)| (path, *i)))
    }
}

/// Resolves an [`InputModel`] against the remote service.
pub struct Resolver<'a, A: TestRailApi> {
    api: &'a A,
    retry: &'a RetryPolicy,
    confirmer: &'a dyn ConfirmationProvider,
    options: &'a ResolveOptions,
    progress: Option<ProgressCallback>,
    answers: HashMap<ResourceKind, bool>,
    sections: HashMap<(Option<Id>, String), Id>,
}

impl<'a, A: TestRailApi> Resolver<'a, A> {
    pub fn new(
        api: &'a A,
        retry: &'a RetryPolicy,
        confirm: &'a dyn ConfirmationProvider,
        options: &'a ResolveOptions,
    ) -> Self {
        Self {
            api,
            retry,
            confirmer: confirm,
            options,
            progress: None,
            answers: HashMap::new(),
            sections: HashMap::new(),
        }
    }

    /// Reports case-creation progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Resolves every suite, section and case in `model`.
    ///
    /// On success every case outside a blocked subtree has an id and every
    /// section outside a blocked subtree has an id.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input, an unresolvable project or suite,
    /// an authentication failure, or a failed verification. Entities created
    /// before the error remain on the server.
    pub async fn resolve(&mut self, model: &mut InputModel) -> Result<ResolvedSet, ResolveError> {
        model.validate()?;
        if self.options.strategy == MatchStrategy::AutomationId {
            warn_duplicate_automation_ids(model);
        }

        let project = self.resolve_project().await?;
        info!("Project: {} (id {})", project.name, project.id);

        let automation_field = match self.options.strategy {
            MatchStrategy::AutomationId => Some(self.automation_field().await?),
            _ => None,
        };

        let mut created = CreatedCounts::default();
        let remote_suite = self.resolve_suite(&project, model, &mut created).await?;
        info!("Suite: {} (id {})", remote_suite.name, remote_suite.id);
        model.suite_id = Some(remote_suite.id);

        let mut set = ResolvedSet {
            project_id: project.id,
            suite: Suite {
                id: Some(remote_suite.id),
                name: remote_suite.name.clone(),
                project_id: project.id,
            },
            suite_id: remote_suite.id,
            case_ids: BTreeSet::new(),
            entries: Vec::new(),
            failures: Vec::new(),
            skipped_results: 0,
            created,
        };

        self.load_sections(project.id, remote_suite.id).await?;
        let blocked = self.resolve_sections(model, &mut set).await?;

        let (api, project_id, suite_id) = (self.api, project.id, remote_suite.id);
        let remote_cases = self
            .retry
            .run("get_cases", move |_| api.get_cases(project_id, suite_id))
            .await
            .map_err(ResolveError::api("get_cases"))?;
        let mut index = CaseIndex::new(self.options.strategy, remote_cases);
        debug!("Indexed {} remote cases", index.len());

        self.resolve_cases(model, &blocked, &mut index, automation_field, &mut set)
            .await?;
        collect_entries(model, &blocked, &mut set);

        info!(
            "Resolved {} cases ({} created), {} sections created, {} results ready",
            set.case_ids.len(),
            set.created.cases,
            set.created.sections,
            set.entries.len()
        );
        Ok(set)
    }

    /// Asks once per resource kind and reuses the answer.
    fn confirm(&mut self, kind: ResourceKind, description: &str) -> bool {
        if let Some(answer) = self.answers.get(&kind) {
            return *answer;
        }
        let answer = self.confirmer.ask(description);
        self.answers.insert(kind, answer);
        answer
    }

    async fn resolve_project(&self) -> Result<RemoteProject, ResolveError> {
        let api = self.api;
        let projects = self
            .retry
            .run("get_projects", move |_| api.get_projects())
            .await
            .map_err(ResolveError::api("get_projects"))?;

        let name = self.options.project_name.as_str();
        let candidates: Vec<RemoteProject> = projects
            .into_iter()
            .filter(|p| name.is_empty() || p.name == name)
            .collect();

        match (candidates.len(), self.options.project_id) {
            (0, _) => Err(ResolveError::ProjectNotFound(name.to_string())),
            (_, Some(id)) => candidates
                .into_iter()
                .find(|p| p.id == id)
                .ok_or_else(|| ResolveError::ProjectNotFound(format!("{} (id {})", name, id))),
            (1, None) => candidates
                .into_iter()
                .next()
                .ok_or_else(|| ResolveError::ProjectNotFound(name.to_string())),
            (_, None) => Err(ResolveError::AmbiguousProject {
                name: name.to_string(),
                ids: candidates.iter().map(|p| p.id).collect(),
            }),
        }
    }

    async fn automation_field(&self) -> Result<&'static str, ResolveError> {
        let api = self.api;
        let fields = self
            .retry
            .run("get_case_fields", move |_| api.get_case_fields())
            .await
            .map_err(ResolveError::api("get_case_fields"))?;

        AUTOMATION_ID_FIELDS
            .into_iter()
            .find(|name| fields.iter().any(|f| f.system_name == *name))
            .ok_or(ResolveError::MissingAutomationField {
                fields: AUTOMATION_ID_FIELDS,
            })
    }

    async fn resolve_suite(
        &mut self,
        project: &RemoteProject,
        model: &InputModel,
        created: &mut CreatedCounts,
    ) -> Result<RemoteSuite, ResolveError> {
        let (api, project_id) = (self.api, project.id);
        let mut suites = self
            .retry
            .run("get_suites", move |_| api.get_suites(project_id))
            .await
            .map_err(ResolveError::api("get_suites"))?;
        suites.sort_by_key(|s| s.id);

        if let Some(id) = self.options.suite_id.or(model.suite_id) {
            return suites
                .into_iter()
                .find(|s| s.id == id)
                .ok_or_else(|| ResolveError::SuiteNotFound(format!("id {}", id)));
        }

        if project.suite_mode != 3 {
            return match suites.len() {
                0 => Err(ResolveError::SuiteNotFound(project.name.clone())),
                1 => suites
                    .into_iter()
                    .next()
                    .ok_or_else(|| ResolveError::SuiteNotFound(project.name.clone())),
                n => Err(ResolveError::AmbiguousSuite(n)),
            };
        }

        let name = self
            .options
            .suite_name
            .clone()
            .or_else(|| model.suite_name.clone())
            .filter(|n| !n.trim().is_empty())
            .ok_or(ResolveError::NoSuiteSelected)?;

        if let Some(existing) = suites.into_iter().find(|s| s.name == name) {
            return Ok(existing);
        }

        let description = format!(
            "Suite '{}' does not exist in project '{}'.",
            name, project.name
        );
        if !self.confirm(ResourceKind::Suite, &description) {
            return Err(ResolveError::MissingResource {
                kind: ResourceKind::Suite,
                name,
            });
        }

        let body = NewSuite {
            name: name.clone(),
            description: None,
        };
        let body = &body;
        let suite = self
            .retry
            .run("add_suite", move |attempt| async move {
                if attempt > 1 {
                    let existing = api.get_suites(project_id).await?;
                    if let Some(found) = existing
                        .into_iter()
                        .filter(|s| s.name == body.name)
                        .min_by_key(|s| s.id)
                    {
                        debug!("Suite '{}' found before retry; reusing it", found.name);
                        return Ok(found);
                    }
                }
                api.add_suite(project_id, body).await
            })
            .await
            .map_err(ResolveError::api("add_suite"))?;

        self.verify(ResourceKind::Suite, &name, &suite.name)?;
        created.suites += 1;
        info!("Created suite '{}' (id {})", suite.name, suite.id);
        Ok(suite)
    }

    fn verify(&self, kind: ResourceKind, expected: &str, actual: &str) -> Result<(), ResolveError> {
        if self.options.verify && expected != actual {
            return Err(ResolveError::VerificationFailed {
                kind,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    async fn load_sections(&mut self, project_id: Id, suite_id: Id) -> Result<(), ResolveError> {
        let api = self.api;
        let mut remote = self
            .retry
            .run("get_sections", move |_| api.get_sections(project_id, suite_id))
            .await
            .map_err(ResolveError::api("get_sections"))?;
        remote.sort_by_key(|s| s.id);

        self.sections.clear();
        for section in remote {
            self.sections
                .entry((section.parent_id, section.name))
                .or_insert(section.id);
        }
        debug!("Cached {} remote sections", self.sections.len());
        Ok(())
    }

    /// Assigns section ids depth-first. Returns the roots of blocked subtrees.
    async fn resolve_sections(
        &mut self,
        model: &mut InputModel,
        set: &mut ResolvedSet,
    ) -> Result<Vec<SectionPath>, ResolveError> {
        let mut blocked: Vec<SectionPath> = Vec::new();

        for path in model.section_paths() {
            if is_blocked(&blocked, &path) {
                continue;
            }
            let parent_id = match path.split_last() {
                Some((_, parent)) if !parent.is_empty() => model.section(parent).and_then(|s| s.id),
                _ => None,
            };
            let Some(section) = model.section(&path) else {
                continue;
            };
            let name = section.name.clone();
            let description = section.description.clone();

            if let Some(id) = self.sections.get(&(parent_id, name.clone())).copied() {
                if let Some(section) = model.section_mut(&path) {
                    section.id = Some(id);
                }
                continue;
            }

            let path_label = model.path_names(&path).join(" > ");
            let question = format!(
                "Section '{}' does not exist in suite '{}'.",
                path_label, set.suite.name
            );
            if !self.confirm(ResourceKind::Section, &question) {
                warn!("Section '{}' is missing; skipping its cases", path_label);
                let err = ResolveError::MissingResource {
                    kind: ResourceKind::Section,
                    name: path_label.clone(),
                };
                let failure = Failure::new(EntityKind::Section, path_label, err.kind(), err.to_string());
                set.block_subtree(model, &path, failure);
                blocked.push(path);
                continue;
            }

            let body = NewSection {
                suite_id: set.suite_id,
                name: name.clone(),
                parent_id,
                description,
            };
            match self.create_section(set.project_id, &body).await {
                Ok(remote) => {
                    self.verify(ResourceKind::Section, &name, &remote.name)?;
                    info!("Created section '{}' (id {})", path_label, remote.id);
                    self.sections.insert((parent_id, name), remote.id);
                    if let Some(section) = model.section_mut(&path) {
                        section.id = Some(remote.id);
                    }
                    set.created.sections += 1;
                }
                Err(err) if err.is_fatal() => {
                    return Err(ResolveError::Api {
                        operation: "add_section",
                        source: err,
                    });
                }
                Err(err) => {
                    warn!("Could not create section '{}': {}", path_label, err);
                    let failure = Failure::new(EntityKind::Section, path_label, err.kind(), err.to_string());
                    set.block_subtree(model, &path, failure);
                    blocked.push(path);
                }
            }
        }

        Ok(blocked)
    }

    async fn create_section(&self, project_id: Id, body: &NewSection) -> ApiResult<RemoteSection> {
        let api = self.api;
        self.retry
            .run("add_section", move |attempt| async move {
                if attempt > 1 {
                    let existing = api.get_sections(project_id, body.suite_id).await?;
                    if let Some(found) = existing
                        .into_iter()
                        .filter(|s| s.parent_id == body.parent_id && s.name == body.name)
                        .min_by_key(|s| s.id)
                    {
                        debug!("Section '{}' found before retry; reusing it", found.name);
                        return Ok(found);
                    }
                }
                api.add_section(project_id, body).await
            })
            .await
    }

    async fn resolve_cases(
        &mut self,
        model: &mut InputModel,
        blocked: &[SectionPath],
        index: &mut CaseIndex,
        automation_field: Option<&'static str>,
        set: &mut ResolvedSet,
    ) -> Result<(), ResolveError> {
        let mut pending: Vec<(SectionPath, usize)> = Vec::new();

        for path in model.section_paths() {
            if is_blocked(blocked, &path) {
                continue;
            }
            let Some(section) = model.section_mut(&path) else {
                continue;
            };
            let Some(section_id) = section.id else {
                continue;
            };
            for (i, case) in section.cases.iter_mut().enumerate() {
                case.section_id = Some(section_id);
                match index.match_case(case, section_id) {
                    MatchOutcome::Matched(id) => case.id = Some(id),
                    MatchOutcome::NoMatch => pending.push((path.clone(), i)),
                    MatchOutcome::Dangling(id) => {
                        warn!("Case C{} referenced by '{}' does not exist", id, case.title);
                        case.id = None;
                        if case.result.is_some() {
                            set.skipped_results += 1;
                        }
                        set.failures.push(
                            Failure::new(
                                EntityKind::Case,
                                format!("C{}", id),
                                "dangling_reference",
                                format!("Case C{} referenced by '{}' does not exist", id, case.title),
                            )
                            .with_cases(vec![case.identity()]),
                        );
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let question = format!(
            "{} case(s) do not exist in suite '{}'.",
            pending.len(),
            set.suite.name
        );
        if !self.confirm(ResourceKind::Case, &question) {
            warn!("{} missing cases will not be created", pending.len());
            for (path, i) in &pending {
                let Some(case) = model.section(path).and_then(|s| s.cases.get(*i)) else {
                    continue;
                };
                if case.result.is_some() {
                    set.skipped_results += 1;
                }
                let identity = case.identity();
                let err = ResolveError::MissingResource {
                    kind: ResourceKind::Case,
                    name: identity.clone(),
                };
                set.failures.push(
                    Failure::new(EntityKind::Case, identity.clone(), err.kind(), err.to_string())
                        .with_cases(vec![identity]),
                );
            }
            return Ok(());
        }

        let mut jobs: Vec<CaseJob> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (path, index) in pending {
            let Some(section) = model.section(&path) else {
                continue;
            };
            let (Some(case), Some(section_id)) = (section.cases.get(index), section.id) else {
                continue;
            };
            let key = creation_key(self.options.strategy, case, section_id);
            if let Some(leader) = key.as_ref().and_then(|k| by_key.get(k)) {
                debug!("Case '{}' appears more than once; creating it once", case.identity());
                jobs[*leader].duplicates.push((path, index));
                continue;
            }

            let mut fields = self.options.case_fields.clone();
            fields.extend(case.fields.clone());
            if let Some(field) = automation_field {
                fields.insert(field.to_string(), case.automation_key().into());
            }
            let job = CaseJob {
                path,
                index,
                section_id,
                identity: case.identity(),
                body: NewCase {
                    title: case.display_title().to_string(),
                    fields,
                },
                duplicates: Vec::new(),
            };
            if let Some(key) = key {
                by_key.insert(key, jobs.len());
            }
            jobs.push(job);
        }

        let total = jobs.len();
        info!(
            "Creating {} cases with {} workers",
            total,
            self.options.case_workers
        );
        let pool = WorkerPool::new(self.options.case_workers);
        let (api, retry, project_id, suite_id) = (self.api, self.retry, set.project_id, set.suite_id);
        let progress = self.progress.as_ref();
        let abort: Mutex<Option<ApiError>> = Mutex::new(None);
        let completed = AtomicUsize::new(0);
        let (abort, completed) = (&abort, &completed);

        let outcomes = pool
            .run(jobs, |job| async move {
                let stopped = abort.lock().await.clone();
                if let Some(err) = stopped {
                    return (job, Err(err));
                }

                let result = create_case(api, retry, project_id, suite_id, &job).await;
                if let Err(err) = &result
                    && err.is_fatal()
                {
                    let mut slot = abort.lock().await;
                    if slot.is_none() {
                        error!("Authentication failed; not creating remaining cases: {}", err);
                        *slot = Some(err.clone());
                    }
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = progress {
                    callback(ProgressEvent {
                        stage: Stage::CreatingCases,
                        completed: done,
                        total,
                    });
                }
                (job, result)
            })
            .await;

        for (job, result) in outcomes {
            match result {
                Ok(remote) => {
                    self.verify(ResourceKind::Case, &job.body.title, &remote.title)?;
                    for (path, i) in job.members() {
                        if let Some(case) = model.section_mut(path).and_then(|s| s.cases.get_mut(i)) {
                            case.id = Some(remote.id);
                        }
                    }
                    index.insert(&remote);
                    set.created.cases += 1;
                }
                Err(err) if err.is_fatal() => {
                    return Err(ResolveError::Api {
                        operation: "add_case",
                        source: err,
                    });
                }
                Err(err) => {
                    warn!("Could not create case '{}': {}", job.identity, err);
                    let mut identities = Vec::new();
                    for (path, i) in job.members() {
                        let Some(case) = model.section(path).and_then(|s| s.cases.get(i)) else {
                            continue;
                        };
                        if case.result.is_some() {
                            set.skipped_results += 1;
                        }
                        identities.push(case.identity());
                    }
                    set.failures.push(
                        Failure::new(EntityKind::Case, job.identity.clone(), err.kind(), err.to_string())
                            .with_cases(identities),
                    );
                }
            }
        }

        Ok(())
    }
}

/// Key under which two pending cases would produce the same remote case.
fn creation_key(strategy: MatchStrategy, case: &Case, section_id: Id) -> Option<String> {
    match strategy {
        MatchStrategy::AutomationId => Some(case.automation_key().to_lowercase()),
        MatchStrategy::Name => Some(format!("{}/{}", section_id, case.display_title())),
        MatchStrategy::InlineId => None,
    }
}

async fn create_case<A: TestRailApi>(
    api: &A,
    retry: &RetryPolicy,
    project_id: Id,
    suite_id: Id,
    job: &CaseJob,
) -> ApiResult<RemoteCase> {
    let (section_id, body) = (job.section_id, &job.body);
    retry
        .run("add_case", move |attempt| async move {
            if attempt > 1 {
                let existing = api.get_cases(project_id, suite_id).await?;
                if let Some(found) = existing
                    .into_iter()
                    .filter(|c| c.section_id == Some(section_id) && same_case(c, body))
                    .min_by_key(|c| c.id)
                {
                    debug!("Case '{}' found before retry; reusing it", found.title);
                    return Ok(found);
                }
            }
            api.add_case(section_id, body).await
        })
        .await
}

fn same_case(remote: &RemoteCase, body: &NewCase) -> bool {
    if remote.title != body.title {
        return false;
    }
    let local = AUTOMATION_ID_FIELDS
        .iter()
        .find_map(|f| body.fields.get(*f).and_then(|v| v.as_str()));
    match (local, remote.automation_id()) {
        (Some(local), Some(remote)) => normalize_automation_id(remote) == local.to_lowercase(),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn is_blocked(blocked: &[SectionPath], path: &[usize]) -> bool {
    blocked.iter().any(|root| path.starts_with(root))
}

fn warn_duplicate_automation_ids(model: &InputModel) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for case in model.cases() {
        *counts.entry(case.automation_key().to_lowercase()).or_default() += 1;
    }
    for (key, count) in counts.into_iter().filter(|(_, n)| *n > 1) {
        warn!("Automation id '{}' appears {} times in the report", key, count);
    }
}

fn collect_entries(model: &mut InputModel, blocked: &[SectionPath], set: &mut ResolvedSet) {
    for path in model.section_paths() {
        if is_blocked(blocked, &path) {
            continue;
        }
        let Some(section) = model.section_mut(&path) else {
            continue;
        };
        for case in &mut section.cases {
            let Some(case_id) = case.id else {
                continue;
            };
            set.case_ids.insert(case_id);
            let identity = case.identity();
            if let Some(result) = case.result.as_mut() {
                result.case_id = Some(case_id);
                set.entries.push(ResolvedEntry {
                    case_id,
                    identity,
                    result: result.clone(),
                });
            }
        }
    }
}
