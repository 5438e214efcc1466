//! In-memory stand-ins for the remote service and the confirmation prompt.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::api::{
    AUTOMATION_ID_FIELDS, ApiError, ApiResult, Attachment, NewCase, NewRun, NewSection, NewSuite,
    RemoteCase, RemoteCaseField, RemoteProject, RemoteResult, RemoteRun, RemoteSection,
    RemoteSuite, RemoteTest, RetryPolicy, TestRailApi,
};
use crate::model::Id;
use crate::resolve::ConfirmationProvider;

const CREATE_OPERATIONS: [&str; 3] = ["add_suite", "add_section", "add_case"];

/// Test ids are derived from case ids so tests can predict them.
const TEST_ID_OFFSET: Id = 100_000;

/// Retry policy with millisecond delays.
pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))
}

#[derive(Default)]
struct State {
    next_id: Id,
    projects: Vec<RemoteProject>,
    suites: Vec<RemoteSuite>,
    sections: Vec<RemoteSection>,
    cases: Vec<RemoteCase>,
    case_fields: Vec<RemoteCaseField>,
    runs: Vec<RemoteRun>,
    run_cases: HashMap<Id, BTreeSet<Id>>,
    closed_runs: Vec<Id>,
    calls: Vec<&'static str>,
    sections_created: Vec<String>,
    case_bodies: Vec<NewCase>,
    run_bodies: Vec<NewRun>,
    uploaded: Vec<Vec<Value>>,
    attachments: Vec<(Id, String, usize)>,
    fail_next: HashMap<&'static str, VecDeque<ApiError>>,
    fail_after: HashMap<&'static str, VecDeque<ApiError>>,
    reject_results: Vec<(Id, ApiError)>,
}

impl State {
    fn id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn suite_of_section(&self, section_id: Id) -> Option<Id> {
        self.sections
            .iter()
            .find(|s| s.id == section_id)
            .and_then(|s| s.suite_id)
    }
}

/// A remote service held in memory.
///
/// Every call is logged. Errors can be injected before a call takes effect
/// (`fail_next`) or after it did (`fail_after_apply`).
pub(crate) struct FakeApi {
    state: Mutex<State>,
}

impl FakeApi {
    /// A server with one multi-suite project named `Checkout`.
    pub(crate) fn new() -> Self {
        Self::with_project("Checkout", 3)
    }

    pub(crate) fn with_project(name: &str, suite_mode: u8) -> Self {
        let api = Self {
            state: Mutex::new(State {
                case_fields: vec![RemoteCaseField {
                    system_name: AUTOMATION_ID_FIELDS[0].to_string(),
                }],
                ..Default::default()
            }),
        };
        api.add_project(name, suite_mode);
        api
    }

    pub(crate) fn add_project(&self, name: &str, suite_mode: u8) -> Id {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        state.projects.push(RemoteProject {
            id,
            name: name.to_string(),
            suite_mode,
        });
        id
    }

    pub(crate) fn seed_suite(&self, name: &str) -> Id {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        state.suites.push(RemoteSuite {
            id,
            name: name.to_string(),
        });
        id
    }

    pub(crate) fn seed_section(&self, suite_id: Id, parent_id: Option<Id>, name: &str) -> Id {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        state.sections.push(RemoteSection {
            id,
            name: name.to_string(),
            suite_id: Some(suite_id),
            parent_id,
        });
        id
    }

    pub(crate) fn seed_case(&self, section_id: Id, title: &str, automation_id: Option<&str>) -> Id {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        let mut fields = Map::new();
        if let Some(automation_id) = automation_id {
            fields.insert(AUTOMATION_ID_FIELDS[0].to_string(), automation_id.into());
        }
        state.cases.push(RemoteCase {
            id,
            title: title.to_string(),
            section_id: Some(section_id),
            fields,
        });
        id
    }

    pub(crate) fn seed_run(&self, suite_id: Id, case_ids: &[Id], completed: bool) -> Id {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        state.runs.push(RemoteRun {
            id,
            suite_id: Some(suite_id),
            name: format!("Run {}", id),
            description: None,
            include_all: false,
            is_completed: completed,
        });
        state.run_cases.insert(id, case_ids.iter().copied().collect());
        id
    }

    pub(crate) fn remove_automation_field(&self) {
        self.state.lock().unwrap().case_fields.clear();
    }

    /// The next `times` calls to `operation` fail with `err` without effect.
    pub(crate) fn fail_next(&self, operation: &'static str, times: usize, err: ApiError) {
        let mut state = self.state.lock().unwrap();
        let queue = state.fail_next.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// The next `times` calls to `operation` take effect, then report `err`.
    pub(crate) fn fail_after_apply(&self, operation: &'static str, times: usize, err: ApiError) {
        let mut state = self.state.lock().unwrap();
        let queue = state.fail_after.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// Every result batch containing `case_id` is rejected with `err`.
    pub(crate) fn reject_results_containing(&self, case_id: Id, err: ApiError) {
        self.state.lock().unwrap().reject_results.push((case_id, err));
    }

    pub(crate) fn calls_to(&self, operation: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|c| **c == operation).count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Number of suite, section and case creation requests.
    pub(crate) fn create_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|c| CREATE_OPERATIONS.contains(c))
            .count()
    }

    pub(crate) fn section_names_created(&self) -> Vec<String> {
        self.state.lock().unwrap().sections_created.clone()
    }

    pub(crate) fn section_by_name(&self, name: &str) -> Option<RemoteSection> {
        let state = self.state.lock().unwrap();
        state.sections.iter().find(|s| s.name == name).cloned()
    }

    pub(crate) fn last_case_body(&self) -> Option<NewCase> {
        self.state.lock().unwrap().case_bodies.last().cloned()
    }

    pub(crate) fn last_run_body(&self) -> Option<NewRun> {
        self.state.lock().unwrap().run_bodies.last().cloned()
    }

    pub(crate) fn run_case_ids(&self, run_id: Id) -> Vec<Id> {
        let state = self.state.lock().unwrap();
        state
            .run_cases
            .get(&run_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn closed_runs(&self) -> Vec<Id> {
        self.state.lock().unwrap().closed_runs.clone()
    }

    /// Accepted result batches, in arrival order.
    pub(crate) fn uploaded_batches(&self) -> Vec<Vec<Value>> {
        self.state.lock().unwrap().uploaded.clone()
    }

    pub(crate) fn uploaded_case_ids(&self) -> Vec<Id> {
        self.uploaded_batches()
            .iter()
            .flatten()
            .filter_map(|r| r["case_id"].as_u64())
            .collect()
    }

    /// Uploaded attachments as (result id, file name, size).
    pub(crate) fn attachments(&self) -> Vec<(Id, String, usize)> {
        self.state.lock().unwrap().attachments.clone()
    }

    /// Logs the call and pops an injected pre-apply failure.
    fn enter(&self, operation: &'static str) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(operation);
        match state.fail_next.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pops an injected post-apply failure.
    fn leave<T>(&self, operation: &'static str, value: T) -> ApiResult<T> {
        let mut state = self.state.lock().unwrap();
        match state.fail_after.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

#[async_trait]
impl TestRailApi for FakeApi {
    async fn get_projects(&self) -> ApiResult<Vec<RemoteProject>> {
        self.enter("get_projects")?;
        Ok(self.state.lock().unwrap().projects.clone())
    }

    async fn get_suites(&self, _project_id: Id) -> ApiResult<Vec<RemoteSuite>> {
        self.enter("get_suites")?;
        Ok(self.state.lock().unwrap().suites.clone())
    }

    async fn add_suite(&self, _project_id: Id, suite: &NewSuite) -> ApiResult<RemoteSuite> {
        self.enter("add_suite")?;
        let created = {
            let mut state = self.state.lock().unwrap();
            let id = state.id();
            let created = RemoteSuite {
                id,
                name: suite.name.clone(),
            };
            state.suites.push(created.clone());
            created
        };
        self.leave("add_suite", created)
    }

    async fn get_sections(&self, _project_id: Id, suite_id: Id) -> ApiResult<Vec<RemoteSection>> {
        self.enter("get_sections")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .sections
            .iter()
            .filter(|s| s.suite_id == Some(suite_id))
            .cloned()
            .collect())
    }

    async fn add_section(&self, _project_id: Id, section: &NewSection) -> ApiResult<RemoteSection> {
        self.enter("add_section")?;
        let created = {
            let mut state = self.state.lock().unwrap();
            let id = state.id();
            let created = RemoteSection {
                id,
                name: section.name.clone(),
                suite_id: Some(section.suite_id),
                parent_id: section.parent_id,
            };
            state.sections.push(created.clone());
            state.sections_created.push(section.name.clone());
            created
        };
        self.leave("add_section", created)
    }

    async fn get_case_fields(&self) -> ApiResult<Vec<RemoteCaseField>> {
        self.enter("get_case_fields")?;
        Ok(self.state.lock().unwrap().case_fields.clone())
    }

    async fn get_cases(&self, _project_id: Id, suite_id: Id) -> ApiResult<Vec<RemoteCase>> {
        self.enter("get_cases")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .cases
            .iter()
            .filter(|c| c.section_id.and_then(|s| state.suite_of_section(s)) == Some(suite_id))
            .cloned()
            .collect())
    }

    async fn add_case(&self, section_id: Id, case: &NewCase) -> ApiResult<RemoteCase> {
        self.enter("add_case")?;
        let created = {
            let mut state = self.state.lock().unwrap();
            let id = state.id();
            let created = RemoteCase {
                id,
                title: case.title.clone(),
                section_id: Some(section_id),
                fields: case.fields.clone(),
            };
            state.cases.push(created.clone());
            state.case_bodies.push(case.clone());
            created
        };
        self.leave("add_case", created)
    }

    async fn get_run(&self, run_id: Id) -> ApiResult<RemoteRun> {
        self.enter("get_run")?;
        let state = self.state.lock().unwrap();
        state
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
            .ok_or_else(|| ApiError::ClientError {
                status: 400,
                message: "Field :run_id is not a valid test run.".to_string(),
            })
    }

    async fn get_tests(&self, run_id: Id) -> ApiResult<Vec<RemoteTest>> {
        self.enter("get_tests")?;
        Ok(self
            .run_case_ids(run_id)
            .into_iter()
            .map(|case_id| RemoteTest {
                id: case_id + TEST_ID_OFFSET,
                case_id,
            })
            .collect())
    }

    async fn add_run(&self, _project_id: Id, run: &NewRun) -> ApiResult<RemoteRun> {
        self.enter("add_run")?;
        let created = {
            let mut state = self.state.lock().unwrap();
            let id = state.id();
            let created = RemoteRun {
                id,
                suite_id: Some(run.suite_id),
                name: run.name.clone(),
                description: Some(run.description.clone()),
                include_all: run.include_all,
                is_completed: false,
            };
            let case_ids: BTreeSet<Id> = if run.include_all {
                let suite = run.suite_id;
                state
                    .cases
                    .iter()
                    .filter(|c| c.section_id.and_then(|s| state.suite_of_section(s)) == Some(suite))
                    .map(|c| c.id)
                    .collect()
            } else {
                run.case_ids.iter().copied().collect()
            };
            state.runs.push(created.clone());
            state.run_cases.insert(id, case_ids);
            state.run_bodies.push(run.clone());
            created
        };
        self.leave("add_run", created)
    }

    async fn update_run(&self, run_id: Id, case_ids: &[Id]) -> ApiResult<RemoteRun> {
        self.enter("update_run")?;
        let mut state = self.state.lock().unwrap();
        state
            .run_cases
            .insert(run_id, case_ids.iter().copied().collect());
        state
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
            .ok_or_else(|| ApiError::ClientError {
                status: 400,
                message: "Field :run_id is not a valid test run.".to_string(),
            })
    }

    async fn add_results_for_cases(&self, _run_id: Id, results: &[Value]) -> ApiResult<Vec<RemoteResult>> {
        self.enter("add_results_for_cases")?;
        let created = {
            let mut state = self.state.lock().unwrap();
            let rejected = state.reject_results.iter().find(|(case_id, _)| {
                results
                    .iter()
                    .any(|r| r["case_id"].as_u64() == Some(*case_id))
            });
            if let Some((_, err)) = rejected {
                return Err(err.clone());
            }
            state.uploaded.push(results.to_vec());
            let mut created = Vec::with_capacity(results.len());
            for result in results {
                let id = state.id();
                created.push(RemoteResult {
                    id,
                    test_id: result["case_id"].as_u64().map(|case_id| case_id + TEST_ID_OFFSET),
                });
            }
            created
        };
        self.leave("add_results_for_cases", created)
    }

    async fn add_attachment_to_result(&self, result_id: Id, attachment: &Attachment) -> ApiResult<()> {
        self.enter("add_attachment_to_result")?;
        self.state.lock().unwrap().attachments.push((
            result_id,
            attachment.file_name.clone(),
            attachment.content.len(),
        ));
        self.leave("add_attachment_to_result", ())
    }

    async fn close_run(&self, run_id: Id) -> ApiResult<RemoteRun> {
        self.enter("close_run")?;
        let closed = {
            let mut state = self.state.lock().unwrap();
            let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) else {
                return Err(ApiError::ClientError {
                    status: 400,
                    message: "Field :run_id is not a valid test run.".to_string(),
                });
            };
            run.is_completed = true;
            let closed = run.clone();
            state.closed_runs.push(run_id);
            closed
        };
        self.leave("close_run", closed)
    }
}

/// Gives the same answer to every question and counts them.
pub(crate) struct ScriptedConfirmation {
    answer: bool,
    asked: AtomicUsize,
}

impl ScriptedConfirmation {
    pub(crate) fn always(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub(crate) fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl ConfirmationProvider for ScriptedConfirmation {
    fn ask(&self, _resource: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}
