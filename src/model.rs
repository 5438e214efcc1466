//! In-memory model of what the automation suite believes exists.
//!
//! Report parsers (JUnit, Robot Framework, OpenAPI) are external collaborators:
//! they produce an [`InputModel`] serialized as JSON, which railsync reads,
//! validates, and then reconciles against the remote service.
//!
//! # Shape
//!
//! ```text
//! InputModel
//! ├── suite_name / suite_id   - target suite (optional, config may override)
//! ├── properties              - run description lines ("name: value")
//! └── sections[]              - ordered tree, root to leaf
//!     ├── name
//!     ├── cases[]
//!     │   ├── title, classname, automation_id, fields
//!     │   └── result          - status, elapsed, comment, fields
//!     └── sections[]          - nested sub-sections
//! ```
//!
//! The resolver fills the nullable `id` fields in place as entities are
//! matched or created. Nothing in this module talks to the network.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of any remote entity.
pub type Id = u64;

/// Custom field mapping (`field name -> value`) for cases and results.
pub type Fields = Map<String, Value>;

static INLINE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*\[C(\d+)\]\s*").expect("inline id pattern is valid")
});

/// Input model failed validation before any network call was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required field is empty or malformed.
    #[error("Unable to parse {field} in {entity}: {reason}")]
    InvalidField {
        entity: &'static str,
        field: &'static str,
        reason: String,
    },

    /// Two sibling sections share a name, so results could not be placed.
    #[error("Section '{0}' appears more than once under the same parent")]
    DuplicateSection(String),

    /// The input file is not a valid model document.
    #[error("Malformed input model: {0}")]
    Malformed(String),

    /// A supplied run belongs to another suite.
    #[error("Run {run_id} belongs to suite {run_suite}, not to the resolved suite {suite}")]
    RunSuiteMismatch { run_id: Id, run_suite: Id, suite: Id },

    /// A supplied run is already closed and cannot accept results.
    #[error("Run {0} is already closed")]
    RunClosed(Id),
}

/// Outcome recorded for a test case.
///
/// Serialized as lowercase names; custom statuses carry their remote id.
///
/// | Status | Remote status id |
/// |--------|------------------|
/// | `passed` | 1 |
/// | `blocked` | 2 |
/// | `skipped` | 4 (retest) |
/// | `failed` | 5 |
/// | `{"custom": n}` | n |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Passed,
    Failed,
    Skipped,
    Blocked,
    Custom(u32),
}

impl ResultStatus {
    /// Returns the remote status id for this status.
    pub fn status_id(&self) -> u32 {
        match self {
            ResultStatus::Passed => 1,
            ResultStatus::Blocked => 2,
            ResultStatus::Skipped => 4,
            ResultStatus::Failed => 5,
            ResultStatus::Custom(id) => *id,
        }
    }
}

/// Suite the cases live in.
///
/// `id` stays `None` until the suite is found or created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    pub id: Option<Id>,
    pub name: String,
    pub project_id: Id,
}

/// Open/closed state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Open,
    Closed,
}

/// Run that receives the uploaded results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: Option<Id>,
    pub suite_id: Id,
    pub title: String,
    pub description: String,
    pub included_case_ids: BTreeSet<Id>,
    pub status: RunStatus,
}

/// A `name: value` pair describing the environment the report came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProperty {
    pub name: String,
    pub value: String,
}

impl RunProperty {
    /// Renders the property as a run description line.
    pub fn description(&self) -> String {
        format!("{}: {}", self.name, self.value)
    }
}

/// Result of executing one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Remote case id. Filled in by the resolver; required before upload.
    #[serde(default)]
    pub case_id: Option<Id>,

    pub status: ResultStatus,

    /// Execution time in seconds.
    #[serde(default)]
    pub elapsed: Option<f64>,

    #[serde(default)]
    pub comment: Option<String>,

    /// Custom result fields, e.g. `custom_environment`.
    #[serde(default)]
    pub fields: Fields,

    /// Files uploaded to the created result. Not part of the result body.
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

impl CaseResult {
    /// Creates a result with only a status.
    pub fn new(status: ResultStatus) -> Self {
        Self {
            case_id: None,
            status,
            elapsed: None,
            comment: None,
            fields: Fields::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    /// Formats `elapsed` the way the remote service accepts it.
    ///
    /// Whole seconds are sent as `"Ns"`; any non-zero sub-second duration
    /// rounds up to `"1s"`; zero, negative and non-finite values are omitted.
    pub fn elapsed_timespan(&self) -> Option<String> {
        let secs = self.elapsed?;
        if !secs.is_finite() || secs <= 0.0 {
            None
        } else if secs > 1.0 {
            Some(format!("{}s", secs.round() as u64))
        } else {
            Some("1s".to_string())
        }
    }

    /// Builds the JSON body for this result.
    ///
    /// Global fields are applied first so per-result fields win.
    pub fn to_payload(&self, case_id: Id, global_fields: &Fields) -> Value {
        let mut body = Map::new();
        for (key, value) in global_fields {
            body.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.fields {
            body.insert(key.clone(), value.clone());
        }
        body.insert("case_id".to_string(), Value::from(case_id));
        body.insert("status_id".to_string(), Value::from(self.status.status_id()));
        if let Some(comment) = &self.comment {
            body.insert("comment".to_string(), Value::from(comment.clone()));
        }
        if let Some(elapsed) = self.elapsed_timespan() {
            body.insert("elapsed".to_string(), Value::from(elapsed));
        }
        Value::Object(body)
    }
}

/// A test case as reported by the automation suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Remote case id, either supplied inline by the parser or filled in
    /// during resolution.
    #[serde(default)]
    pub id: Option<Id>,

    pub title: String,

    /// Remote section id. Filled in during resolution.
    #[serde(default)]
    pub section_id: Option<Id>,

    /// Fully-qualified class of the test, used to derive an automation id.
    #[serde(default)]
    pub classname: Option<String>,

    /// Explicit automation id; overrides `classname.title`.
    #[serde(default)]
    pub automation_id: Option<String>,

    /// Parser-supplied properties. `test_id` carries an inline case id.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Custom case fields sent when the case is created.
    #[serde(default)]
    pub fields: Fields,

    #[serde(default)]
    pub result: Option<CaseResult>,
}

impl Case {
    /// Creates a case with only a title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            section_id: None,
            classname: None,
            automation_id: None,
            properties: BTreeMap::new(),
            fields: Fields::new(),
            result: None,
        }
    }

    /// Sets the class name used to derive the automation id.
    pub fn with_classname(mut self, classname: impl Into<String>) -> Self {
        self.classname = Some(classname.into());
        self
    }

    /// Sets an explicit automation id.
    pub fn with_automation_id(mut self, automation_id: impl Into<String>) -> Self {
        self.automation_id = Some(automation_id.into());
        self
    }

    /// Attaches a result.
    pub fn with_result(mut self, result: CaseResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Adds a parser property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Returns the automation id: the explicit override, else
    /// `classname.title`, else the bare title.
    pub fn automation_key(&self) -> String {
        if let Some(explicit) = self.automation_id.as_deref().map(str::trim)
            && !explicit.is_empty()
        {
            return explicit.to_string();
        }
        match self.classname.as_deref() {
            Some(classname) if !classname.is_empty() => format!("{}.{}", classname, self.title),
            _ => self.title.clone(),
        }
    }

    /// Returns the case id the report expects to exist remotely.
    ///
    /// Looks at the `[C123]` title prefix, then the `test_id` property,
    /// then an id supplied directly by the parser.
    pub fn inline_id(&self) -> Option<Id> {
        if let Some(caps) = INLINE_ID.captures(&self.title)
            && let Ok(id) = caps[1].parse()
        {
            return Some(id);
        }
        if let Some(raw) = self.properties.get("test_id") {
            let digits = raw.trim().trim_start_matches(['C', 'c']);
            if let Ok(id) = digits.parse() {
                return Some(id);
            }
        }
        self.id
    }

    /// Returns the title with any `[C123]` prefix removed.
    pub fn display_title(&self) -> &str {
        match INLINE_ID.find(&self.title) {
            Some(m) => &self.title[m.end()..],
            None => &self.title,
        }
    }

    /// Human-readable identity used in failure reports.
    pub fn identity(&self) -> String {
        self.automation_key()
    }
}

/// A section of the report. Sections nest into a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionInput {
    /// Remote section id. Filled in during resolution.
    #[serde(default)]
    pub id: Option<Id>,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub cases: Vec<Case>,

    #[serde(default)]
    pub sections: Vec<SectionInput>,
}

impl SectionInput {
    /// Creates an empty section.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            cases: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Adds a case to this section.
    pub fn with_case(mut self, case: Case) -> Self {
        self.cases.push(case);
        self
    }

    /// Adds a child section.
    pub fn with_section(mut self, section: SectionInput) -> Self {
        self.sections.push(section);
        self
    }

    fn count_results(&self) -> usize {
        self.cases.iter().filter(|c| c.result.is_some()).count()
            + self.sections.iter().map(|s| s.count_results()).sum::<usize>()
    }

    fn collect_identities(&self, out: &mut Vec<String>) {
        out.extend(self.cases.iter().map(|c| c.identity()));
        for child in &self.sections {
            child.collect_identities(out);
        }
    }
}

/// Address of a section inside the model: child indices from the root.
pub type SectionPath = Vec<usize>;

/// The normalized output of a report parser.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputModel {
    #[serde(default)]
    pub suite_name: Option<String>,

    #[serde(default)]
    pub suite_id: Option<Id>,

    #[serde(default)]
    pub properties: Vec<RunProperty>,

    #[serde(default)]
    pub sections: Vec<SectionInput>,
}

impl InputModel {
    /// Parses a model from JSON.
    pub fn from_json(content: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(content).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Checks required fields and structural rules.
    ///
    /// Section and case titles must be non-empty and sibling sections must
    /// have distinct names.
    pub fn validate(&self) -> Result<(), ValidationError> {
        fn check(sections: &[SectionInput]) -> Result<(), ValidationError> {
            let mut seen = HashSet::new();
            for section in sections {
                if section.name.trim().is_empty() {
                    return Err(ValidationError::InvalidField {
                        entity: "section",
                        field: "name",
                        reason: "Name is empty.".to_string(),
                    });
                }
                if !seen.insert(section.name.as_str()) {
                    return Err(ValidationError::DuplicateSection(section.name.clone()));
                }
                for case in &section.cases {
                    if case.display_title().trim().is_empty() {
                        return Err(ValidationError::InvalidField {
                            entity: "case",
                            field: "title",
                            reason: format!("Title is empty in section '{}'.", section.name),
                        });
                    }
                }
                check(&section.sections)?;
            }
            Ok(())
        }
        check(&self.sections)
    }

    /// Returns every section path in depth-first pre-order, so a parent
    /// always precedes its children.
    pub fn section_paths(&self) -> Vec<SectionPath> {
        fn walk(sections: &[SectionInput], prefix: &mut SectionPath, out: &mut Vec<SectionPath>) {
            for (i, section) in sections.iter().enumerate() {
                prefix.push(i);
                out.push(prefix.clone());
                walk(&section.sections, prefix, out);
                prefix.pop();
            }
        }
        let mut out = Vec::new();
        walk(&self.sections, &mut Vec::new(), &mut out);
        out
    }

    /// Returns the section at `path`.
    pub fn section(&self, path: &[usize]) -> Option<&SectionInput> {
        let (first, rest) = path.split_first()?;
        let mut node = self.sections.get(*first)?;
        for i in rest {
            node = node.sections.get(*i)?;
        }
        Some(node)
    }

    /// Returns the section at `path` mutably.
    pub fn section_mut(&mut self, path: &[usize]) -> Option<&mut SectionInput> {
        let (first, rest) = path.split_first()?;
        let mut node = self.sections.get_mut(*first)?;
        for i in rest {
            node = node.sections.get_mut(*i)?;
        }
        Some(node)
    }

    /// Returns section names from the root to `path`.
    pub fn path_names(&self, path: &[usize]) -> Vec<String> {
        (1..=path.len())
            .filter_map(|len| self.section(&path[..len]).map(|s| s.name.clone()))
            .collect()
    }

    /// Number of results in the section at `path` and all of its descendants.
    pub fn results_under(&self, path: &[usize]) -> usize {
        self.section(path).map(|s| s.count_results()).unwrap_or(0)
    }

    /// Case identities in the section at `path` and all of its descendants.
    pub fn identities_under(&self, path: &[usize]) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(section) = self.section(path) {
            section.collect_identities(&mut out);
        }
        out
    }

    /// Iterates over every case in the model.
    pub fn cases(&self) -> impl Iterator<Item = &Case> {
        self.section_paths()
            .into_iter()
            .filter_map(|path| self.section(&path))
            .flat_map(|s| s.cases.iter())
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Total number of results in the model.
    pub fn result_count(&self) -> usize {
        self.sections.iter().map(|s| s.count_results()).sum()
    }

    /// Run description lines built from the report properties.
    pub fn run_description(&self) -> Vec<String> {
        self.properties.iter().map(RunProperty::description).collect()
    }
}
