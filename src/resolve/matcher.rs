//! Identity matching between local cases and remote cases.
//!
//! One [`MatchStrategy`] is chosen per run:
//!
//! | Strategy | Config value | Key |
//! |----------|--------------|-----|
//! | [`AutomationId`](MatchStrategy::AutomationId) | `auto` | `classname.title` or explicit id, compared case-insensitively |
//! | [`InlineId`](MatchStrategy::InlineId) | `property` | `[C123]` title prefix or `test_id` property |
//! | [`Name`](MatchStrategy::Name) | `name` | exact title within the same section |
//!
//! Remote cases are indexed once per suite, sorted by id ascending, so the
//! lowest id wins when several remote cases share a key.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::RemoteCase;
use crate::model::{Case, Id};

/// How a local case is mapped to a remote case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum MatchStrategy {
    #[default]
    #[serde(rename = "auto", alias = "automation_id")]
    AutomationId,
    #[serde(rename = "property", alias = "inline_id")]
    InlineId,
    #[serde(rename = "name")]
    Name,
}

/// Result of matching one local case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(Id),
    NoMatch,
    /// The case names a remote id that does not exist.
    Dangling(Id),
}

/// Normalizes a remote automation id for comparison.
///
/// Rich-text fields come back HTML-escaped and sometimes wrapped in a
/// paragraph tag.
pub fn normalize_automation_id(raw: &str) -> String {
    let mut value = raw.trim();
    if let Some(inner) = value
        .strip_prefix("<p>")
        .and_then(|v| v.strip_suffix("</p>"))
    {
        value = inner.trim();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
        .to_lowercase()
}

/// Lookup structure over the remote cases of one suite.
pub struct CaseIndex {
    strategy: MatchStrategy,
    by_automation_id: HashMap<String, Vec<Id>>,
    by_section_title: HashMap<(Id, String), Vec<Id>>,
    ids: HashSet<Id>,
}

impl CaseIndex {
    pub fn new(strategy: MatchStrategy, mut cases: Vec<RemoteCase>) -> Self {
        cases.sort_by_key(|c| c.id);

        let mut by_automation_id: HashMap<String, Vec<Id>> = HashMap::new();
        let mut by_section_title: HashMap<(Id, String), Vec<Id>> = HashMap::new();
        let mut ids = HashSet::with_capacity(cases.len());
        for case in &cases {
            ids.insert(case.id);
            match strategy {
                MatchStrategy::AutomationId => {
                    if let Some(raw) = case.automation_id() {
                        let key = normalize_automation_id(raw);
                        if !key.is_empty() {
                            by_automation_id.entry(key).or_default().push(case.id);
                        }
                    }
                }
                MatchStrategy::Name => {
                    if let Some(section_id) = case.section_id {
                        by_section_title
                            .entry((section_id, case.title.clone()))
                            .or_default()
                            .push(case.id);
                    }
                }
                MatchStrategy::InlineId => {}
            }
        }

        Self {
            strategy,
            by_automation_id,
            by_section_title,
            ids,
        }
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    /// Number of remote cases indexed.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Records a case created during this run so later lookups find it.
    pub fn insert(&mut self, case: &RemoteCase) {
        self.ids.insert(case.id);
        if let Some(raw) = case.automation_id() {
            self.by_automation_id
                .entry(normalize_automation_id(raw))
                .or_default()
                .push(case.id);
        }
        if let Some(section_id) = case.section_id {
            self.by_section_title
                .entry((section_id, case.title.clone()))
                .or_default()
                .push(case.id);
        }
    }

    /// Matches `case`, located in remote section `section_id`.
    pub fn match_case(&self, case: &Case, section_id: Id) -> MatchOutcome {
        match self.strategy {
            MatchStrategy::AutomationId => {
                let key = case.automation_key().to_lowercase();
                first_of(self.by_automation_id.get(&key), &key)
            }
            MatchStrategy::Name => {
                let key = (section_id, case.display_title().to_string());
                first_of(self.by_section_title.get(&key), &key.1)
            }
            MatchStrategy::InlineId => match case.inline_id() {
                Some(id) if self.ids.contains(&id) => MatchOutcome::Matched(id),
                Some(id) => MatchOutcome::Dangling(id),
                None => MatchOutcome::NoMatch,
            },
        }
    }
}

fn first_of(ids: Option<&Vec<Id>>, key: &str) -> MatchOutcome {
    match ids.map(Vec::as_slice) {
        Some([id]) => MatchOutcome::Matched(*id),
        Some([id, rest @ ..]) => {
            warn!(
                "{} remote cases match '{}'; using case C{} (others: {:?})",
                rest.len() + 1,
                key,
                id,
                rest
            );
            MatchOutcome::Matched(*id)
        }
        _ => MatchOutcome::NoMatch,
    }
}
