//! Upload reporting: the final [`UploadReport`], structured [`Failure`]s,
//! the console summary and the terminal progress bar.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::model::{Run, Suite};
use crate::orchestrator::{ProgressCallback, ProgressEvent, Stage};
use crate::resolve::CreatedCounts;

/// Kind of entity a failure is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Input,
    Project,
    Suite,
    Section,
    Case,
    Run,
    Batch,
    Attachment,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Input => "input",
            EntityKind::Project => "project",
            EntityKind::Suite => "suite",
            EntityKind::Section => "section",
            EntityKind::Case => "case",
            EntityKind::Run => "run",
            EntityKind::Batch => "batch",
            EntityKind::Attachment => "attachment",
        };
        f.write_str(name)
    }
}

/// One thing that went wrong, with the cases it affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub entity: EntityKind,
    /// Name, path or id of the entity.
    pub identifier: String,
    /// Machine-readable error class, e.g. `missing_resource` or `client_error`.
    pub kind: String,
    pub message: String,
    /// Identities of the cases whose results were not uploaded.
    pub cases: Vec<String>,
}

impl Failure {
    pub fn new(
        entity: EntityKind,
        identifier: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entity,
            identifier: identifier.into(),
            kind: kind.into(),
            message: message.into(),
            cases: Vec::new(),
        }
    }

    pub fn with_cases(mut self, cases: Vec<String>) -> Self {
        self.cases = cases;
        self
    }
}

/// Terminal classification of an upload.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every result uploaded |
/// | 1 | Some results uploaded, some not |
/// | 2 | Nothing uploaded: resolution, run or auth failure, or every batch rejected |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    PartialFailure,
    Fatal,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::PartialFailure => 1,
            Outcome::Fatal => 2,
        }
    }
}

/// Aggregated result of one upload invocation.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub outcome: Outcome,
    pub suite: Option<Suite>,
    pub run: Option<Run>,

    /// Results present in the input model.
    pub total_results: usize,
    pub uploaded_results: usize,
    /// Results left out because their case could not be resolved.
    pub skipped_results: usize,
    /// Results in batches that failed.
    pub failed_results: usize,

    pub total_batches: usize,
    pub succeeded_batches: usize,
    pub failed_batches: usize,

    pub uploaded_attachments: usize,

    pub created: CreatedCounts,
    pub run_closed: bool,

    pub failures: Vec<Failure>,

    /// The error that stopped the invocation, if any.
    pub fatal: Option<Failure>,

    pub duration: Duration,
}

impl UploadReport {
    pub fn new(total_results: usize) -> Self {
        Self {
            outcome: Outcome::Success,
            suite: None,
            run: None,
            total_results,
            uploaded_results: 0,
            skipped_results: 0,
            failed_results: 0,
            total_batches: 0,
            succeeded_batches: 0,
            failed_batches: 0,
            uploaded_attachments: 0,
            created: CreatedCounts::default(),
            run_closed: false,
            failures: Vec::new(),
            fatal: None,
            duration: Duration::ZERO,
        }
    }

    /// Derives the outcome from the collected counts.
    pub fn finish(&mut self, duration: Duration) {
        self.duration = duration;
        self.outcome = if self.fatal.is_some() || (self.total_batches > 0 && self.succeeded_batches == 0) {
            Outcome::Fatal
        } else if self.failed_batches > 0 || !self.failures.is_empty() {
            Outcome::PartialFailure
        } else {
            Outcome::Success
        };
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Prints a human-readable summary of `report` to stdout.
pub fn print_summary(report: &UploadReport) {
    println!();
    println!("Upload Results:");
    if let Some(suite) = &report.suite {
        println!(
            "  Suite:    {} (id {})",
            suite.name,
            suite.id.map(|id| id.to_string()).unwrap_or_default()
        );
    }
    if let Some(run) = &report.run {
        println!(
            "  Run:      {} (id {}){}",
            run.title,
            run.id.map(|id| id.to_string()).unwrap_or_default(),
            if report.run_closed { ", closed" } else { "" }
        );
    }
    println!("  Total:    {}", report.total_results);
    println!("  Uploaded: {}", console::style(report.uploaded_results).green());
    println!("  Failed:   {}", console::style(report.failed_results).red());
    println!("  Skipped:  {}", console::style(report.skipped_results).yellow());
    if report.total_batches > 0 {
        println!(
            "  Batches:  {}/{} succeeded",
            report.succeeded_batches, report.total_batches
        );
    }
    if report.uploaded_attachments > 0 {
        println!("  Attached: {} files", report.uploaded_attachments);
    }
    let created = report.created;
    if created.suites + created.sections + created.cases > 0 {
        println!(
            "  Created:  {} suites, {} sections, {} cases",
            created.suites, created.sections, created.cases
        );
    }
    println!("  Duration: {:?}", report.duration);

    if let Some(fatal) = &report.fatal {
        println!();
        println!(
            "{}",
            console::style(format!("Upload aborted: {}", fatal.message))
                .red()
                .bold()
        );
    }

    if !report.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &report.failures {
            println!(
                "  - {} {} [{}]",
                failure.entity, failure.identifier, failure.kind
            );
            println!("    {}", console::style(&failure.message).dim());
            for case in &failure.cases {
                println!("      {}", case);
            }
        }
    }

    println!();
    match report.outcome {
        Outcome::Success => println!("{}", console::style("All results uploaded.").green().bold()),
        Outcome::PartialFailure => println!(
            "{}",
            console::style("Some results were not uploaded.").yellow().bold()
        ),
        Outcome::Fatal => println!("{}", console::style("Nothing was uploaded.").red().bold()),
    }
}

/// Progress bar driven by [`ProgressEvent`]s, one bar per stage.
pub struct ConsoleProgress {
    bar: Mutex<Option<(Stage, indicatif::ProgressBar)>>,
}

impl ConsoleProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
        })
    }

    /// Returns a callback feeding this progress bar.
    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let this = Arc::clone(self);
        Arc::new(move |event| this.update(event))
    }

    fn update(&self, event: ProgressEvent) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        let stale = !matches!(slot.as_ref(), Some((stage, _)) if *stage == event.stage);
        if stale {
            if let Some((_, old)) = slot.take() {
                old.finish_and_clear();
            }
            let bar = indicatif::ProgressBar::new(event.total as u64);
            if let Ok(style) = indicatif::ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar.set_message(event.stage.to_string());
            *slot = Some((event.stage, bar));
        }
        if let Some((_, bar)) = slot.as_ref() {
            bar.set_position(event.completed as u64);
        }
    }

    /// Removes the bar from the terminal.
    pub fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock()
            && let Some((_, bar)) = slot.take()
        {
            bar.finish_and_clear();
        }
    }
}
