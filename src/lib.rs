//! railsync: reconcile automated test reports with a TestRail instance.
//!
//! This crate takes a parsed test report, makes sure every suite, section
//! and case it references exists remotely, and uploads the results into a
//! test run in concurrent batches.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Model**: The normalized report (suites, sections, cases, results)
//! - **Api**: The remote client trait, its HTTP implementation and retry policy
//! - **Resolve**: Find-or-create of suites, sections and cases
//! - **Orchestrator**: Run selection, batch upload and run closing
//! - **Report**: The final upload report and console output
//!
//! # Example
//!
//! ```no_run
//! use railsync::api::HttpApi;
//! use railsync::config::{AutoCreate, load_config};
//! use railsync::model::InputModel;
//! use railsync::orchestrator::RunCoordinator;
//! use railsync::resolve::PolicyConfirmation;
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("railsync.toml"))?;
//!     let api = HttpApi::new(&config.server, config.request_timeout())?;
//!     let model = InputModel::from_json(&std::fs::read_to_string("report.json")?)?;
//!
//!     let confirm = Box::new(PolicyConfirmation(AutoCreate::Yes));
//!     let report = RunCoordinator::new(api, config, confirm).run(model).await;
//!     railsync::report::print_summary(&report);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod resolve;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use api::{ApiError, HttpApi, TestRailApi};
pub use config::{Config, load_config};
pub use model::InputModel;
pub use orchestrator::RunCoordinator;
pub use report::{Outcome, UploadReport};
