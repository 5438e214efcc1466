//! railsync CLI - Upload automated test results to TestRail.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use railsync::api::HttpApi;
use railsync::config::{self, AutoCreate, Config};
use railsync::model::InputModel;
use railsync::orchestrator::RunCoordinator;
use railsync::report::{ConsoleProgress, Outcome, print_summary};
use railsync::resolve::{ConfirmationProvider, MatchStrategy, PolicyConfirmation, TerminalConfirmation};

#[derive(Parser)]
#[command(name = "railsync")]
#[command(about = "Upload automated test results to TestRail", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "railsync.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the report against the server and upload its results
    Upload {
        /// Parsed report (JSON input model)
        #[arg(short, long)]
        input: PathBuf,

        /// Add results to an existing run instead of creating one
        #[arg(long)]
        run_id: Option<u64>,

        /// Close the run after uploading
        #[arg(long)]
        close_run: bool,

        /// Override results per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override concurrent result uploads
        #[arg(long)]
        workers: Option<usize>,

        /// Override per-request timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Answer creation prompts without asking (yes, no)
        #[arg(long, value_parser = ["yes", "no"])]
        auto_create: Option<String>,

        /// Case matching strategy (auto, property, name)
        #[arg(long, value_parser = ["auto", "property", "name"])]
        matcher: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Server URL
        #[arg(long, default_value = "https://example.testrail.io")]
        host: String,

        /// Project name
        #[arg(short, long, default_value = "My Project")]
        project: String,
    },
}

struct UploadOverrides {
    run_id: Option<u64>,
    close_run: bool,
    batch_size: Option<usize>,
    workers: Option<usize>,
    timeout: Option<u64>,
    auto_create: Option<String>,
    matcher: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Upload {
            input,
            run_id,
            close_run,
            batch_size,
            workers,
            timeout,
            auto_create,
            matcher,
        } => {
            let overrides = UploadOverrides {
                run_id,
                close_run,
                batch_size,
                workers,
                timeout,
                auto_create,
                matcher,
            };
            upload(&cli.config, &input, overrides).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { host, project } => init_config(&cli.config, &host, &project),
    }
}

fn apply_overrides(config: &mut Config, overrides: UploadOverrides) {
    if overrides.run_id.is_some() {
        config.run.run_id = overrides.run_id;
    }
    if overrides.close_run {
        config.run.close_run = true;
    }
    if let Some(batch_size) = overrides.batch_size {
        config.upload.batch_size = batch_size;
    }
    if let Some(workers) = overrides.workers {
        config.upload.result_workers = workers;
    }
    if let Some(timeout) = overrides.timeout {
        config.upload.timeout_secs = timeout;
    }
    match overrides.auto_create.as_deref() {
        Some("yes") => config.upload.auto_create = Some(AutoCreate::Yes),
        Some("no") => config.upload.auto_create = Some(AutoCreate::No),
        _ => {}
    }
    match overrides.matcher.as_deref() {
        Some("auto") => config.upload.case_matcher = MatchStrategy::AutomationId,
        Some("property") => config.upload.case_matcher = MatchStrategy::InlineId,
        Some("name") => config.upload.case_matcher = MatchStrategy::Name,
        _ => {}
    }
}

async fn upload(config_path: &Path, input: &Path, overrides: UploadOverrides) -> Result<()> {
    // Nothing has been sent yet, so a bad config or report is fatal
    let (config, model) = match prepare(config_path, input, overrides) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(Outcome::Fatal.exit_code());
        }
    };

    let api = HttpApi::new(&config.server, config.request_timeout())
        .context("Failed to create HTTP client")?;
    let confirm: Box<dyn ConfirmationProvider> = match config.upload.auto_create {
        Some(policy) => Box::new(PolicyConfirmation(policy)),
        None => Box::new(TerminalConfirmation::new()),
    };

    let progress = ConsoleProgress::new();
    let coordinator = RunCoordinator::new(api, config, confirm).with_progress(progress.callback());
    let report = coordinator.run(model).await;
    progress.finish();

    print_summary(&report);
    std::process::exit(report.exit_code());
}

/// Loads and checks everything an upload needs before any request is made.
fn prepare(config_path: &Path, input: &Path, overrides: UploadOverrides) -> Result<(Config, InputModel)> {
    // Load configuration
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    apply_overrides(&mut config, overrides);
    config::validate_config(&config)?;

    info!("Loaded configuration from {}", config_path.display());

    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read input model: {}", input.display()))?;
    let model = InputModel::from_json(&content)
        .with_context(|| format!("Failed to parse input model: {}", input.display()))?;
    model
        .validate()
        .with_context(|| format!("Invalid input model: {}", input.display()))?;
    info!(
        "Loaded {} results from {}",
        model.result_count(),
        input.display()
    );

    Ok((config, model))
}

fn validate_config(config_path: &Path) -> Result<()> {
    let result = config::load_config(config_path).and_then(|config| {
        config::validate_config(&config)?;
        Ok(config)
    });
    match result {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Host: {}", config.server.host);
            println!("  Project: {}", config.project.name);
            if let Some(suite) = &config.project.suite_name {
                println!("  Suite: {}", suite);
            }
            println!("  Batch size: {}", config.upload.batch_size);
            println!("  Result workers: {}", config.upload.result_workers);
            println!("  Case workers: {}", config.upload.case_workers);
            println!("  Request timeout: {}s", config.upload.timeout_secs);
            println!("  Retry attempts: {}", config.retry.max_attempts);
            let auto_create = match config.upload.auto_create {
                Some(AutoCreate::Yes) => "yes",
                Some(AutoCreate::No) => "no",
                None => "prompt",
            };
            println!("  Auto create: {}", auto_create);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, host: &str, project: &str) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    let config = format!(
        r#"# railsync configuration file

[server]
host = "{}"
username = "ci@example.com"
# Prefer RAILSYNC_API_KEY over storing the key here
# api_key = ""

[project]
name = "{}"
# suite_name = "Regression"

[upload]
batch_size = 50
timeout_secs = 30
result_workers = 10
case_workers = 5
# auto_create = "yes"
case_matcher = "auto"

[retry]
max_attempts = 3
base_delay_ms = 500
max_delay_ms = 30000

[run]
close_run = false
"#,
        host, project
    );

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  railsync upload --input report.json");

    Ok(())
}
