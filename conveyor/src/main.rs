use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::debug;

use conveyor::batch::run_batch;
use conveyor::controller::{Controller, ResumeRejected, RunOutcome, Services};
use conveyor::exit_codes;
use conveyor::io::config::{ConveyorConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use conveyor::io::executor::CliExecutor;
use conveyor::io::git::Git;
use conveyor::io::schemas::ensure_schemas;
use conveyor::io::sleeper::ThreadSleeper;
use conveyor::io::state_store::StateStore;
use conveyor::io::tracker::GhTracker;
use conveyor::logging;

#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Drive an issue to a reviewed pull request with a coding agent"
)]
struct Cli {
    /// Repository root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file (default: `<root>/.conveyor/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log progress at info level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config and output schemas.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run for an issue.
    Run {
        issue: String,
        /// Base branch (default: the current branch).
        #[arg(long)]
        base: Option<String>,
        /// Do not post progress comments on the issue.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Continue the persisted run from its last completed stage.
    Resume {
        /// Seed the state file from a mirrored `status.json`.
        #[arg(long)]
        from: Option<PathBuf>,
        #[arg(short, long)]
        quiet: bool,
    },
    /// Print a summary of the persisted run.
    Status,
    /// Run several issues back to back.
    Batch {
        #[arg(required = true)]
        issues: Vec<String>,
        #[arg(long)]
        base: Option<String>,
        #[arg(short, long)]
        quiet: bool,
    },
}

/// The config file could not be loaded.
#[derive(Debug, Error)]
#[error("{0}")]
struct InvalidConfig(String);

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::OK,
                _ => exit_codes::CONFIG,
            };
            // Nothing left to report to if the terminal is gone.
            err.print().ok();
            std::process::exit(code);
        }
    };
    logging::init(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.downcast_ref::<InvalidConfig>().is_some()
                || err.downcast_ref::<ResumeRejected>().is_some()
            {
                exit_codes::CONFIG
            } else {
                exit_codes::FAILED
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    let config_path = cli
        .config
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_PATH));
    match cli.command {
        Command::Init { force } => cmd_init(&root, &config_path, force),
        Command::Run { issue, base, quiet } => {
            let config = load(&config_path)?;
            with_controller(&root, config, quiet, |controller| {
                let outcome = controller.start_run(&issue, base.as_deref())?;
                Ok(report_outcome(&outcome))
            })
        }
        Command::Resume { from, quiet } => {
            let config = load(&config_path)?;
            with_controller(&root, config, quiet, |controller| {
                let outcome = controller.resume_run(from.as_deref())?;
                Ok(report_outcome(&outcome))
            })
        }
        Command::Status => cmd_status(&root, &load(&config_path)?),
        Command::Batch {
            issues,
            base,
            quiet,
        } => {
            let base = match base {
                Some(base) => base,
                None => Git::new(&root)
                    .current_branch()
                    .context("determine base branch")?,
            };
            let config = load(&config_path)?;
            let threshold = config.batch.max_consecutive_failures;
            with_controller(&root, config, quiet, |controller| {
                let report = run_batch(&issues, threshold, |issue| {
                    controller.start_run(issue, Some(base.as_str()))
                });
                for entry in &report.entries {
                    println!(
                        "batch: issue={} exit_code={} detail={}",
                        entry.issue, entry.exit_code, entry.detail
                    );
                }
                if report.halted() {
                    println!("batch: halted skipped={}", report.skipped.join(","));
                }
                Ok(report.exit_code())
            })
        }
    }
}

fn load(path: &Path) -> Result<ConveyorConfig> {
    let config = load_config(path).map_err(|err| InvalidConfig(format!("{err:#}")))?;
    debug!(config = %path.display(), "config loaded");
    Ok(config)
}

fn with_controller<F>(root: &Path, config: ConveyorConfig, quiet: bool, body: F) -> Result<i32>
where
    F: FnOnce(&Controller<'_>) -> Result<i32>,
{
    let executor = CliExecutor::new(config.executor.command.clone());
    let tracker = GhTracker::new(config.tracker.command.clone());
    let sleeper = ThreadSleeper;
    let controller = Controller::new(
        root,
        config,
        Services {
            executor: &executor,
            tracker: &tracker,
            sleeper: &sleeper,
        },
    )
    .with_quiet(quiet);
    body(&controller)
}

fn report_outcome(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed { run_id } => println!("run: run_id={run_id} status=completed"),
        RunOutcome::Failed {
            run_id,
            status,
            reason,
        } => {
            println!("run: run_id={run_id} status={}", status.as_str());
            println!("run: reason={reason}");
        }
    }
    outcome.exit_code()
}

fn cmd_init(root: &Path, config_path: &Path, force: bool) -> Result<i32> {
    if force || !config_path.exists() {
        write_config(config_path, &ConveyorConfig::default())?;
        println!("init: wrote {}", config_path.display());
    }
    let config = load(config_path)?;
    let schema_dir = config.paths.resolve(root).schema_dir;
    for path in ensure_schemas(&schema_dir, force)? {
        println!("init: wrote {}", path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, config: &ConveyorConfig) -> Result<i32> {
    let store = StateStore::new(config.paths.resolve(root).state_file);
    if !store.exists() {
        return Err(anyhow!("no run state at {}", store.path().display()));
    }
    let run = store.read()?;
    println!(
        "status: run_id={} issue={} status={}",
        run.run_id,
        run.issue,
        run.status.as_str()
    );
    println!(
        "status: base={} branch={}",
        run.base_branch,
        run.feature_branch.as_deref().unwrap_or("-")
    );
    for (name, record) in &run.stages {
        println!("stage: {name} {:?}", record.status);
    }
    for task in &run.tasks {
        println!(
            "task: {} {:?} attempts={} {}",
            task.id, task.status, task.review_attempts, task.description
        );
    }
    println!(
        "iterations: quality={} test={} review={}",
        run.iterations.quality, run.iterations.test, run.iterations.review
    );
    if let Some(scope) = run.change_scope {
        println!("scope: {}", scope.as_str());
    }
    if let Some(url) = &run.pr_url {
        println!("pr: {url}");
    }
    if let Some(reason) = &run.failure_reason {
        println!("reason: {reason}");
    }
    println!("logs: {}", run.log_dir.display());
    Ok(exit_codes::OK)
}
