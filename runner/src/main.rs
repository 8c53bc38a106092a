use clap::{Parser, Subcommand};
use qlk_runner::{
    batch::{Batch, BatchReport, PollReport},
    config::{ConfigErrors, RunnerConfig},
    run::{self, RunState},
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Prepare, submit and track batches of QuaLiKiz runs
#[derive(Parser)]
#[command(name = "qlk-runner", author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv), ignored when RUST_LOG is set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the batch configuration
    Check { config: PathBuf },
    /// Write the input files of every run
    Prepare { config: PathBuf },
    /// Prepare and submit every run that was not submitted yet
    Submit { config: PathBuf },
    /// Query the state of every submitted run
    Poll {
        config: PathBuf,
        /// Keep polling every N seconds until the batch is complete
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Cancel every queued or running run
    Cancel { config: PathBuf },
    /// Show the recorded state of every run without querying the backend
    Status { config: PathBuf },
    /// Remove solver output and markers so the batch can be resubmitted
    Clean { config: PathBuf },
    /// List run directories below a directory together with their recorded state
    Discover { dir: PathBuf },
}

/// What to do with a loaded batch
#[derive(Debug, PartialEq)]
enum Action {
    Check,
    Prepare,
    Submit,
    Poll { watch: Option<u64> },
    Cancel,
    Status,
    Clean,
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Batch { config: PathBuf, action: Action },
    /// needs no configuration
    Discover { dir: PathBuf },
}

impl From<Commands> for Invocation {
    fn from(command: Commands) -> Self {
        let (config, action) = match command {
            Commands::Discover { dir } => return Self::Discover { dir },
            Commands::Check { config } => (config, Action::Check),
            Commands::Prepare { config } => (config, Action::Prepare),
            Commands::Submit { config } => (config, Action::Submit),
            Commands::Poll { config, watch } => (config, Action::Poll { watch }),
            Commands::Cancel { config } => (config, Action::Cancel),
            Commands::Status { config } => (config, Action::Status),
            Commands::Clean { config } => (config, Action::Clean),
        };

        Self::Batch { config, action }
    }
}

fn load_config(path: &Path) -> Result<RunnerConfig, ConfigErrors> {
    let config = RunnerConfig::load(path)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed);
    }

    Ok(config)
}

fn print_outcomes(report: &BatchReport) {
    for (name, outcome) in report.outcomes.iter() {
        match outcome {
            Ok(state) => println!("{name:<32} {state}"),
            Err(error) => println!("{name:<32} error: {error}"),
        }
    }
}

fn print_poll(report: &PollReport) {
    for (name, state) in report.states.iter() {
        println!("{name:<32} {state}");
    }
    for (name, error) in report.errors.iter() {
        println!("{name:<32} poll error: {error}");
    }
    println!("{report}");
}

/// per run error summary, returns whether anything was printed
fn print_error_summary(batch: &Batch) -> bool {
    let failed = batch
        .runs()
        .iter()
        .filter(|run| run.state() == RunState::Failed)
        .collect::<Vec<_>>();

    if failed.is_empty() {
        return false;
    }

    println!("\nFailed runs:");
    for run in failed {
        match (run.error(), run.exit_code()) {
            (Some(error), _) => println!("  {}: {error}", run.name()),
            (None, Some(code)) => println!("  {}: solver exited with {code}", run.name()),
            (None, None) => println!("  {}: job vanished without completion marker", run.name()),
        }
    }

    true
}

fn discover(dir: &Path) -> ExitCode {
    for run_dir in Batch::discover(dir) {
        match run::read_record(&run_dir) {
            Ok(Some(record)) => println!(
                "{:<48} {:<10} {}",
                run_dir.display(),
                record.state,
                record.handle.map(|handle| handle.to_string()).unwrap_or_default()
            ),
            Ok(None) => {}
            Err(error) => println!("{:<48} error: {error}", run_dir.display()),
        }
    }

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let (config_path, action) = match Invocation::from(cli.command) {
        Invocation::Discover { dir } => return discover(&dir),
        Invocation::Batch { config, action } => (config, action),
    };

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(error) => {
            error!("{}: {error}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let mut batch = match Batch::from_config(&config) {
        Ok(batch) => batch,
        Err(error) => {
            error!("Unable to load batch {}: {error}", config.batch.name);
            return ExitCode::FAILURE;
        }
    };

    let healthy = match action {
        Action::Check => {
            info!(batch = batch.name(), runs = batch.runs().len(), "Configuration is valid");
            println!("{} runs in {}", batch.runs().len(), batch.dir().display());
            true
        }
        Action::Prepare => {
            let report = batch.prepare();
            print_outcomes(&report);
            report.is_ok()
        }
        Action::Submit => {
            let report = batch.submit();
            print_outcomes(&report);
            !print_error_summary(&batch)
        }
        Action::Poll { watch } => {
            let mut report = batch.poll();

            if let Some(secs) = watch {
                while !report.complete {
                    info!("{report}");
                    thread::sleep(Duration::from_secs(secs));
                    report = batch.poll();
                }
            }

            print_poll(&report);
            print_error_summary(&batch);
            !report.complete || report.healthy
        }
        Action::Cancel => {
            let report = batch.cancel();
            print_outcomes(&report);
            report.is_ok()
        }
        Action::Status => {
            for (name, state) in batch.states() {
                println!("{name:<32} {state}");
            }
            print_error_summary(&batch);
            !batch.is_complete() || batch.is_healthy()
        }
        Action::Clean => {
            let report = batch.clean();
            print_outcomes(&report);
            report.is_ok()
        }
    };

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
