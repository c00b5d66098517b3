//! Umbra CLI - supervisor for darknet detector training
//!
//! `start`, `status`, `evaluate`, `accuracy` and `label` are the user-facing
//! operations. `train` and `validate` are what the supervisor re-invokes to
//! run a single job in a child process.

mod commands;

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use umbra_training::{AppConfig, TrainingRequest};

use commands::{CommandStatus, job, label, supervise};

const DEFAULT_FILTER: &str = "umbra=info,umbra_training=info";

/// Umbra - detector training supervisor
#[derive(Parser, Debug)]
#[command(name = "umbra", author, version, about = "Supervise darknet detector training and validation")]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file (replaces ./umbra.toml)
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// Storage directory (overrides UMBRA_STORAGE)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Files for one job. Anything left out comes from the configuration.
#[derive(ClapArgs, Debug, Clone, Default, PartialEq, Eq)]
struct RequestArgs {
    /// Detector data manifest
    #[arg(long)]
    data: Option<PathBuf>,

    /// Network definition
    #[arg(long)]
    config: Option<PathBuf>,

    /// Weights to start from (or to evaluate)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Reset the iteration counter
    #[arg(long)]
    clear: bool,
}

impl RequestArgs {
    fn into_request(self) -> TrainingRequest {
        TrainingRequest { data: self.data, config: self.config, weights: self.weights, clear: self.clear }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a training job and follow it to completion
    Start(RequestArgs),

    /// Show the progress of the running training job
    Status,

    /// Evaluate every checkpoint and rewrite the accuracy index
    Evaluate,

    /// Print the stored accuracy index
    Accuracy,

    /// Add a labelled image to the dataset
    Label(label::LabelArgs),

    /// Run one training job in this process (launched by `start`)
    #[command(hide = true)]
    Train(RequestArgs),

    /// Evaluate one checkpoint in this process (launched by `evaluate`)
    #[command(hide = true)]
    Validate(RequestArgs),
}

fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(format!("umbra={level},umbra_training={level}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .try_init()?;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::discover_and_load(args.config_file.as_deref())?;
    if let Some(storage) = &args.storage {
        config.storage.clone_from(storage);
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<CommandStatus> {
    let config = load_config(&args)?;

    match args.command {
        Command::Start(request) => supervise::start(&config, request.into_request()).await,
        Command::Status => supervise::status(&config).await,
        Command::Evaluate => supervise::evaluate(&config).await,
        Command::Accuracy => supervise::accuracy(&config),
        Command::Label(label_args) => label::execute(&config, label_args),
        Command::Train(request) => job::train(&config, request.into_request()).await,
        Command::Validate(request) => job::validate(&config, request.into_request()).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.log_level.as_deref()) {
        eprintln!("Error: invalid log level: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(status) => status.exit_code(),
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(error = %message, "command failed");
            ExitCode::FAILURE
        }
    }
}
