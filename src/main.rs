use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use arc_pipeline::convergence::{Risk, TierName};
use arc_pipeline::init::{get_arc_dir, is_initialized};

mod cmd;

#[derive(Parser)]
#[command(name = "arc")]
#[command(version, about = "Resumable multi-phase pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve every gated phase without prompting
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true, env = "ARC_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize an arc workspace
    Init,
    /// Start a new run
    Run(RunArgs),
    /// Resume the most recent (or named) run
    Resume {
        #[arg(long)]
        run: Option<String>,
    },
    /// Show the phase table of a run
    Status {
        #[arg(long)]
        run: Option<String>,
    },
    /// List runs, newest first
    List,
    /// Reclaim resources left behind by crashed or abandoned runs
    Cleanup {
        /// Report what would be reclaimed without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Reference to the plan to execute
    pub plan: String,

    #[arg(long)]
    pub no_forge: bool,

    #[arg(long)]
    pub no_test: bool,

    #[arg(long)]
    pub no_ship: bool,

    /// Ask before phases that require approval
    #[arg(long)]
    pub approve: bool,

    /// Pass draft mode through to phases
    #[arg(long)]
    pub draft: bool,

    /// Convergence tier: light, standard, thorough
    #[arg(long)]
    pub tier: Option<TierName>,

    /// Declared risk of the change: low, medium, high
    #[arg(long)]
    pub risk: Option<Risk>,

    /// Files touched by the change (for tier selection)
    #[arg(long)]
    pub files: Option<u32>,

    /// Lines touched by the change (for tier selection)
    #[arg(long)]
    pub lines: Option<u32>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default arc.toml file
    Init,
}

/// Install the tracing subscriber: stderr always, plus a daily file under
/// `.arc/logs/` once the workspace exists.
fn init_tracing(project_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let default_filter = if verbose {
        "arc_pipeline=debug,arc=debug"
    } else {
        "arc_pipeline=info,arc=info"
    };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file_layer, guard) = if is_initialized(project_dir) {
        let appender = tracing_appender::rolling::daily(get_arc_dir(project_dir).join("logs"), "arc.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(filter());
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let _log_guard = init_tracing(&project_dir, cli.verbose);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run(args) => return cmd::cmd_run(&cli, &project_dir, args).await,
        Commands::Resume { run } => {
            return cmd::cmd_resume(&cli, &project_dir, run.as_deref()).await;
        }
        Commands::Status { run } => cmd::cmd_status(&project_dir, run.as_deref())?,
        Commands::List => cmd::cmd_list(&project_dir)?,
        Commands::Cleanup { dry_run } => cmd::cmd_cleanup(&cli, &project_dir, *dry_run).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
