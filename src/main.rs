use acuvim_collect::cli;
use acuvim_collect::cli::collect::CollectArgs;
use acuvim_collect::cli::fleet::FleetArgs;
use acuvim_collect::cli::meter::MeterAction;
use acuvim_collect::cli::sync_time::SyncTimeArgs;
use acuvim_collect::config::{load_or_default, resolve_config_path};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "acuvim-collect")]
#[command(about = "Historical log collector for Acuvim CL meters", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect new log records from one meter
    Collect(CollectArgs),
    /// Collect every enabled meter in the registry
    Fleet(FleetArgs),
    /// Check and correct a meter clock
    SyncTime(SyncTimeArgs),
    /// Manage the meter registry
    Meter {
        #[command(subcommand)]
        action: MeterAction,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a commented starter config
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Load and validate the config file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let parsed = Cli::parse();

    let default_filter = if parsed.verbose {
        "acuvim_collect=debug"
    } else {
        "acuvim_collect=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match dispatch(parsed).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the selected command; `Ok(false)` maps to a failing exit code.
async fn dispatch(parsed: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let config_path = resolve_config_path(parsed.config.as_deref());

    if let Commands::Config { action } = &parsed.command {
        return match action {
            ConfigAction::Init { stdout } => cli::config::init(*stdout).map(|_| true),
            ConfigAction::Validate => cli::config::validate(config_path),
        };
    }

    let config = load_or_default(config_path.as_deref())?;

    match parsed.command {
        Commands::Collect(args) => {
            let report = cli::collect::run(&config, args).await?;
            Ok(report.succeeded())
        }
        Commands::Fleet(args) => cli::fleet::run(&config, args).await,
        Commands::SyncTime(args) => cli::sync_time::run(&config, args).await,
        Commands::Meter { action } => cli::meter::run(&config, action).await.map(|_| true),
        Commands::Config { .. } => Ok(true),
    }
}
