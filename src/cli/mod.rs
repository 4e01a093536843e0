pub mod collect;
pub mod config;
pub mod fleet;
pub mod meter;
pub mod sync_time;

use crate::collect::{CollectionReport, CollectionWindow, SyncOptions};
use crate::config::Config;
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::{ResumeStore, Storage};
use clap::{Args, ValueEnum};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Records from the last `--minutes`
    Last,
    /// Everything newer than the resume pointer
    All,
}

/// Options shared by `collect` and `fleet`.
#[derive(Debug, Clone, Args)]
pub struct CollectOptions {
    #[arg(long, value_enum, default_value_t = Mode::All)]
    pub mode: Mode,

    /// Window length for `--mode last`
    #[arg(long, default_value_t = 60)]
    pub minutes: u32,

    /// Correct the meter clock when drift exceeds the allowed limit
    #[arg(long)]
    pub sync_time: bool,

    /// Measure and report drift without correcting it
    #[arg(long)]
    pub check_time: bool,

    /// Abort when a clock correction does not take
    #[arg(long)]
    pub require_sync: bool,

    /// Allowed drift in seconds (defaults to sync.allowed_drift_seconds)
    #[arg(long)]
    pub allowed_drift: Option<u32>,

    /// Forget the resume pointer before collecting
    #[arg(long)]
    pub reset_pointer: bool,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,
}

impl CollectOptions {
    pub fn window(&self) -> CollectionWindow {
        match self.mode {
            Mode::All => CollectionWindow::All,
            Mode::Last => CollectionWindow::Last {
                minutes: self.minutes,
            },
        }
    }

    pub fn sync_options(&self, config: &Config) -> SyncOptions {
        SyncOptions {
            enabled: self.sync_time || self.check_time,
            auto_sync: self.sync_time,
            allowed_drift_seconds: self
                .allowed_drift
                .unwrap_or(config.sync.allowed_drift_seconds),
            required: self.require_sync || config.sync.required,
        }
    }
}

/// Open the DuckDB registry and make sure its schema exists.
pub(crate) async fn open_storage(config: &Config) -> CliResult<Arc<dyn Storage>> {
    let storage = DuckDbStorage::new(&config.storage.path)?;
    storage.init_schema().await?;
    Ok(Arc::new(storage))
}

pub(crate) async fn open_store(config: &Config) -> CliResult<Arc<ResumeStore>> {
    let storage = open_storage(config).await?;
    Ok(Arc::new(ResumeStore::new(storage)))
}

/// Cancellation token tripped by Ctrl-C, so interrupted runs still persist
/// their pointer.
pub(crate) fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current page");
            trigger.cancel();
        }
    });
    token
}

pub(crate) fn print_report(report: &CollectionReport, json: bool) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Meter {} ({})", report.serial, report.window);
    println!("  outcome:         {:?}", report.outcome);
    println!("  records written: {}", report.records_written);
    if let (Some(first), Some(last)) = (report.first_index, report.last_index) {
        println!("  index range:     {}..={}", first, last);
    }
    println!(
        "  pointer:         {} -> {}",
        display_index(report.pointer_before),
        display_index(report.pointer_after)
    );
    println!(
        "  pages read:      {} (+{} search reads, {} retries)",
        report.pages_read, report.search_reads, report.retries
    );
    if report.skipped > 0 || report.rejected > 0 {
        println!("  skipped:         {} out of order, {} undecodable", report.skipped, report.rejected);
    }
    if report.gaps > 0 {
        println!("  missing:         {} records absent from the index sequence", report.gaps);
    }
    if report.records_lost > 0 {
        println!("  records lost:    {} (log wrapped past the pointer)", report.records_lost);
    }
    if report.pointer_ahead {
        println!("  warning:         stored pointer was ahead of the meter log");
    }
    if let Some(sync) = &report.sync {
        println!(
            "  clock drift:     {:+.1}s (allowed {}s)",
            sync.measured.drift_seconds, sync.allowed_drift_seconds
        );
        if let Some(corrected) = &sync.corrected {
            println!("  after sync:      {:+.1}s", corrected.drift_seconds);
        }
    }
    if let Some(error) = &report.sync_error {
        println!("  sync error:      {}", error);
    }
    if let Some(reason) = &report.interrupted {
        println!("  interrupted:     {}", reason);
    }
    Ok(())
}

fn display_index(index: Option<u64>) -> String {
    index.map_or_else(|| "none".to_string(), |i| i.to_string())
}
