use super::collect::{build_collector, collect_meter};
use super::{open_store, print_report, CliResult, CollectOptions};
use crate::collect::CollectionReport;
use crate::config::Config;
use crate::storage::MeterRecord;
use clap::Args;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Args)]
pub struct FleetArgs {
    /// Meters collected at the same time (defaults to fleet.max_concurrent)
    #[arg(long)]
    pub concurrency: Option<usize>,

    #[command(flatten)]
    pub options: CollectOptions,
}

/// Result of one meter in a fleet run.
pub struct FleetEntry {
    pub serial: String,
    pub result: CliResult<CollectionReport>,
}

impl FleetEntry {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(report) if report.succeeded())
    }
}

/// Collect every enabled registry meter. Returns true when every meter
/// succeeded.
pub async fn run(config: &Config, args: FleetArgs) -> CliResult<bool> {
    let store = open_store(config).await?;
    let meters = store.storage().list_meters(true).await?;
    if meters.is_empty() {
        warn!("No enabled meters in the registry");
        println!("No enabled meters. Add one with 'acuvim-collect meter add'.");
        return Ok(true);
    }

    let concurrency = args.concurrency.unwrap_or(config.fleet.max_concurrent).max(1);
    info!(meters = meters.len(), concurrency, "Starting fleet collection");

    let collector = build_collector(config, store, &args.options);
    let options = &args.options;
    let collector = &collector;

    let entries: Vec<FleetEntry> = stream::iter(meters)
        .map(|meter: MeterRecord| async move {
            let identity = meter.identity();
            let folder = meter.output_folder.as_ref().map(PathBuf::from);
            let result = collect_meter(collector, config, &identity, folder.as_deref(), None, options).await;
            if let Err(e) = &result {
                error!(serial = %meter.serial, error = %e, "Meter collection failed");
            }
            FleetEntry {
                serial: meter.serial,
                result,
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    summarize(&entries, options.json)?;
    Ok(entries.iter().all(FleetEntry::succeeded))
}

fn summarize(entries: &[FleetEntry], json: bool) -> CliResult<()> {
    if json {
        let reports: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| match &entry.result {
                Ok(report) => serde_json::to_value(report).unwrap_or(serde_json::Value::Null),
                Err(e) => serde_json::json!({ "serial": entry.serial, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    for entry in entries {
        match &entry.result {
            Ok(report) => print_report(report, false)?,
            Err(e) => println!("Meter {}\n  error:           {}", entry.serial, e),
        }
    }

    let ok = entries.iter().filter(|e| e.succeeded()).count();
    println!("\n{} of {} meters collected successfully", ok, entries.len());
    Ok(())
}
