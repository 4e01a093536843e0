use super::{open_storage, CliResult};
use crate::config::Config;
use crate::meter::DEFAULT_PORT;
use crate::storage::{MeterRecord, Storage};
use clap::{Args, Subcommand};
use dialoguer::Confirm;

#[derive(Debug, Subcommand)]
pub enum MeterAction {
    /// Register a meter, or update an existing one
    Add(AddArgs),
    /// List registered meters
    List {
        /// Only show meters included in fleet runs
        #[arg(long)]
        enabled: bool,
        #[arg(long)]
        json: bool,
    },
    /// Remove a meter and its resume pointer
    Remove {
        serial: String,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Include a meter in fleet runs
    Enable { serial: String },
    /// Exclude a meter from fleet runs
    Disable { serial: String },
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    pub serial: String,
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(long, default_value_t = 1)]
    pub unit: u8,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub site: Option<String>,
    /// Directory for this meter's TSV file
    #[arg(long)]
    pub output_folder: Option<String>,
    /// Register the meter without including it in fleet runs
    #[arg(long)]
    pub disabled: bool,
}

pub async fn run(config: &Config, action: MeterAction) -> CliResult<()> {
    let storage = open_storage(config).await?;

    match action {
        MeterAction::Add(args) => add(storage.as_ref(), args).await,
        MeterAction::List { enabled, json } => list(storage.as_ref(), enabled, json).await,
        MeterAction::Remove { serial, yes } => remove(storage.as_ref(), &serial, yes).await,
        MeterAction::Enable { serial } => set_enabled(storage.as_ref(), &serial, true).await,
        MeterAction::Disable { serial } => set_enabled(storage.as_ref(), &serial, false).await,
    }
}

async fn add(storage: &dyn Storage, args: AddArgs) -> CliResult<()> {
    if args.serial.trim().is_empty() {
        return Err("serial must not be empty".into());
    }

    let mut meter = MeterRecord::new(args.serial.trim(), args.host, args.unit);
    meter.port = args.port;
    meter.model = args.model;
    meter.site_name = args.site;
    meter.output_folder = args.output_folder;
    meter.enabled = !args.disabled;

    let existed = storage.get_meter(&meter.serial).await?.is_some();
    storage.upsert_meter(&meter).await?;

    if existed {
        println!("Updated meter {}", meter.serial);
    } else {
        println!("Added meter {}", meter.serial);
    }
    Ok(())
}

async fn list(storage: &dyn Storage, enabled_only: bool, json: bool) -> CliResult<()> {
    let meters = storage.list_meters(enabled_only).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meters)?);
        return Ok(());
    }

    if meters.is_empty() {
        println!("No meters registered");
        return Ok(());
    }

    println!(
        "{:<16} {:<22} {:>4} {:<8} {:<20} {}",
        "SERIAL", "ADDRESS", "UNIT", "ENABLED", "SITE", "UPDATED"
    );
    for meter in &meters {
        println!(
            "{:<16} {:<22} {:>4} {:<8} {:<20} {}",
            meter.serial,
            format!("{}:{}", meter.host, meter.port),
            meter.unit_id,
            if meter.enabled { "yes" } else { "no" },
            meter.site_name.as_deref().unwrap_or("-"),
            meter.updated_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

async fn remove(storage: &dyn Storage, serial: &str, yes: bool) -> CliResult<()> {
    if storage.get_meter(serial).await?.is_none() {
        return Err(format!("meter '{}' is not registered", serial).into());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Remove meter {} and its resume pointer?", serial))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    storage.remove_meter(serial).await?;
    tracing::info!(serial, "Meter removed");
    println!("Removed meter {}", serial);
    Ok(())
}

async fn set_enabled(storage: &dyn Storage, serial: &str, enabled: bool) -> CliResult<()> {
    if !storage.set_meter_enabled(serial, enabled).await? {
        return Err(format!("meter '{}' is not registered", serial).into());
    }
    println!(
        "{} meter {}",
        if enabled { "Enabled" } else { "Disabled" },
        serial
    );
    Ok(())
}
