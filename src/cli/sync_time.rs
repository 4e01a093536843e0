use super::{open_store, CliResult};
use crate::config::Config;
use crate::meter::MeterIdentity;
use crate::retry::Retrier;
use crate::sync::{SyncError, SyncOutcome, SyncPolicy, SystemClock, TimeSync};
use crate::transport::modbus::ModbusTcpTransport;
use chrono::Utc;
use clap::Args;
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct SyncTimeArgs {
    /// Meter address. When omitted, --serial is looked up in the registry
    #[arg(long, required_unless_present = "serial")]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub unit: Option<u8>,

    /// Registered meter; its sync state is recorded with the resume pointer
    #[arg(long)]
    pub serial: Option<String>,

    /// Allowed drift in seconds (defaults to sync.allowed_drift_seconds)
    #[arg(long)]
    pub allowed_drift: Option<u32>,

    /// Measure and report drift without writing the meter clock
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub json: bool,
}

/// Check a meter clock and correct it when out of tolerance. Returns whether
/// the clock ends up within tolerance (always true for a dry run that only
/// reports).
pub async fn run(config: &Config, args: SyncTimeArgs) -> CliResult<bool> {
    let store = match &args.serial {
        Some(_) => Some(open_store(config).await?),
        None => None,
    };

    let identity = match (&args.host, &args.serial, &store) {
        (Some(host), serial, _) => {
            let serial = serial.clone().unwrap_or_else(|| host.clone());
            MeterIdentity::new(serial, host, args.unit.unwrap_or(1))
                .with_port(args.port.unwrap_or(config.transport.port))
        }
        (None, Some(serial), Some(store)) => {
            let meter = store
                .storage()
                .get_meter(serial)
                .await?
                .ok_or_else(|| format!("meter '{}' is not registered; pass --host", serial))?;
            let mut identity = meter.identity();
            if let Some(port) = args.port {
                identity.port = port;
            }
            if let Some(unit) = args.unit {
                identity.unit_id = unit;
            }
            identity
        }
        _ => return Err("either --host or --serial is required".into()),
    };

    let policy = SyncPolicy {
        allowed_drift_seconds: args
            .allowed_drift
            .unwrap_or(config.sync.allowed_drift_seconds),
        auto_sync: !args.dry_run,
    };

    let mut transport = ModbusTcpTransport::connect(&identity, config.transport.timeout).await?;
    let mut retrier = Retrier::new(config.retry.clone());
    let sync = TimeSync::new(Arc::new(SystemClock), policy);

    let (outcome, in_tolerance) = match sync.check_and_sync(&mut transport, &mut retrier).await {
        Ok(outcome) => {
            let ok = outcome.within_tolerance() || args.dry_run;
            (outcome, ok)
        }
        Err(SyncError::SyncFailed { before, after, allowed_seconds }) => {
            tracing::error!(
                serial = %identity.serial,
                before_s = before.drift_seconds,
                after_s = after.drift_seconds,
                allowed_s = allowed_seconds,
                "Clock correction did not take"
            );
            eprintln!(
                "Clock correction failed: drift {:+.1}s before, {:+.1}s after (allowed {}s)",
                before.drift_seconds, after.drift_seconds, allowed_seconds
            );
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(store) = &store {
        if outcome.correction_attempted() {
            let _lease = store.lease(identity.key()).await;
            let mut state = store.get(identity.key()).await?;
            state.last_synced_at = Some(Utc::now());
            state.last_drift_seconds = Some(outcome.measured.drift_seconds);
            store.set(identity.key(), &state).await?;
        }
    }

    print_outcome(&identity, &outcome, args.dry_run, args.json)?;
    Ok(in_tolerance)
}

fn print_outcome(identity: &MeterIdentity, outcome: &SyncOutcome, dry_run: bool, json: bool) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let measured = &outcome.measured;
    println!("Meter {} ({}:{})", identity.serial, identity.host, identity.port);
    println!("  meter time:  {}", measured.meter_time.format("%Y-%m-%d %H:%M:%S"));
    println!("  host time:   {}", measured.host_time.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  drift:       {:+.1}s (allowed {}s, round trip {}ms)",
        measured.drift_seconds, outcome.allowed_drift_seconds, measured.round_trip_ms
    );

    match &outcome.corrected {
        Some(corrected) => println!("  synced:      drift now {:+.1}s", corrected.drift_seconds),
        None if outcome.within_tolerance() => println!("  no sync required"),
        None if dry_run => println!("  dry run: clock not written"),
        None => println!("  clock not written"),
    }
    Ok(())
}
