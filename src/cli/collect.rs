use super::{ctrl_c_token, open_store, print_report, CliResult, CollectOptions};
use crate::collect::{CollectionReport, Collector};
use crate::config::Config;
use crate::meter::MeterIdentity;
use crate::sink::TsvSink;
use crate::storage::ResumeStore;
use crate::sync::SystemClock;
use crate::transport::modbus::ModbusTcpTransport;
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Meter serial number; keys the resume pointer and names the output file
    #[arg(long)]
    pub serial: String,

    /// Meter address. When omitted the meter is looked up in the registry
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Modbus unit id
    #[arg(long)]
    pub unit: Option<u8>,

    /// Output TSV file (defaults to <output.directory>/<serial>.tsv)
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub options: CollectOptions,
}

pub async fn run(config: &Config, args: CollectArgs) -> CliResult<CollectionReport> {
    let store = open_store(config).await?;
    let (identity, folder) = resolve_meter(config, &store, &args).await?;

    let collector = build_collector(config, store, &args.options);
    let report = collect_meter(
        &collector,
        config,
        &identity,
        folder.as_deref(),
        args.output.as_deref(),
        &args.options,
    )
    .await?;

    print_report(&report, args.options.json)?;
    Ok(report)
}

pub(crate) fn build_collector(config: &Config, store: Arc<ResumeStore>, options: &CollectOptions) -> Collector {
    Collector::new(
        store,
        Arc::new(SystemClock),
        config.collector_settings(options.reset_pointer),
    )
    .with_cancellation(ctrl_c_token())
}

/// Connect to one meter and run a collection into its TSV file.
pub(crate) async fn collect_meter(
    collector: &Collector,
    config: &Config,
    identity: &MeterIdentity,
    folder: Option<&Path>,
    output: Option<&Path>,
    options: &CollectOptions,
) -> CliResult<CollectionReport> {
    let path = match output {
        Some(path) => path.to_path_buf(),
        None => config.output_path(&identity.serial, folder),
    };

    // An unreachable meter must not leave a header-only file behind.
    let mut transport = ModbusTcpTransport::connect(identity, config.transport.timeout).await?;
    let mut sink = TsvSink::open(&path, config.output.include_index)?;
    info!(serial = %identity.serial, output = %path.display(), "Writing records");

    let report = collector
        .run(
            &mut transport,
            &mut sink,
            identity,
            options.window(),
            &options.sync_options(config),
        )
        .await?;
    Ok(report)
}

/// Build the identity from the command line, or from the registry when no
/// host was given. Command-line port and unit override registry values.
async fn resolve_meter(
    config: &Config,
    store: &ResumeStore,
    args: &CollectArgs,
) -> CliResult<(MeterIdentity, Option<PathBuf>)> {
    if let Some(host) = &args.host {
        let identity = MeterIdentity::new(&args.serial, host, args.unit.unwrap_or(1))
            .with_port(args.port.unwrap_or(config.transport.port));
        return Ok((identity, None));
    }

    let meter = store.storage().get_meter(&args.serial).await?.ok_or_else(|| {
        format!(
            "meter '{}' is not registered; pass --host or add it with 'acuvim-collect meter add'",
            args.serial
        )
    })?;

    let mut identity = meter.identity();
    if let Some(port) = args.port {
        identity.port = port;
    }
    if let Some(unit) = args.unit {
        identity.unit_id = unit;
    }
    Ok((identity, meter.output_folder.map(PathBuf::from)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Mode;
    use crate::storage::duckdb::DuckDbStorage;
    use crate::storage::Storage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options() -> CollectOptions {
        CollectOptions {
            mode: Mode::All,
            minutes: 60,
            sync_time: false,
            check_time: false,
            require_sync: false,
            allowed_drift: None,
            reset_pointer: false,
            json: false,
        }
    }

    #[tokio::test]
    async fn test_unreachable_meter_creates_no_output_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.output.directory = temp_dir.path().to_path_buf();
        config.transport.timeout = Duration::from_secs(1);

        // A port nobody listens on any more.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let identity = MeterIdentity::new("AC1903004", "127.0.0.1", 1).with_port(port);

        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        let store = Arc::new(ResumeStore::new(Arc::new(storage)));
        let collector = Collector::new(store, Arc::new(SystemClock), config.collector_settings(false));

        let result = collect_meter(&collector, &config, &identity, None, None, &options()).await;

        assert!(result.is_err());
        assert!(!config.output_path("AC1903004", None).exists());
    }
}
