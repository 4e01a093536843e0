use crate::collect::{CollectorSettings, SearchStrategy};
use crate::meter::registers::MAX_RECORDS_PER_WINDOW;
use crate::meter::{WindowParams, DEFAULT_PORT};
use crate::retry::RetryPolicy;
use crate::sync::DEFAULT_ALLOWED_DRIFT_SECONDS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub paging: PagingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

impl Config {
    pub fn window_params(&self) -> WindowParams {
        WindowParams {
            log_type: self.paging.log_type,
            ready_timeout: self.paging.ready_timeout,
            ready_poll_interval: self.paging.ready_poll_interval,
        }
    }

    pub fn collector_settings(&self, reset_pointer: bool) -> CollectorSettings {
        CollectorSettings {
            window: self.window_params(),
            retry: self.retry.clone(),
            records_per_page: self.paging.records_per_page,
            search: self.paging.search,
            checkpoint_interval: self.storage.checkpoint_interval,
            reset_pointer,
        }
    }

    /// Output file for a meter: `<directory>/<serial>.tsv`, where a
    /// per-meter folder overrides `output.directory`.
    pub fn output_path(&self, serial: &str, folder_override: Option<&Path>) -> PathBuf {
        folder_override
            .unwrap_or(&self.output.directory)
            .join(format!("{}.tsv", serial))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on every single register transfer.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingConfig {
    #[serde(default = "default_records_per_page")]
    pub records_per_page: u16,
    #[serde(default)]
    pub log_type: u16,
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,
    #[serde(default = "default_ready_poll_interval", with = "humantime_serde")]
    pub ready_poll_interval: Duration,
    #[serde(default)]
    pub search: SearchStrategy,
}

fn default_records_per_page() -> u16 {
    MAX_RECORDS_PER_WINDOW
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ready_poll_interval() -> Duration {
    Duration::from_millis(200)
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            records_per_page: default_records_per_page(),
            log_type: 0,
            ready_timeout: default_ready_timeout(),
            ready_poll_interval: default_ready_poll_interval(),
            search: SearchStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_allowed_drift")]
    pub allowed_drift_seconds: u32,
    /// Abort collection when a clock correction does not take.
    #[serde(default)]
    pub required: bool,
}

fn default_allowed_drift() -> u32 {
    DEFAULT_ALLOWED_DRIFT_SECONDS
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            allowed_drift_seconds: default_allowed_drift(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("~/.local/share/acuvim-collect/collector.duckdb")
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub include_index: bool,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            include_index: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}
