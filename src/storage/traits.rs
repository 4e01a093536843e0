use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meter::{MeterIdentity, DEFAULT_PORT};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    async fn load_resume_state(&self, key: &str) -> Result<Option<ResumeState>, StorageError>;

    async fn save_resume_state(&self, key: &str, state: &ResumeState) -> Result<(), StorageError>;

    /// Insert a meter or replace the entry with the same serial.
    async fn upsert_meter(&self, meter: &MeterRecord) -> Result<(), StorageError>;

    async fn get_meter(&self, serial: &str) -> Result<Option<MeterRecord>, StorageError>;

    async fn list_meters(&self, enabled_only: bool) -> Result<Vec<MeterRecord>, StorageError>;

    /// Remove a meter and its resume state. Returns false when it was unknown.
    async fn remove_meter(&self, serial: &str) -> Result<bool, StorageError>;

    async fn set_meter_enabled(&self, serial: &str, enabled: bool) -> Result<bool, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Generic(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(err: duckdb::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// What the collector remembers about one meter between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Highest record index durably written; `None` until the first run lands.
    pub last_record_index: Option<u64>,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_drift_seconds: Option<f64>,
}

impl ResumeState {
    pub fn never_collected(&self) -> bool {
        self.last_record_index.is_none()
    }

    /// Raise the pointer to `index`; lower values are ignored.
    pub fn advance_to(&mut self, index: u64) -> bool {
        match self.last_record_index {
            Some(current) if current >= index => false,
            _ => {
                self.last_record_index = Some(index);
                true
            }
        }
    }
}

/// A fleet registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterRecord {
    pub serial: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub model: Option<String>,
    pub site_name: Option<String>,
    pub enabled: bool,
    /// Overrides `output.directory` for this meter.
    pub output_folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MeterRecord {
    pub fn new(serial: impl Into<String>, host: impl Into<String>, unit_id: u8) -> Self {
        let now = Utc::now();
        Self {
            serial: serial.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            unit_id,
            model: None,
            site_name: None,
            enabled: true,
            output_folder: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identity(&self) -> MeterIdentity {
        MeterIdentity::new(&self.serial, &self.host, self.unit_id).with_port(self.port)
    }
}
