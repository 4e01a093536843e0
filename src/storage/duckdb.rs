use super::traits::{MeterRecord, ResumeState, Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    // "... (PID 12345) ..."
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove the WAL and lock files left behind by a dead collector
fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!("Removed stale {} file: {}", suffix, path.display());
        }
    }
    Ok(())
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Generic("database connection mutex poisoned".to_string()))
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Database(format!("Task join error: {}", e))
}

fn timestamp_from_micros(column: usize, micros: i64) -> duckdb::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            column,
            duckdb::types::Type::BigInt,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid timestamp")),
        )
    })
}

fn optional_timestamp(column: usize, micros: Option<i64>) -> duckdb::Result<Option<DateTime<Utc>>> {
    micros.map(|m| timestamp_from_micros(column, m)).transpose()
}

const METER_COLUMNS: &str = "serial, host, port, unit_id, model, site_name, enabled, output_folder, \
     epoch_us(created_at), epoch_us(updated_at)";

fn meter_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<MeterRecord> {
    Ok(MeterRecord {
        serial: row.get(0)?,
        host: row.get(1)?,
        port: row.get::<_, i32>(2)? as u16,
        unit_id: row.get::<_, i32>(3)? as u8,
        model: row.get(4)?,
        site_name: row.get(5)?,
        enabled: row.get(6)?,
        output_folder: row.get(7)?,
        created_at: timestamp_from_micros(8, row.get(8)?)?,
        updated_at: timestamp_from_micros(9, row.get(9)?)?,
    })
}

/// DuckDB-backed fleet registry and resume store
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    /// Open (or create) the database file, clearing a lock left by a dead process
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Generic(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            }),
            Err(e) => {
                let error_msg = e.to_string();

                if error_msg.contains("Could not set lock") {
                    tracing::warn!("Database lock detected: {}", error_msg);

                    if let Some(pid) = extract_pid_from_lock_error(&error_msg) {
                        if !is_process_running(pid) {
                            tracing::warn!("Process {} is not running, removing stale lock files", pid);

                            if let Err(io_err) = remove_lock_files(path) {
                                tracing::error!("Failed to remove lock files: {}", io_err);
                                return Err(e.into());
                            }

                            let conn = Connection::open(path)?;
                            return Ok(Self {
                                conn: Arc::new(Mutex::new(conn)),
                            });
                        }
                        tracing::error!("Process {} is still running, cannot acquire lock", pid);
                    }
                }

                Err(e.into())
            }
        }
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS meters (
                    serial VARCHAR PRIMARY KEY,
                    host VARCHAR NOT NULL,
                    port INTEGER NOT NULL,
                    unit_id INTEGER NOT NULL,
                    model VARCHAR,
                    site_name VARCHAR,
                    enabled BOOLEAN NOT NULL DEFAULT TRUE,
                    output_folder VARCHAR,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS resume_state (
                    serial VARCHAR PRIMARY KEY,
                    last_record_index BIGINT,
                    last_collected_at TIMESTAMPTZ,
                    last_synced_at TIMESTAMPTZ,
                    last_drift_seconds DOUBLE,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn load_resume_state(&self, key: &str) -> Result<Option<ResumeState>, StorageError> {
        let conn = self.conn.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT last_record_index, epoch_us(last_collected_at), epoch_us(last_synced_at), last_drift_seconds
                 FROM resume_state WHERE serial = ?",
            )?;

            let mut rows = stmt.query(duckdb::params![key])?;

            let state = match rows.next()? {
                Some(row) => Some(ResumeState {
                    last_record_index: row.get::<_, Option<i64>>(0)?.map(|i| i as u64),
                    last_collected_at: optional_timestamp(1, row.get(1)?)?,
                    last_synced_at: optional_timestamp(2, row.get(2)?)?,
                    last_drift_seconds: row.get(3)?,
                }),
                None => None,
            };
            Ok(state)
        })
        .await
        .map_err(join_error)?
    }

    async fn save_resume_state(&self, key: &str, state: &ResumeState) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let state = state.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            conn.execute(
                "INSERT OR REPLACE INTO resume_state
                    (serial, last_record_index, last_collected_at, last_synced_at, last_drift_seconds, updated_at)
                 VALUES (?, ?, to_timestamp(? / 1000000.0), to_timestamp(? / 1000000.0), ?, to_timestamp(? / 1000000.0))",
                duckdb::params![
                    key,
                    state.last_record_index.map(|i| i as i64),
                    state.last_collected_at.map(|t| t.timestamp_micros()),
                    state.last_synced_at.map(|t| t.timestamp_micros()),
                    state.last_drift_seconds,
                    Utc::now().timestamp_micros(),
                ],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn upsert_meter(&self, meter: &MeterRecord) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let meter = meter.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            // Keep the original registration time across updates
            let mut stmt = conn.prepare("SELECT epoch_us(created_at) FROM meters WHERE serial = ?")?;
            let mut rows = stmt.query(duckdb::params![meter.serial])?;
            let created_at: Option<i64> = match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            };
            drop(rows);
            drop(stmt);

            conn.execute(
                "INSERT OR REPLACE INTO meters
                    (serial, host, port, unit_id, model, site_name, enabled, output_folder, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, to_timestamp(? / 1000000.0), to_timestamp(? / 1000000.0))",
                duckdb::params![
                    meter.serial,
                    meter.host,
                    meter.port as i32,
                    meter.unit_id as i32,
                    meter.model,
                    meter.site_name,
                    meter.enabled,
                    meter.output_folder,
                    created_at.unwrap_or_else(|| meter.created_at.timestamp_micros()),
                    meter.updated_at.timestamp_micros(),
                ],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn get_meter(&self, serial: &str) -> Result<Option<MeterRecord>, StorageError> {
        let conn = self.conn.clone();
        let serial = serial.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(&format!("SELECT {} FROM meters WHERE serial = ?", METER_COLUMNS))?;
            let mut rows = stmt.query(duckdb::params![serial])?;

            let meter = match rows.next()? {
                Some(row) => Some(meter_from_row(row)?),
                None => None,
            };
            Ok(meter)
        })
        .await
        .map_err(join_error)?
    }

    async fn list_meters(&self, enabled_only: bool) -> Result<Vec<MeterRecord>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let filter = if enabled_only { "WHERE enabled" } else { "" };
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM meters {} ORDER BY serial",
                METER_COLUMNS, filter
            ))?;

            let rows = stmt.query_map([], |row| meter_from_row(row))?;

            let mut meters = Vec::new();
            for row in rows {
                meters.push(row?);
            }
            Ok(meters)
        })
        .await
        .map_err(join_error)?
    }

    async fn remove_meter(&self, serial: &str) -> Result<bool, StorageError> {
        let conn = self.conn.clone();
        let serial = serial.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let removed = conn.execute("DELETE FROM meters WHERE serial = ?", duckdb::params![serial])?;
            conn.execute("DELETE FROM resume_state WHERE serial = ?", duckdb::params![serial])?;
            Ok::<bool, StorageError>(removed > 0)
        })
        .await
        .map_err(join_error)?
    }

    async fn set_meter_enabled(&self, serial: &str, enabled: bool) -> Result<bool, StorageError> {
        let conn = self.conn.clone();
        let serial = serial.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let changed = conn.execute(
                "UPDATE meters SET enabled = ?, updated_at = to_timestamp(? / 1000000.0) WHERE serial = ?",
                duckdb::params![enabled, Utc::now().timestamp_micros(), serial],
            )?;
            Ok::<bool, StorageError>(changed > 0)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_storage() -> DuckDbStorage {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let storage = DuckDbStorage::in_memory().unwrap();
        assert!(storage.init_schema().await.is_ok());
        // Idempotent
        assert!(storage.init_schema().await.is_ok());
    }

    #[tokio::test]
    async fn test_resume_state_round_trip() {
        let storage = setup_storage().await;
        assert!(storage.load_resume_state("AC-1").await.unwrap().is_none());

        let state = ResumeState {
            last_record_index: Some(500),
            last_collected_at: Some(Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()),
            last_synced_at: None,
            last_drift_seconds: Some(-2.5),
        };
        storage.save_resume_state("AC-1", &state).await.unwrap();

        let loaded = storage.load_resume_state("AC-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(storage.load_resume_state("AC-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_state_last_write_wins() {
        let storage = setup_storage().await;

        let mut state = ResumeState::default();
        storage.save_resume_state("AC-1", &state).await.unwrap();
        let loaded = storage.load_resume_state("AC-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_record_index, None);

        state.last_record_index = Some(0);
        storage.save_resume_state("AC-1", &state).await.unwrap();
        let loaded = storage.load_resume_state("AC-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_record_index, Some(0));
    }

    #[tokio::test]
    async fn test_meter_registry() {
        let storage = setup_storage().await;

        let mut meter = MeterRecord::new("AC-1", "10.0.0.5", 1);
        meter.site_name = Some("Pump house".to_string());
        storage.upsert_meter(&meter).await.unwrap();
        storage
            .upsert_meter(&MeterRecord::new("AC-0", "10.0.0.4", 2))
            .await
            .unwrap();

        let loaded = storage.get_meter("AC-1").await.unwrap().unwrap();
        assert_eq!(loaded.host, "10.0.0.5");
        assert_eq!(loaded.port, 502);
        assert_eq!(loaded.site_name.as_deref(), Some("Pump house"));
        assert!(loaded.enabled);

        let all = storage.list_meters(false).await.unwrap();
        let serials: Vec<&str> = all.iter().map(|m| m.serial.as_str()).collect();
        assert_eq!(serials, vec!["AC-0", "AC-1"]);

        assert!(storage.set_meter_enabled("AC-0", false).await.unwrap());
        assert!(!storage.set_meter_enabled("missing", false).await.unwrap());
        let enabled = storage.list_meters(true).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].serial, "AC-1");
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at() {
        let storage = setup_storage().await;

        let mut meter = MeterRecord::new("AC-1", "10.0.0.5", 1);
        meter.created_at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        storage.upsert_meter(&meter).await.unwrap();

        let mut moved = MeterRecord::new("AC-1", "10.0.0.9", 1);
        moved.created_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        storage.upsert_meter(&moved).await.unwrap();

        let loaded = storage.get_meter("AC-1").await.unwrap().unwrap();
        assert_eq!(loaded.host, "10.0.0.9");
        assert_eq!(loaded.created_at, meter.created_at);
    }

    #[tokio::test]
    async fn test_remove_meter_drops_resume_state() {
        let storage = setup_storage().await;
        storage
            .upsert_meter(&MeterRecord::new("AC-1", "10.0.0.5", 1))
            .await
            .unwrap();
        let state = ResumeState {
            last_record_index: Some(9),
            ..ResumeState::default()
        };
        storage.save_resume_state("AC-1", &state).await.unwrap();

        assert!(storage.remove_meter("AC-1").await.unwrap());
        assert!(storage.get_meter("AC-1").await.unwrap().is_none());
        assert!(storage.load_resume_state("AC-1").await.unwrap().is_none());
        assert!(!storage.remove_meter("AC-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backed_storage_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("collector.duckdb");

        {
            let storage = DuckDbStorage::new(&path).unwrap();
            storage.init_schema().await.unwrap();
            let state = ResumeState {
                last_record_index: Some(42),
                ..ResumeState::default()
            };
            storage.save_resume_state("AC-1", &state).await.unwrap();
        }

        let storage = DuckDbStorage::new(&path).unwrap();
        storage.init_schema().await.unwrap();
        let loaded = storage.load_resume_state("AC-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_record_index, Some(42));
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let error_msg = "IO Error: Could not set lock on file \"/var/lib/acuvim/collector.duckdb\": Conflicting lock is held in /usr/bin/acuvim-collect (PID 12345). See also https://duckdb.org/docs/stable/connect/concurrency";
        assert_eq!(extract_pid_from_lock_error(error_msg), Some(12345));
        assert_eq!(extract_pid_from_lock_error("Some other error"), None);
        assert_eq!(extract_pid_from_lock_error("Error (PID abc)"), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999999));
    }
}
