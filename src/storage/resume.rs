use super::traits::{ResumeState, Storage, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

/// Keyed resume pointers with per-key leases.
///
/// Runs against different meters never contend; two runs against the same
/// meter serialize on the meter's lease for their whole duration.
pub struct ResumeStore {
    storage: Arc<dyn Storage>,
    leases: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResumeStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// State for `key`, or the never-collected default.
    pub async fn get(&self, key: &str) -> Result<ResumeState, StorageError> {
        let state = self.storage.load_resume_state(key).await?;
        if state.is_none() {
            tracing::debug!(key, "No resume state stored, starting fresh");
        }
        Ok(state.unwrap_or_default())
    }

    pub async fn set(&self, key: &str, state: &ResumeState) -> Result<(), StorageError> {
        self.storage.save_resume_state(key, state).await?;
        tracing::debug!(key, last_index = ?state.last_record_index, "Resume state saved");
        Ok(())
    }

    /// Wait for exclusive use of `key`. The lease is released on drop.
    pub async fn lease(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
            leases
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Decides when an in-flight run should persist its progress.
#[derive(Debug)]
pub struct CheckpointTimer {
    interval: Duration,
    last_save: Instant,
}

impl CheckpointTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_save: Instant::now(),
        }
    }

    pub fn should_save(&self) -> bool {
        self.last_save.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.last_save = Instant::now();
    }
}
