//! One collection run against one meter: optional clock sync, start
//! resolution, streaming into the sink and pointer persistence.

use super::paginator::RecordCursor;
use super::window::{CollectionWindow, LogReader, SearchStrategy, StartPoint};
use super::CollectError;
use crate::meter::registers::MAX_RECORDS_PER_WINDOW;
use crate::meter::{MeterIdentity, WindowParams};
use crate::retry::{Retrier, RetryPolicy};
use crate::sink::{RecordSink, SinkError};
use crate::storage::{CheckpointTimer, ResumeState, ResumeStore, StorageError};
use crate::sync::{Clock, SyncError, SyncOutcome, SyncPolicy, TimeSync, DEFAULT_ALLOWED_DRIFT_SECONDS};
use crate::transport::{RegisterTransport, TransportError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("time sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("output error: {0}")]
    Sink(#[from] SinkError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Start,
    SyncTime,
    ResolveStartIndex,
    Collect,
    PersistPointer,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Start => "START",
            RunPhase::SyncTime => "SYNC_TIME",
            RunPhase::ResolveStartIndex => "RESOLVE_START_INDEX",
            RunPhase::Collect => "COLLECT",
            RunPhase::PersistPointer => "PERSIST_POINTER",
            RunPhase::Done => "DONE",
            RunPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Complete,
    Empty,
    Partial,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Measure drift before collecting.
    pub enabled: bool,
    /// Correct drift that exceeds the allowance.
    pub auto_sync: bool,
    pub allowed_drift_seconds: u32,
    /// Abort the run when a correction does not take.
    pub required: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_sync: false,
            allowed_drift_seconds: DEFAULT_ALLOWED_DRIFT_SECONDS,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub window: WindowParams,
    pub retry: RetryPolicy,
    pub records_per_page: u16,
    pub search: SearchStrategy,
    pub checkpoint_interval: Duration,
    /// Forget the stored pointer before resolving the start.
    pub reset_pointer: bool,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            window: WindowParams::default(),
            retry: RetryPolicy::default(),
            records_per_page: MAX_RECORDS_PER_WINDOW,
            search: SearchStrategy::default(),
            checkpoint_interval: Duration::from_secs(30),
            reset_pointer: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub run_id: Uuid,
    pub serial: String,
    pub window: CollectionWindow,
    pub phase: RunPhase,
    pub outcome: RunOutcome,
    pub start_offset: Option<u32>,
    pub start_index: Option<u64>,
    pub records_written: u64,
    pub first_index: Option<u64>,
    pub last_index: Option<u64>,
    pub skipped: u64,
    pub gaps: u64,
    pub rejected: u64,
    pub pages_read: u32,
    /// Window reads spent locating the start.
    pub search_reads: u32,
    pub retries: u32,
    pub records_lost: u64,
    pub pointer_ahead: bool,
    pub sync: Option<SyncOutcome>,
    pub sync_error: Option<String>,
    pub interrupted: Option<String>,
    pub pointer_before: Option<u64>,
    pub pointer_after: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CollectionReport {
    fn new(serial: &str, window: CollectionWindow, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            serial: serial.to_string(),
            window,
            phase: RunPhase::Start,
            outcome: RunOutcome::Empty,
            start_offset: None,
            start_index: None,
            records_written: 0,
            first_index: None,
            last_index: None,
            skipped: 0,
            gaps: 0,
            rejected: 0,
            pages_read: 0,
            search_reads: 0,
            retries: 0,
            records_lost: 0,
            pointer_ahead: false,
            sync: None,
            sync_error: None,
            interrupted: None,
            pointer_before: None,
            pointer_after: None,
            started_at,
            finished_at: None,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::info!(serial = %self.serial, run_id = %self.run_id, phase = %phase, "Entering phase");
        self.phase = phase;
    }

    /// Whether the run counts as a success for the operator: it finished, or
    /// it was cut short after making progress. A clock correction that did
    /// not take is a failure even when collection went ahead.
    pub fn succeeded(&self) -> bool {
        if self.sync_error.is_some() {
            return false;
        }
        match self.outcome {
            RunOutcome::Complete | RunOutcome::Empty => true,
            RunOutcome::Partial => self.records_written > 0,
        }
    }
}

/// Tracks what has been handed to the sink versus what is known durable.
#[derive(Debug, Default)]
struct Progress {
    first_written: Option<u64>,
    written_max: Option<u64>,
    durable_max: Option<u64>,
}

pub struct Collector {
    store: Arc<ResumeStore>,
    clock: Arc<dyn Clock>,
    settings: CollectorSettings,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(store: Arc<ResumeStore>, clock: Arc<dyn Clock>, settings: CollectorSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Run one collection against `identity`, writing new records to `sink`.
    ///
    /// The meter's lease is held for the whole run. Interrupted runs return a
    /// `Partial` report rather than an error; their progress is persisted.
    pub async fn run<T, S>(
        &self,
        transport: &mut T,
        sink: &mut S,
        identity: &MeterIdentity,
        window: CollectionWindow,
        sync: &SyncOptions,
    ) -> Result<CollectionReport, CollectorError>
    where
        T: RegisterTransport + ?Sized,
        S: RecordSink + ?Sized,
    {
        let mut report = CollectionReport::new(identity.key(), window, self.clock.utc());
        report.enter(RunPhase::Start);

        let _lease = self.store.lease(identity.key()).await;

        match self.drive(transport, sink, identity, sync, &mut report).await {
            Ok(()) => {
                report.finished_at = Some(self.clock.utc());
                report.enter(RunPhase::Done);
                tracing::info!(
                    serial = %identity.serial,
                    written = report.records_written,
                    outcome = ?report.outcome,
                    pointer = ?report.pointer_after,
                    "Collection finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(serial = %identity.serial, phase = %report.phase, error = %e, "Collection failed");
                report.enter(RunPhase::Failed);
                Err(e)
            }
        }
    }

    async fn drive<T, S>(
        &self,
        transport: &mut T,
        sink: &mut S,
        identity: &MeterIdentity,
        sync: &SyncOptions,
        report: &mut CollectionReport,
    ) -> Result<(), CollectorError>
    where
        T: RegisterTransport + ?Sized,
        S: RecordSink + ?Sized,
    {
        let key = identity.key();
        let mut state = self.store.get(key).await?;
        report.pointer_before = state.last_record_index;

        if self.settings.reset_pointer {
            tracing::warn!(serial = %identity.serial, pointer = ?state.last_record_index, "Resetting resume pointer");
            state.last_record_index = None;
        }

        if sync.enabled {
            report.enter(RunPhase::SyncTime);
            self.sync_clock(transport, key, sync, &mut state, report).await?;
        }

        report.enter(RunPhase::ResolveStartIndex);
        let mut reader = LogReader::new(&mut *transport, self.settings.window.clone(), self.settings.retry.clone())
            .with_page_size(self.settings.records_per_page);
        let status = reader.status().await?;
        tracing::info!(
            serial = %identity.serial,
            used = status.used_records,
            max = status.max_records,
            first = ?status.first_timestamp,
            last = ?status.last_timestamp,
            "Log status"
        );

        let mut progress = Progress::default();

        if status.is_empty() {
            tracing::info!(serial = %identity.serial, "Meter log is empty");
            report.retries += reader.retries();
            report.outcome = RunOutcome::Empty;
            report.enter(RunPhase::PersistPointer);
            return self.persist(key, &mut state, report, &progress, None).await;
        }

        let start = match report.window {
            CollectionWindow::All => reader.resolve_resume(&status, state.last_record_index).await?,
            CollectionWindow::Last { minutes } => {
                reader
                    .resolve_since(&status, self.clock.local(), minutes, self.settings.search)
                    .await?
            }
        };
        report.start_offset = Some(start.offset);
        report.start_index = start.first_index;
        report.records_lost = start.records_lost;
        report.pointer_ahead = start.pointer_ahead;
        tracing::info!(
            serial = %identity.serial,
            offset = start.offset,
            floor = ?start.floor,
            lost = start.records_lost,
            "Start resolved"
        );

        report.enter(RunPhase::Collect);
        let mut cursor = RecordCursor::new(
            reader,
            &start,
            status.used_records,
            self.settings.records_per_page,
            self.cancel.clone(),
        );
        let mut timer = CheckpointTimer::new(self.settings.checkpoint_interval);
        let mut sink_failure: Option<SinkError> = None;

        loop {
            let record = match cursor.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(CollectError::Interrupted { last_index, reason }) => {
                    tracing::warn!(serial = %identity.serial, last_index = ?last_index, reason = %reason, "Collection interrupted");
                    report.interrupted = Some(reason.to_string());
                    break;
                }
            };

            if let Err(e) = sink.append(&record) {
                sink_failure = Some(e);
                break;
            }
            progress.first_written.get_or_insert(record.index);
            progress.written_max = Some(record.index);
            report.records_written += 1;

            if timer.should_save() {
                if let Err(e) = sink.flush() {
                    sink_failure = Some(e);
                    break;
                }
                progress.durable_max = progress.written_max;
                let target = pointer_target(report.window, &state, &start, &progress);
                if let Some(index) = target {
                    if state.advance_to(index) {
                        self.store.set(key, &state).await?;
                        tracing::debug!(serial = %identity.serial, pointer = index, "Checkpoint saved");
                    }
                }
                timer.reset();
            }
        }

        let stats = cursor.stats();
        report.skipped = stats.skipped;
        report.gaps = stats.gaps;
        report.rejected = stats.rejected;
        report.pages_read = stats.pages_read;
        report.retries += cursor.reader().retries();
        report.search_reads = cursor.reader().window_reads().saturating_sub(stats.pages_read);
        report.first_index = progress.first_written;
        report.last_index = progress.written_max;
        drop(cursor);

        if stats.skipped > 0 {
            tracing::warn!(serial = %identity.serial, skipped = stats.skipped, "Non-increasing records were dropped");
        }
        if stats.gaps > 0 {
            tracing::warn!(serial = %identity.serial, missing = stats.gaps, "Index sequence had gaps");
        }

        report.enter(RunPhase::PersistPointer);

        if let Some(e) = sink_failure {
            // Whatever reached the writer before the failure may still be flushable.
            if sink.flush().is_ok() {
                progress.durable_max = progress.written_max;
            }
            report.outcome = RunOutcome::Partial;
            let target = pointer_target(report.window, &state, &start, &progress);
            self.persist(key, &mut state, report, &progress, target).await?;
            return Err(e.into());
        }

        sink.flush()?;
        progress.durable_max = progress.written_max;

        report.outcome = if report.interrupted.is_some() {
            RunOutcome::Partial
        } else if report.records_written == 0 {
            RunOutcome::Empty
        } else {
            RunOutcome::Complete
        };

        let target = pointer_target(report.window, &state, &start, &progress);
        self.persist(key, &mut state, report, &progress, target).await
    }

    async fn sync_clock<T>(
        &self,
        transport: &mut T,
        key: &str,
        options: &SyncOptions,
        state: &mut ResumeState,
        report: &mut CollectionReport,
    ) -> Result<(), CollectorError>
    where
        T: RegisterTransport + ?Sized,
    {
        let engine = TimeSync::new(
            self.clock.clone(),
            SyncPolicy {
                allowed_drift_seconds: options.allowed_drift_seconds,
                auto_sync: options.auto_sync,
            },
        );
        let mut retrier = Retrier::new(self.settings.retry.clone());
        let result = engine.check_and_sync(transport, &mut retrier).await;
        report.retries += retrier.retries();

        match result {
            Ok(outcome) => {
                if outcome.correction_attempted() {
                    state.last_synced_at = Some(self.clock.utc());
                    state.last_drift_seconds = Some(outcome.measured.drift_seconds);
                    self.store.set(key, state).await?;
                }
                report.sync = Some(outcome);
                Ok(())
            }
            Err(SyncError::SyncFailed { before, after, allowed_seconds }) => {
                state.last_synced_at = Some(self.clock.utc());
                state.last_drift_seconds = Some(after.drift_seconds);
                self.store.set(key, state).await?;

                let err = SyncError::SyncFailed {
                    before,
                    after,
                    allowed_seconds,
                };
                report.sync_error = Some(err.to_string());
                if options.required {
                    return Err(err.into());
                }
                tracing::warn!(error = %err, "Continuing without a synchronized clock");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(
        &self,
        key: &str,
        state: &mut ResumeState,
        report: &mut CollectionReport,
        progress: &Progress,
        target: Option<u64>,
    ) -> Result<(), CollectorError> {
        if let Some(index) = target {
            state.advance_to(index);
        } else if progress.durable_max.is_some() {
            tracing::info!(
                serial = %key,
                written = ?progress.durable_max,
                "Snapshot not contiguous with the resume pointer, pointer left unchanged"
            );
        }
        state.last_collected_at = Some(self.clock.utc());
        self.store.set(key, state).await?;
        report.pointer_after = state.last_record_index;
        Ok(())
    }
}

/// The index the pointer may advance to after durably writing `progress`.
///
/// `Last` snapshots only move the pointer when they leave no hole between it
/// and the records written, so a later `All` run cannot skip anything.
fn pointer_target(
    window: CollectionWindow,
    state: &ResumeState,
    start: &StartPoint,
    progress: &Progress,
) -> Option<u64> {
    let durable = progress.durable_max?;
    match window {
        CollectionWindow::All => Some(durable),
        CollectionWindow::Last { .. } => {
            let first = progress.first_written?;
            let contiguous = match state.last_record_index {
                Some(pointer) => first <= pointer.saturating_add(1),
                None => start.offset == 0,
            };
            contiguous.then_some(durable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::window::Floor;

    fn start(offset: u32) -> StartPoint {
        StartPoint {
            offset,
            floor: Floor::None,
            records_lost: 0,
            pointer_ahead: false,
            first_index: None,
        }
    }

    fn progress(first: u64, durable: u64) -> Progress {
        Progress {
            first_written: Some(first),
            written_max: Some(durable),
            durable_max: Some(durable),
        }
    }

    fn at(pointer: Option<u64>) -> ResumeState {
        ResumeState {
            last_record_index: pointer,
            ..ResumeState::default()
        }
    }

    #[test]
    fn test_all_always_advances() {
        let target = pointer_target(CollectionWindow::All, &at(Some(10)), &start(10), &progress(11, 40));
        assert_eq!(target, Some(40));
    }

    #[test]
    fn test_last_advances_only_when_contiguous() {
        let last = CollectionWindow::Last { minutes: 60 };

        assert_eq!(pointer_target(last, &at(Some(10)), &start(5), &progress(11, 40)), Some(40));
        assert_eq!(pointer_target(last, &at(Some(10)), &start(5), &progress(8, 40)), Some(40));
        assert_eq!(pointer_target(last, &at(Some(10)), &start(30), &progress(31, 40)), None);

        assert_eq!(pointer_target(last, &at(None), &start(0), &progress(1, 40)), Some(40));
        assert_eq!(pointer_target(last, &at(None), &start(12), &progress(13, 40)), None);
    }

    #[test]
    fn test_nothing_durable_moves_nothing() {
        let p = Progress::default();
        assert_eq!(pointer_target(CollectionWindow::All, &at(Some(3)), &start(0), &p), None);
    }

    #[test]
    fn test_report_success_rules() {
        let mut report = CollectionReport::new("AC-1", CollectionWindow::All, Utc::now());
        report.outcome = RunOutcome::Empty;
        assert!(report.succeeded());

        report.outcome = RunOutcome::Partial;
        assert!(!report.succeeded());
        report.records_written = 1;
        assert!(report.succeeded());
    }

    #[test]
    fn test_failed_correction_is_not_success() {
        let mut report = CollectionReport::new("AC-1", CollectionWindow::All, Utc::now());
        report.outcome = RunOutcome::Complete;
        report.records_written = 12;
        report.sync_error = Some("meter clock still off by -300.0s after correction (allowed 60s)".into());
        assert!(!report.succeeded());
    }
}
