//! Log access for collection: retried window reads and resolution of the
//! offset a run starts from.

use crate::meter::registers::MAX_RECORDS_PER_WINDOW;
use crate::meter::{decode_page, read_log_status, read_window, LogRecord, LogStatus, PageDecode, WindowParams};
use crate::retry::{Retrier, RetryPolicy};
use crate::transport::{RegisterTransport, TransportError};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which part of the log a run collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CollectionWindow {
    /// Everything retained, or everything after the resume pointer.
    All,
    /// Records stamped at or after `now - minutes`.
    Last { minutes: u32 },
}

impl fmt::Display for CollectionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionWindow::All => write!(f, "all"),
            CollectionWindow::Last { minutes } => write!(f, "last {}m", minutes),
        }
    }
}

/// How a timestamp boundary is located in the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[default]
    Binary,
    Sequential,
}

/// Lowest record a run accepts. Anything below it is dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Floor {
    None,
    Index(u64),
    Time(NaiveDateTime),
}

impl Floor {
    pub fn admits(&self, record: &LogRecord) -> bool {
        match self {
            Floor::None => true,
            Floor::Index(min) => record.index >= *min,
            Floor::Time(min) => record.timestamp >= *min,
        }
    }
}

/// Where a run begins reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPoint {
    pub offset: u32,
    pub floor: Floor,
    /// Records between the resume pointer and the oldest retained record.
    pub records_lost: u64,
    pub pointer_ahead: bool,
    /// Index of the first record at `offset`, when resolution read it.
    pub first_index: Option<u64>,
}

impl StartPoint {
    fn from_offset(offset: u32, floor: Floor) -> Self {
        Self {
            offset,
            floor,
            records_lost: 0,
            pointer_ahead: false,
            first_index: None,
        }
    }
}

/// Retried, decoded access to the historical log of one meter.
pub struct LogReader<T> {
    transport: T,
    params: WindowParams,
    retrier: Retrier,
    page_size: u16,
    window_reads: u32,
}

impl<T: RegisterTransport> LogReader<T> {
    pub fn new(transport: T, params: WindowParams, retry: RetryPolicy) -> Self {
        Self {
            transport,
            params,
            retrier: Retrier::new(retry),
            page_size: MAX_RECORDS_PER_WINDOW,
            window_reads: 0,
        }
    }

    /// Records per window for the reads made while resolving a start.
    pub fn with_page_size(mut self, page_size: u16) -> Self {
        self.page_size = page_size.clamp(1, MAX_RECORDS_PER_WINDOW);
        self
    }

    pub fn retries(&self) -> u32 {
        self.retrier.retries()
    }

    /// Successful window reads, including those made to resolve the start.
    pub fn window_reads(&self) -> u32 {
        self.window_reads
    }

    pub async fn status(&mut self) -> Result<LogStatus, TransportError> {
        self.retrier
            .run(&mut self.transport, "read log status", |t| {
                Box::pin(read_log_status(t))
            })
            .await
    }

    /// Read and decode `count` records from `offset`.
    ///
    /// A window whose filled slots all fail to decode is treated like a
    /// failed transfer and retried.
    pub async fn read_page(&mut self, offset: u32, count: u16) -> Result<PageDecode, TransportError> {
        let params = self.params.clone();
        let page = self
            .retrier
            .run(&mut self.transport, "read log window", move |t| {
                let params = params.clone();
                Box::pin(async move {
                    let words = read_window(t, &params, offset, count).await?;
                    let page = decode_page(&words);
                    if page.filled > 0 && page.records.is_empty() {
                        return Err(TransportError::Undecodable {
                            offset,
                            rejected: page.rejected,
                        });
                    }
                    Ok(page)
                })
            })
            .await?;
        self.window_reads += 1;
        Ok(page)
    }

    /// First decodable record at or after `offset`, with the offset it sits
    /// at. Reads a whole page; corrupt slots are passed over.
    async fn record_from(&mut self, offset: u32, used: u32) -> Result<Option<(u32, LogRecord)>, TransportError> {
        if offset >= used {
            return Ok(None);
        }
        let count = (used - offset).min(self.page_size as u32) as u16;
        let page = self.read_page(offset, count).await?;
        Ok(page
            .slots
            .into_iter()
            .zip(page.records)
            .next()
            .map(|(slot, record)| (offset + slot as u32, record)))
    }

    /// Last decodable record before `end`, with its offset.
    async fn record_before(&mut self, end: u32) -> Result<Option<(u32, LogRecord)>, TransportError> {
        let count = end.min(self.page_size as u32) as u16;
        if count == 0 {
            return Ok(None);
        }
        let offset = end - count as u32;
        let page = self.read_page(offset, count).await?;
        Ok(page
            .slots
            .into_iter()
            .zip(page.records)
            .last()
            .map(|(slot, record)| (offset + slot as u32, record)))
    }

    /// First offset in `[0, used)` whose record satisfies `reached`, assuming
    /// the log is ordered. Returns `used` when no record does. Undecodable
    /// slots just before the boundary may be included.
    async fn lower_bound<F>(&mut self, used: u32, reached: F) -> Result<u32, TransportError>
    where
        F: Fn(&LogRecord) -> bool,
    {
        let (mut lo, mut hi) = (0u32, used);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.record_from(mid, used).await? {
                Some((_, record)) if reached(&record) => hi = mid,
                Some((at, _)) => lo = (at + 1).min(hi),
                // The log shrank under us; treat the slot as past the end.
                None => hi = mid,
            }
        }
        tracing::debug!(offset = lo, used, "Binary search settled");
        Ok(lo)
    }

    /// Scan page by page for the first page holding a record at or after
    /// `threshold`. Returns that page's offset.
    async fn scan_for_time(&mut self, used: u32, threshold: NaiveDateTime) -> Result<u32, TransportError> {
        let mut offset = 0u32;
        while offset < used {
            let count = (used - offset).min(self.page_size as u32) as u16;
            let page = self.read_page(offset, count).await?;
            if page.records.iter().any(|r| r.timestamp >= threshold) {
                return Ok(offset);
            }
            if page.filled < count as usize {
                break;
            }
            offset += count as u32;
        }
        Ok(used)
    }

    /// Where an `All` run resumes after `last_index`.
    pub async fn resolve_resume(
        &mut self,
        status: &LogStatus,
        last_index: Option<u64>,
    ) -> Result<StartPoint, TransportError> {
        let used = status.used_records;
        let Some(last) = last_index else {
            return Ok(StartPoint::from_offset(0, Floor::None));
        };
        let target = last + 1;
        let floor = Floor::Index(target);

        let Some((oldest_at, oldest)) = self.record_from(0, used).await? else {
            return Ok(StartPoint::from_offset(used, floor));
        };

        if target <= oldest.index {
            let lost = oldest.index - target;
            if lost > 0 {
                tracing::warn!(
                    resume_from = target,
                    oldest = oldest.index,
                    lost,
                    "Log wrapped past the resume pointer, records lost"
                );
            }
            return Ok(StartPoint {
                records_lost: lost,
                first_index: Some(oldest.index),
                ..StartPoint::from_offset(0, floor)
            });
        }

        let Some((_, newest)) = self.record_before(used).await? else {
            return Ok(StartPoint::from_offset(used, floor));
        };

        if newest.index < last {
            tracing::warn!(
                pointer = last,
                newest = newest.index,
                "Resume pointer is ahead of the meter log, nothing collected"
            );
            return Ok(StartPoint {
                pointer_ahead: true,
                ..StartPoint::from_offset(used, floor)
            });
        }
        if newest.index == last {
            return Ok(StartPoint::from_offset(used, floor));
        }

        // Record numbers are usually dense, so the offset is usually exact.
        let guess = oldest_at as u64 + (target - oldest.index);
        if guess < used as u64 {
            if let Some((at, record)) = self.record_from(guess as u32, used).await? {
                if record.index == target {
                    return Ok(StartPoint {
                        first_index: Some(record.index),
                        ..StartPoint::from_offset(at, floor)
                    });
                }
                tracing::debug!(guess, found = record.index, target, "Offset guess missed, searching");
            }
        }

        let offset = self.lower_bound(used, |r| r.index >= target).await?;
        Ok(StartPoint::from_offset(offset, floor))
    }

    /// Where a `Last { minutes }` run starts, relative to `now`.
    pub async fn resolve_since(
        &mut self,
        status: &LogStatus,
        now: NaiveDateTime,
        minutes: u32,
        strategy: SearchStrategy,
    ) -> Result<StartPoint, TransportError> {
        let threshold = now - ChronoDuration::minutes(minutes as i64);
        let floor = Floor::Time(threshold);
        let used = status.used_records;

        tracing::debug!(threshold = %threshold, ?strategy, "Resolving time window");

        if let Some(first) = status.first_timestamp {
            if first >= threshold {
                return Ok(StartPoint::from_offset(0, floor));
            }
        }
        if let Some(last) = status.last_timestamp {
            if last < threshold {
                return Ok(StartPoint::from_offset(used, floor));
            }
        }

        let offset = match strategy {
            SearchStrategy::Binary => self.lower_bound(used, |r| r.timestamp >= threshold).await?,
            SearchStrategy::Sequential => self.scan_for_time(used, threshold).await?,
        };
        Ok(StartPoint::from_offset(offset, floor))
    }
}
