use super::window::{Floor, LogReader, StartPoint};
use super::{CollectError, InterruptReason};
use crate::meter::registers::MAX_RECORDS_PER_WINDOW;
use crate::meter::LogRecord;
use crate::transport::RegisterTransport;
use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Counters kept by a cursor while it walks the log.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CursorStats {
    pub pages_read: u32,
    pub emitted: u64,
    /// Records dropped because their index did not increase.
    pub skipped: u64,
    /// Indices missing between consecutive records handed out.
    pub gaps: u64,
    /// Records that failed to decode.
    pub rejected: u64,
}

/// Forward-only cursor over the historical log.
///
/// Holds at most one decoded window. The next window is requested only once
/// the buffered records have been consumed, so dropping the cursor early
/// costs no further register traffic.
pub struct RecordCursor<T> {
    reader: LogReader<T>,
    next_offset: u32,
    end_offset: u32,
    page_size: u16,
    floor: Floor,
    buffer: VecDeque<LogRecord>,
    last_index: Option<u64>,
    exhausted: bool,
    cancel: CancellationToken,
    stats: CursorStats,
}

impl<T: RegisterTransport> RecordCursor<T> {
    /// A cursor from `start` up to `end_offset`, the used-record count seen
    /// when the run began.
    pub fn new(
        reader: LogReader<T>,
        start: &StartPoint,
        end_offset: u32,
        page_size: u16,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            next_offset: start.offset,
            end_offset,
            page_size: page_size.clamp(1, MAX_RECORDS_PER_WINDOW),
            floor: start.floor,
            buffer: VecDeque::with_capacity(page_size as usize),
            last_index: None,
            exhausted: false,
            cancel,
            stats: CursorStats::default(),
        }
    }

    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Highest index handed out so far.
    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    pub fn reader(&self) -> &LogReader<T> {
        &self.reader
    }

    /// Next record in strictly increasing index order, or `None` at the end
    /// of the log. After an error the cursor is finished.
    pub async fn next_record(&mut self) -> Result<Option<LogRecord>, CollectError> {
        loop {
            while let Some(record) = self.buffer.pop_front() {
                if !self.floor.admits(&record) {
                    continue;
                }
                if let Some(last) = self.last_index {
                    if record.index <= last {
                        self.stats.skipped += 1;
                        tracing::warn!(
                            index = record.index,
                            last_index = last,
                            "Dropping out-of-order log record"
                        );
                        continue;
                    }
                    if record.index > last + 1 {
                        let missing = record.index - last - 1;
                        self.stats.gaps += missing;
                        tracing::warn!(
                            index = record.index,
                            last_index = last,
                            missing,
                            "Log records missing between consecutive indices"
                        );
                    }
                }
                self.last_index = Some(record.index);
                self.stats.emitted += 1;
                return Ok(Some(record));
            }

            if self.exhausted || self.next_offset >= self.end_offset {
                self.exhausted = true;
                return Ok(None);
            }

            if self.cancel.is_cancelled() {
                self.exhausted = true;
                tracing::info!(last_index = ?self.last_index, "Collection cancelled");
                return Err(CollectError::Interrupted {
                    last_index: self.last_index,
                    reason: InterruptReason::Cancelled,
                });
            }

            let count = (self.end_offset - self.next_offset).min(self.page_size as u32) as u16;
            let page = match self.reader.read_page(self.next_offset, count).await {
                Ok(page) => page,
                Err(e) => {
                    self.exhausted = true;
                    tracing::error!(
                        offset = self.next_offset,
                        last_index = ?self.last_index,
                        error = %e,
                        "Log read failed, stopping collection"
                    );
                    return Err(CollectError::Interrupted {
                        last_index: self.last_index,
                        reason: InterruptReason::Transport(e),
                    });
                }
            };

            tracing::debug!(
                offset = self.next_offset,
                requested = count,
                filled = page.filled,
                "Read log page"
            );

            self.stats.pages_read += 1;
            self.stats.rejected += page.rejected as u64;
            self.next_offset += count as u32;
            if page.filled < count as usize {
                self.exhausted = true;
            }
            self.buffer.extend(page.records);
        }
    }

    /// Convert into a stream. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<LogRecord, CollectError>> {
        futures::stream::unfold(self, |mut cursor| async move {
            match cursor.next_record().await {
                Ok(Some(record)) => Some((Ok(record), cursor)),
                Ok(None) => None,
                Err(e) => Some((Err(e), cursor)),
            }
        })
    }
}
