use super::time::{decode_packed, TimeError};
use crate::transport::{RegisterTransport, TransportError};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Clock registers: year, month, day, hour, minute, second.
pub const CLOCK_BASE: u16 = 0x1040;
pub const CLOCK_WORDS: u16 = 6;

/// Log window control block.
pub const LOG_SELECT: u16 = 0x6000;
pub const LOG_WINDOW_CONTROL: u16 = 0x6001;
pub const LOG_OFFSET_HI: u16 = 0x6002;
pub const LOG_OFFSET_LO: u16 = 0x6003;
pub const LOG_WINDOW_DATA: u16 = 0x6004;

/// Low byte of the window control register once the window is loaded.
pub const WINDOW_READY: u16 = 0x0B;

/// Log status block.
pub const LOG_STATUS_BASE: u16 = 0x6100;
pub const LOG_STATUS_WORDS: u16 = 12;

pub const RECORD_WORDS: usize = 14;
pub const RECORD_BYTES: u16 = 28;
pub const WINDOW_MAX_WORDS: usize = 123;
pub const MAX_RECORDS_PER_WINDOW: u16 = (WINDOW_MAX_WORDS / RECORD_WORDS) as u16;

/// Snapshot of the log status block.
#[derive(Debug, Clone, Serialize)]
pub struct LogStatus {
    pub max_records: u32,
    pub used_records: u32,
    pub record_size_bytes: u16,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
}

impl LogStatus {
    pub fn from_words(words: &[u16]) -> Result<Self, TransportError> {
        if words.len() < LOG_STATUS_WORDS as usize {
            return Err(TransportError::ShortResponse {
                address: LOG_STATUS_BASE,
                expected: LOG_STATUS_WORDS as usize,
                actual: words.len(),
            });
        }

        // The boundary timestamps are advisory; an empty log reports zeros.
        let stamp = |at: usize| -> Option<NaiveDateTime> {
            decode_packed([words[at], words[at + 1], words[at + 2]])
                .map_err(|e: TimeError| tracing::debug!(error = %e, "No boundary timestamp"))
                .ok()
        };

        Ok(Self {
            max_records: ((words[0] as u32) << 16) | words[1] as u32,
            used_records: ((words[2] as u32) << 16) | words[3] as u32,
            record_size_bytes: words[4],
            first_timestamp: stamp(6),
            last_timestamp: stamp(9),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.used_records == 0
    }
}

pub async fn read_log_status<T>(transport: &mut T) -> Result<LogStatus, TransportError>
where
    T: RegisterTransport + ?Sized,
{
    let words = transport
        .read_registers(LOG_STATUS_BASE, LOG_STATUS_WORDS)
        .await?;
    let status = LogStatus::from_words(&words)?;

    if status.record_size_bytes != RECORD_BYTES {
        tracing::warn!(
            record_size = status.record_size_bytes,
            expected = RECORD_BYTES,
            "Unexpected log record size, proceeding anyway"
        );
    }

    Ok(status)
}

/// How log windows are requested.
#[derive(Debug, Clone)]
pub struct WindowParams {
    pub log_type: u16,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            log_type: 0,
            ready_timeout: Duration::from_secs(5),
            ready_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Load `count` records starting at record `offset` (0 = oldest) into the log
/// window and read them back.
///
/// The selector, record count and offset are programmed in one write so a
/// window is never left half-configured.
pub async fn read_window<T>(
    transport: &mut T,
    params: &WindowParams,
    offset: u32,
    count: u16,
) -> Result<Vec<u16>, TransportError>
where
    T: RegisterTransport + ?Sized,
{
    let count = count.clamp(1, MAX_RECORDS_PER_WINDOW);
    let control = [
        params.log_type,
        count << 8,
        (offset >> 16) as u16,
        offset as u16,
    ];
    transport.write_registers(LOG_SELECT, &control).await?;

    let deadline = Instant::now() + params.ready_timeout;
    loop {
        let value = transport.read_registers(LOG_WINDOW_CONTROL, 1).await?;
        let status = value.first().copied().unwrap_or_default() & 0x00FF;
        if status == WINDOW_READY {
            break;
        }
        if Instant::now() >= deadline {
            return Err(TransportError::NotReady(params.ready_timeout));
        }
        tokio::time::sleep(params.ready_poll_interval).await;
    }

    let words = count as usize * RECORD_WORDS;
    tracing::debug!(offset, count, words, "Reading log window");
    transport.read_registers(LOG_WINDOW_DATA, words as u16).await
}
