use super::registers::RECORD_WORDS;
use super::time::{decode_packed, encode_packed, TimeError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw energy counters are kept in 0.1 kWh / 0.1 kvarh units.
pub const ENERGY_SCALE: f64 = 0.1;

/// Measurement channels of historical log 1, in record order.
pub const CHANNELS: [&str; 4] = ["kwh_import", "kwh_export", "kvarh_import", "kvarh_export"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record has {0} words, expected 14")]
    Length(usize),

    #[error("record {index}: {source}")]
    Timestamp {
        index: u64,
        #[source]
        source: TimeError,
    },
}

/// One historical sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Record number assigned by the meter.
    pub index: u64,
    /// Meter-local capture time.
    pub timestamp: NaiveDateTime,
    /// Values in [`CHANNELS`] order.
    pub measurements: Vec<f64>,
}

fn read_u32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

/// Decode a single 14-word record. The trailing CRC word is not checked.
pub fn decode_record(words: &[u16]) -> Result<LogRecord, DecodeError> {
    if words.len() != RECORD_WORDS {
        return Err(DecodeError::Length(words.len()));
    }

    let index = read_u32(words[0], words[1]) as u64;
    let timestamp = decode_packed([words[2], words[3], words[4]])
        .map_err(|source| DecodeError::Timestamp { index, source })?;

    let measurements = words[5..13]
        .chunks_exact(2)
        .map(|pair| read_u32(pair[0], pair[1]) as f64 * ENERGY_SCALE)
        .collect();

    Ok(LogRecord {
        index,
        timestamp,
        measurements,
    })
}

/// Inverse of [`decode_record`], used to build meter log images. The CRC word
/// is left at zero.
pub fn encode_record(record: &LogRecord) -> Result<[u16; RECORD_WORDS], TimeError> {
    let mut words = [0u16; RECORD_WORDS];
    let index = record.index as u32;
    words[0] = (index >> 16) as u16;
    words[1] = index as u16;
    words[2..5].copy_from_slice(&encode_packed(&record.timestamp)?);

    for (slot, value) in record.measurements.iter().take(CHANNELS.len()).enumerate() {
        let raw = (value / ENERGY_SCALE).round() as u32;
        words[5 + slot * 2] = (raw >> 16) as u16;
        words[6 + slot * 2] = raw as u16;
    }

    Ok(words)
}

/// An all-zero record body marks an unused log slot.
fn is_blank(words: &[u16]) -> bool {
    words[..RECORD_WORDS - 1].iter().all(|w| *w == 0)
}

/// Result of decoding one log window.
#[derive(Debug, Default)]
pub struct PageDecode {
    pub records: Vec<LogRecord>,
    /// Window slot each entry of `records` came from.
    pub slots: Vec<usize>,
    /// Slots that held data, decodable or not. Fewer than requested means the
    /// window ran past the end of the log.
    pub filled: usize,
    pub rejected: usize,
}

/// Split a window into records. Decoding stops at the first blank slot or
/// trailing partial record; undecodable records are counted and skipped.
pub fn decode_page(words: &[u16]) -> PageDecode {
    let mut page = PageDecode::default();

    for (slot, chunk) in words.chunks_exact(RECORD_WORDS).enumerate() {
        if is_blank(chunk) {
            break;
        }
        page.filled += 1;
        match decode_record(chunk) {
            Ok(record) => {
                page.records.push(record);
                page.slots.push(slot);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable log record");
                page.rejected += 1;
            }
        }
    }

    page
}
