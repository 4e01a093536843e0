use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("expected {expected} time words, got {actual}")]
    WordCount { expected: usize, actual: usize },

    #[error("invalid clock registers {0:?}")]
    InvalidClock(Vec<u16>),

    #[error("invalid packed timestamp [0x{:04X}, 0x{:04X}, 0x{:04X}]", .0[0], .0[1], .0[2])]
    InvalidPacked([u16; 3]),

    #[error("year {0} cannot be written to the meter clock")]
    YearOutOfRange(i32),
}

/// Decode the six clock registers (year, month, day, hour, minute, second),
/// one value per register.
pub fn decode_clock(words: &[u16]) -> Result<NaiveDateTime, TimeError> {
    let [year, month, day, hour, minute, second] = words else {
        return Err(TimeError::WordCount {
            expected: 6,
            actual: words.len(),
        });
    };

    build(
        *year as i32,
        *month as u32,
        *day as u32,
        *hour as u32,
        *minute as u32,
        *second as u32,
    )
    .ok_or_else(|| TimeError::InvalidClock(words.to_vec()))
}

/// Encode a wall-clock time into the six clock registers. Sub-second
/// precision is dropped.
pub fn encode_clock(time: &NaiveDateTime) -> Result<[u16; 6], TimeError> {
    let year = u16::try_from(time.year()).map_err(|_| TimeError::YearOutOfRange(time.year()))?;
    Ok([
        year,
        time.month() as u16,
        time.day() as u16,
        time.hour() as u16,
        time.minute() as u16,
        time.second() as u16,
    ])
}

/// Decode the three-word timestamp used by log records and the log status
/// block:
///
/// - word 0: high byte = year offset from 2000, low byte = month
/// - word 1: high byte = day, low byte = hour
/// - word 2: high byte = minute, low byte = second
pub fn decode_packed(words: [u16; 3]) -> Result<NaiveDateTime, TimeError> {
    let [w0, w1, w2] = words;
    build(
        2000 + (w0 >> 8) as i32,
        (w0 & 0xFF) as u32,
        (w1 >> 8) as u32,
        (w1 & 0xFF) as u32,
        (w2 >> 8) as u32,
        (w2 & 0xFF) as u32,
    )
    .ok_or(TimeError::InvalidPacked(words))
}

/// Inverse of [`decode_packed`]. Only used to build meter images.
pub fn encode_packed(time: &NaiveDateTime) -> Result<[u16; 3], TimeError> {
    let offset = time.year() - 2000;
    if !(0..=255).contains(&offset) {
        return Err(TimeError::YearOutOfRange(time.year()));
    }
    Ok([
        ((offset as u16) << 8) | time.month() as u16,
        ((time.day() as u16) << 8) | time.hour() as u16,
        ((time.minute() as u16) << 8) | time.second() as u16,
    ])
}

fn build(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_decode_packed_known_words() {
        // 190C 0512 1800 as captured from a meter
        let decoded = decode_packed([0x190C, 0x0512, 0x1800]).unwrap();
        assert_eq!(decoded, ts("2025-12-05 18:24:00"));

        let decoded = decode_packed([0x190C, 0x0817, 0x1000]).unwrap();
        assert_eq!(decoded, ts("2025-12-08 23:16:00"));
    }

    #[test]
    fn test_decode_packed_invalid() {
        let err = decode_packed([0x190D, 0x0512, 0x1800]).unwrap_err();
        assert_eq!(err, TimeError::InvalidPacked([0x190D, 0x0512, 0x1800]));
    }

    #[test]
    fn test_encode_packed_matches_decode() {
        let time = ts("2026-03-01 07:05:59");
        let words = encode_packed(&time).unwrap();
        assert_eq!(words, [0x1A03, 0x0107, 0x053B]);
        assert_eq!(decode_packed(words).unwrap(), time);
    }

    #[test]
    fn test_decode_clock() {
        let decoded = decode_clock(&[2025, 12, 5, 18, 24, 7]).unwrap();
        assert_eq!(decoded, ts("2025-12-05 18:24:07"));
    }

    #[test]
    fn test_decode_clock_wrong_length() {
        let err = decode_clock(&[2025, 12, 5]).unwrap_err();
        assert_eq!(
            err,
            TimeError::WordCount {
                expected: 6,
                actual: 3
            }
        );
    }

    #[test]
    fn test_decode_clock_impossible_date() {
        assert!(matches!(
            decode_clock(&[2025, 2, 30, 0, 0, 0]),
            Err(TimeError::InvalidClock(_))
        ));
    }

    #[test]
    fn test_encode_clock_drops_subseconds() {
        let time = ts("2025-12-05 18:24:07") + chrono::Duration::milliseconds(900);
        assert_eq!(encode_clock(&time).unwrap(), [2025, 12, 5, 18, 24, 7]);
    }
}
