//! In-memory meter that speaks the Acuvim CL register map. Used by the test
//! suites to drive collection without hardware.

use super::{RegisterTransport, TransportError};
use crate::meter::record::{encode_record, LogRecord};
use crate::meter::registers::{
    CLOCK_BASE, CLOCK_WORDS, LOG_SELECT, LOG_STATUS_BASE, LOG_STATUS_WORDS, LOG_WINDOW_CONTROL,
    LOG_WINDOW_DATA, RECORD_BYTES, RECORD_WORDS, WINDOW_READY,
};
use crate::meter::time::{decode_clock, encode_clock};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct MeterState {
    log: Vec<[u16; RECORD_WORDS]>,
    max_records: u32,
    clock: NaiveDateTime,
    clock_accepts_writes: bool,
    window_offset: u32,
    window_count: u16,
    window_loaded: bool,
    next_index: u64,
    energy: [f64; 4],
    failing_data_reads: usize,
    data_reads_before_outage: Option<usize>,
    offline: bool,
    data_reads: usize,
    clock_writes: usize,
}

/// Cloneable handle to a simulated meter; clones share state so a test can
/// hand one to the collector and inspect the other.
#[derive(Debug, Clone)]
pub struct SimulatedMeter {
    state: Arc<Mutex<MeterState>>,
}

impl SimulatedMeter {
    /// A meter with an empty log whose clock reads `clock`.
    pub fn new(clock: NaiveDateTime) -> Self {
        Self {
            state: Arc::new(Mutex::new(MeterState {
                log: Vec::new(),
                max_records: 187_200,
                clock,
                clock_accepts_writes: true,
                window_offset: 0,
                window_count: 0,
                window_loaded: false,
                next_index: 1,
                energy: [1000.0, 10.0, 50.0, 5.0],
                failing_data_reads: 0,
                data_reads_before_outage: None,
                offline: false,
                data_reads: 0,
                clock_writes: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `count` records, one every `interval`, the first stamped `first`.
    pub fn log_samples(&self, first: NaiveDateTime, interval: Duration, count: usize) -> &Self {
        let step = ChronoDuration::from_std(interval).unwrap_or_else(|_| ChronoDuration::minutes(1));
        let mut state = self.lock();
        for n in 0..count {
            let index = state.next_index;
            state.next_index += 1;
            for (slot, value) in state.energy.iter_mut().enumerate() {
                *value += 0.1 * (slot as f64 + 1.0);
            }
            let record = LogRecord {
                index,
                timestamp: first + step * n as i32,
                measurements: state.energy.to_vec(),
            };
            if let Ok(words) = encode_record(&record) {
                state.log.push(words);
            }
        }
        self
    }

    /// Continue the log after its last record at the same `interval`.
    pub fn extend_log(&self, interval: Duration, count: usize) -> &Self {
        let next = {
            let state = self.lock();
            state.log.last().and_then(|words| {
                crate::meter::decode_record(words)
                    .ok()
                    .map(|r| r.timestamp + ChronoDuration::from_std(interval).unwrap_or_else(|_| ChronoDuration::minutes(1)))
            })
        };
        let first = next.unwrap_or_else(|| self.clock());
        self.log_samples(first, interval, count)
    }

    /// Push raw record words, bypassing index bookkeeping.
    pub fn push_raw(&self, words: [u16; RECORD_WORDS]) -> &Self {
        self.lock().log.push(words);
        self
    }

    /// Start the record numbering at `index` (a log that has wrapped).
    pub fn starting_index(&self, index: u64) -> &Self {
        self.lock().next_index = index;
        self
    }

    /// Drop the `count` oldest records, as a full circular log does.
    pub fn evict_oldest(&self, count: usize) -> &Self {
        let mut state = self.lock();
        let count = count.min(state.log.len());
        state.log.drain(..count);
        self
    }

    pub fn set_clock(&self, clock: NaiveDateTime) {
        self.lock().clock = clock;
    }

    pub fn clock(&self) -> NaiveDateTime {
        self.lock().clock
    }

    /// Accept clock writes without applying them.
    pub fn freeze_clock(&self) {
        self.lock().clock_accepts_writes = false;
    }

    /// The next `count` log window reads time out.
    pub fn fail_next_data_reads(&self, count: usize) {
        self.lock().failing_data_reads = count;
    }

    /// After `count` more successful window reads, every further one times out.
    pub fn outage_after_data_reads(&self, count: usize) {
        let mut state = self.lock();
        state.data_reads_before_outage = Some(state.data_reads + count);
    }

    /// Clear all injected faults.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.failing_data_reads = 0;
        state.data_reads_before_outage = None;
        state.offline = false;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn record_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Successful and failed reads of the window data register.
    pub fn data_reads(&self) -> usize {
        self.lock().data_reads
    }

    pub fn clock_writes(&self) -> usize {
        self.lock().clock_writes
    }

    fn status_words(state: &MeterState) -> Vec<u16> {
        let used = state.log.len() as u32;
        let mut words = vec![
            (state.max_records >> 16) as u16,
            state.max_records as u16,
            (used >> 16) as u16,
            used as u16,
            RECORD_BYTES,
            0,
        ];
        for boundary in [state.log.first(), state.log.last()] {
            match boundary {
                Some(record) => words.extend_from_slice(&record[2..5]),
                None => words.extend_from_slice(&[0, 0, 0]),
            }
        }
        words
    }

    fn window_words(state: &MeterState, count: u16) -> Vec<u16> {
        let mut words = Vec::with_capacity(count as usize);
        for slot in 0..(count as usize / RECORD_WORDS) {
            let offset = state.window_offset as usize + slot;
            match state.log.get(offset) {
                Some(record) => words.extend_from_slice(record),
                None => words.extend_from_slice(&[0u16; RECORD_WORDS]),
            }
        }
        words.resize(count as usize, 0);
        words
    }
}

#[async_trait]
impl RegisterTransport for SimulatedMeter {
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Timeout(Duration::from_secs(3)));
        }

        match address {
            CLOCK_BASE if count == CLOCK_WORDS => encode_clock(&state.clock)
                .map(|words| words.to_vec())
                .map_err(|e| TransportError::Io(e.to_string())),
            LOG_STATUS_BASE if count == LOG_STATUS_WORDS => Ok(Self::status_words(&state)),
            LOG_WINDOW_CONTROL if count == 1 => {
                let value = if state.window_loaded {
                    (state.window_count << 8) | WINDOW_READY
                } else {
                    0
                };
                Ok(vec![value])
            }
            LOG_WINDOW_DATA => {
                state.data_reads += 1;
                if state.failing_data_reads > 0 {
                    state.failing_data_reads -= 1;
                    return Err(TransportError::Timeout(Duration::from_secs(3)));
                }
                if let Some(limit) = state.data_reads_before_outage {
                    if state.data_reads > limit {
                        return Err(TransportError::Timeout(Duration::from_secs(3)));
                    }
                }
                Ok(Self::window_words(&state, count))
            }
            _ => Err(TransportError::Exception {
                address,
                code: "IllegalDataAddress".to_string(),
            }),
        }
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Timeout(Duration::from_secs(3)));
        }

        match (address, values) {
            (CLOCK_BASE, words) if words.len() == CLOCK_WORDS as usize => {
                let time = decode_clock(words).map_err(|_| TransportError::Exception {
                    address,
                    code: "IllegalDataValue".to_string(),
                })?;
                state.clock_writes += 1;
                if state.clock_accepts_writes {
                    state.clock = time;
                }
                Ok(())
            }
            (LOG_SELECT, [_log_type, control, offset_hi, offset_lo]) => {
                state.window_count = *control >> 8;
                state.window_offset = ((*offset_hi as u32) << 16) | *offset_lo as u32;
                state.window_loaded = true;
                Ok(())
            }
            _ => Err(TransportError::Exception {
                address,
                code: "IllegalDataAddress".to_string(),
            }),
        }
    }
}
