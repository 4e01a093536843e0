//! Acuvim CL register map and the codecs for its clock, log status and
//! historical log records.

pub mod record;
pub mod registers;
pub mod time;

use serde::{Deserialize, Serialize};

pub use record::{decode_page, decode_record, DecodeError, LogRecord, PageDecode, CHANNELS};
pub use registers::{read_log_status, read_window, LogStatus, WindowParams};
pub use time::{decode_clock, decode_packed, encode_clock, TimeError};

pub const DEFAULT_PORT: u16 = 502;

/// Addressing information for one meter. Not modified during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterIdentity {
    pub serial: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl MeterIdentity {
    pub fn new(serial: impl Into<String>, host: impl Into<String>, unit_id: u8) -> Self {
        Self {
            serial: serial.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            unit_id,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Key used by the resume store and the fleet registry.
    pub fn key(&self) -> &str {
        &self.serial
    }
}
