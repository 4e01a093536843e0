pub mod mock;
pub mod modbus;

use async_trait::async_trait;
use thiserror::Error;

pub use mock::SimulatedMeter;
pub use modbus::ModbusTcpTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(String),

    #[error("meter returned exception {code} for register 0x{address:04X}")]
    Exception { address: u16, code: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("short response at 0x{address:04X}: expected {expected} words, got {actual}")]
    ShortResponse {
        address: u16,
        expected: usize,
        actual: usize,
    },

    #[error("log window not ready after {0:?}")]
    NotReady(std::time::Duration),

    #[error("page at offset {offset} could not be decoded ({rejected} bad records)")]
    Undecodable { offset: u32, rejected: usize },
}

/// Register-level access to one meter unit.
///
/// Implementations issue one request at a time; callers never overlap
/// transfers on the same session.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Read `count` holding registers starting at `address`.
    async fn read_registers(&mut self, address: u16, count: u16)
        -> Result<Vec<u16>, TransportError>;

    /// Write `values` to consecutive holding registers in a single transfer.
    async fn write_registers(&mut self, address: u16, values: &[u16])
        -> Result<(), TransportError>;
}

#[async_trait]
impl<T: RegisterTransport + ?Sized> RegisterTransport for Box<T> {
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        (**self).read_registers(address, count).await
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        (**self).write_registers(address, values).await
    }
}

#[async_trait]
impl<T: RegisterTransport + ?Sized> RegisterTransport for &mut T {
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        (**self).read_registers(address, count).await
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        (**self).write_registers(address, values).await
    }
}
