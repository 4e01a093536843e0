use super::{RegisterTransport, TransportError};
use crate::meter::MeterIdentity;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, Writer};

/// Modbus TCP session to a single unit. Every transfer carries `timeout`.
pub struct ModbusTcpTransport {
    ctx: Context,
    timeout: Duration,
}

impl ModbusTcpTransport {
    pub async fn connect(
        identity: &MeterIdentity,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let target = format!("{}:{}", identity.host, identity.port);
        let addr = resolve(&identity.host, identity.port)
            .await
            .map_err(|source| TransportError::Connect {
                addr: target.clone(),
                source,
            })?;

        tracing::debug!(%addr, unit_id = identity.unit_id, "Connecting to meter");

        let connect = tcp::connect_slave(addr, Slave(identity.unit_id));
        let ctx = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(source)) => return Err(TransportError::Connect { addr: target, source }),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        Ok(Self { ctx, timeout })
    }
}

async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {}", host),
            )
        })
}

/// Flatten the timeout / transport / exception layers into one error.
fn settle<T>(
    address: u16,
    timeout: Duration,
    result: Result<tokio_modbus::Result<T>, Elapsed>,
) -> Result<T, TransportError> {
    match result {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(exception))) => Err(TransportError::Exception {
            address,
            code: format!("{:?}", exception),
        }),
        Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.ctx.read_holding_registers(address, count)).await;
        let words = settle(address, timeout, result)?;

        if words.len() < count as usize {
            return Err(TransportError::ShortResponse {
                address,
                expected: count as usize,
                actual: words.len(),
            });
        }
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.ctx.write_multiple_registers(address, values)).await;
        settle(address, timeout, result)
    }
}
