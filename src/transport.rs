use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::register_map::Register;

/// Read access to the registers of devices on a shared link.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    /// Reads and decodes `register` from the device with unit id `unit`.
    async fn read(&self, register: Register, unit: u8) -> Result<f64, TransportError>;
}

/// Modbus TCP link that may be shared by several devices behind one gateway.
///
/// Requests are serialized on a single connection. The connection is opened
/// on first use and dropped after an IO error or timeout so the next read
/// reconnects.
pub struct ModbusTcpTransport {
    target_address: SocketAddr,
    request_timeout: Duration,
    connection: Mutex<Option<client::Context>>,
}

impl ModbusTcpTransport {
    pub fn new(target_address: SocketAddr, request_timeout: Duration) -> Self {
        Self {
            target_address,
            request_timeout,
            connection: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<client::Context, TransportError> {
        info!(address = %self.target_address, "Connecting to inverter");
        match timeout(self.request_timeout, tcp::connect(self.target_address)).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {} timed out", self.target_address),
            )
            .into()),
        }
    }

    async fn read_words(
        &self,
        ctx: &mut client::Context,
        register: Register,
    ) -> Result<Vec<u16>, TransportError> {
        let request = ctx.read_holding_registers(register.address, register.encoding.word_count());
        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        match timeout(self.request_timeout, request).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(TransportError::Exception {
                address: register.address,
                exception: format!("{exception:?}"),
            }),
            Ok(Err(tokio_modbus::Error::Transport(io_error))) => Err(io_error.into()),
            Ok(Err(protocol_error)) => Err(TransportError::Protocol(protocol_error.to_string())),
            Err(_) => Err(TransportError::Timeout {
                address: register.address,
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn read(&self, register: Register, unit: u8) -> Result<f64, TransportError> {
        let mut connection = self.connection.lock().await;
        let mut ctx = match connection.take() {
            Some(ctx) => ctx,
            None => self.connect().await?,
        };
        ctx.set_slave(Slave(unit));

        match self.read_words(&mut ctx, register).await {
            Ok(words) => {
                *connection = Some(ctx);
                debug!(unit, address = register.address, ?words, "Register read");
                register.encoding.decode(register.address, &words)
            }
            Err(e @ TransportError::Exception { .. }) => {
                // The device answered, the link itself is fine.
                *connection = Some(ctx);
                Err(e)
            }
            Err(e) => {
                warn!(unit, address = register.address, "Dropping Modbus connection: {e}");
                Err(e)
            }
        }
    }
}
