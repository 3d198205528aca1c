//! Modbus/TCP connection
//!
//! One TCP session to one device. Wire and protocol failures come back as
//! error values, never as panics; the pool turns them into Unavailable
//! readings and health updates. A failed connect arms a cooldown so an
//! unreachable device is not hammered with SYNs every poll cycle.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;
use tracing::{debug, warn};

use fl_config::RegisterType;

/// Seconds between connect attempts after a failure.
pub const CONNECTION_RETRY_COOLDOWN_SECS: u64 = 5;
/// Per-request ceiling; a device that answers slower than this is treated as
/// a failed read.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),

    #[error("not connected")]
    NotConnected,

    #[error("connect cooldown active ({remaining_ms}ms remaining)")]
    Cooldown { remaining_ms: u64 },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub struct ModbusConnection {
    device_id: String,
    addr: SocketAddr,
    unit_id: u8,
    ctx: Option<Context>,
    last_failed_connect: Option<Instant>,
    cooldown: Duration,
}

impl ModbusConnection {
    pub fn new(
        device_id: impl Into<String>,
        ip: &str,
        port: u16,
        unit_id: u8,
    ) -> Result<Self, ConnectionError> {
        let addr = format!("{ip}:{port}")
            .parse::<SocketAddr>()
            .map_err(|_| ConnectionError::InvalidAddress(ip.to_string(), port))?;
        Ok(Self {
            device_id: device_id.into(),
            addr,
            unit_id,
            ctx: None,
            last_failed_connect: None,
            cooldown: Duration::from_secs(CONNECTION_RETRY_COOLDOWN_SECS),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    /// Establish the TCP session. A no-op when already connected; refuses
    /// with `Cooldown` while the retry cooldown from the last failure runs.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        if let Some(failed_at) = self.last_failed_connect {
            let since = failed_at.elapsed();
            if since < self.cooldown {
                return Err(ConnectionError::Cooldown {
                    remaining_ms: (self.cooldown - since).as_millis() as u64,
                });
            }
        }

        match timeout(REQUEST_TIMEOUT, tcp::connect_slave(self.addr, Slave(self.unit_id))).await {
            Ok(Ok(ctx)) => {
                debug!(device_id = %self.device_id, addr = %self.addr, "Modbus session established");
                self.ctx = Some(ctx);
                self.last_failed_connect = None;
                Ok(())
            }
            Ok(Err(err)) => {
                self.last_failed_connect = Some(Instant::now());
                Err(ConnectionError::Transport(err.to_string()))
            }
            Err(_) => {
                self.last_failed_connect = Some(Instant::now());
                Err(ConnectionError::Timeout(REQUEST_TIMEOUT))
            }
        }
    }

    /// Tear down the session. Dropping the context closes the socket.
    pub fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            debug!(device_id = %self.device_id, "Modbus session closed");
        }
    }

    /// Read `count` registers starting at `start` from the configured bank.
    ///
    /// A transport-level failure tears the session down so the next cycle
    /// reconnects; a Modbus exception leaves it up (the device answered).
    pub async fn read_registers(
        &mut self,
        register_type: RegisterType,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnectionError> {
        let outcome = {
            let ctx = self.ctx.as_mut().ok_or(ConnectionError::NotConnected)?;
            let read = async {
                match register_type {
                    RegisterType::Holding => ctx.read_holding_registers(start, count).await,
                    RegisterType::Input => ctx.read_input_registers(start, count).await,
                }
            };
            timeout(REQUEST_TIMEOUT, read).await
        };

        match outcome {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(ConnectionError::Exception(exception.to_string())),
            Ok(Err(err)) => {
                warn!(device_id = %self.device_id, %err, "Modbus transport error, dropping session");
                self.ctx = None;
                Err(ConnectionError::Transport(err.to_string()))
            }
            Err(_) => {
                self.ctx = None;
                Err(ConnectionError::Timeout(REQUEST_TIMEOUT))
            }
        }
    }
}

impl std::fmt::Debug for ModbusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("device_id", &self.device_id)
            .field("addr", &self.addr)
            .field("unit_id", &self.unit_id)
            .field("connected", &self.ctx.is_some())
            .finish()
    }
}
