//! Temperature controller driver.
//!
//! Protocol Overview:
//! - Format: ASCII line protocol
//! - Baud: 57600, 8N1, no flow control
//! - Terminator: CR on commands, CRLF on replies
//! - Commands: `SETP <celsius>` (reply `OK`)
//! - Queries: `TEMP?` (reply `<celsius>`)
//! - Errors: `ERR <message>`

use crate::config::{TemperatureControllerConfig, TimeoutConfig};
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::TemperatureControl;
use crate::hardware::serial::{wrap_shared, DynSerial, SharedPort};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const DEVICE: &str = "temperature_controller";

/// Temperature controller on a serial line.
pub struct SerialTemperatureController {
    port: Mutex<Option<SharedPort>>,
    timeout: Duration,
}

impl SerialTemperatureController {
    /// Wrap an open serial stream.
    pub fn new(port: DynSerial, timeouts: &TimeoutConfig) -> Self {
        Self {
            port: Mutex::new(Some(wrap_shared(port))),
            timeout: Duration::from_millis(timeouts.command_ack_ms),
        }
    }

    /// Open by USB serial number.
    #[cfg(feature = "serial")]
    pub async fn open(
        config: &TemperatureControllerConfig,
        timeouts: &TimeoutConfig,
    ) -> AppResult<Self> {
        let serial_number = config.serial_number.as_deref().ok_or_else(|| {
            FluidicsError::Configuration(
                "temperature_controller.serial_number is required".to_string(),
            )
        })?;
        let port =
            crate::hardware::serial::open_by_serial_number(serial_number, config.baud_rate, DEVICE)
                .await?;
        info!(serial_number, "Temperature controller connected");
        Ok(Self::new(port, timeouts))
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let guard = self.port.lock().await;
        let port = guard
            .as_ref()
            .ok_or_else(|| FluidicsError::hardware(DEVICE, "controller is closed"))?;
        let mut io = port.lock().await;

        io.get_mut()
            .write_all(format!("{}\r", command).as_bytes())
            .await?;
        io.get_mut().flush().await?;

        let mut line = String::new();
        match tokio::time::timeout(self.timeout, io.read_line(&mut line)).await {
            Ok(Ok(0)) => return Err(FluidicsError::hardware(DEVICE, "serial line closed")),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(FluidicsError::timeout(
                    DEVICE,
                    command,
                    self.timeout.as_millis() as u64,
                ))
            }
        }

        let reply = line.trim();
        debug!(command, reply, "Temperature controller reply");
        if let Some(message) = reply.strip_prefix("ERR") {
            return Err(FluidicsError::hardware(
                DEVICE,
                format!("'{}' failed: {}", command, message.trim()),
            ));
        }
        Ok(reply.to_string())
    }
}

#[async_trait]
impl TemperatureControl for SerialTemperatureController {
    #[instrument(skip(self), err)]
    async fn set_setpoint(&self, celsius: f64) -> AppResult<()> {
        let reply = self.query(&format!("SETP {:.2}", celsius)).await?;
        if reply != "OK" {
            return Err(FluidicsError::hardware(
                DEVICE,
                format!("unexpected reply to setpoint: '{}'", reply),
            ));
        }
        Ok(())
    }

    async fn read_temperature(&self) -> AppResult<f64> {
        let reply = self.query("TEMP?").await?;
        reply.parse::<f64>().map_err(|_| {
            FluidicsError::hardware(DEVICE, format!("cannot parse temperature '{}'", reply))
        })
    }

    async fn close(&self) -> AppResult<()> {
        if let Some(port) = self.port.lock().await.take() {
            port.lock().await.get_mut().shutdown().await?;
            info!("Temperature controller closed");
        }
        Ok(())
    }
}
