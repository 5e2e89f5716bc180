//! Fluidics microcontroller driver.
//!
//! [`FluidController`] frames [`Command`]s onto any [`DynSerial`] stream and
//! waits for the matching completion response. Responses carrying another
//! command id, or failing their checksum, are discarded. A `ChecksumError`
//! status makes the command go out again, up to `max_command_retries` resends.

use crate::config::TimeoutConfig;
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::CommandChannel;
use crate::hardware::protocol::{Command, ExecutionStatus, Response, RESPONSE_LENGTH};
use crate::hardware::serial::{drain_serial_buffer, DynSerial};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const DEVICE: &str = "microcontroller";

/// Stale bytes are drained for this long when the channel begins.
const DRAIN_TIMEOUT_MS: u64 = 50;

struct ControllerLink {
    port: Option<DynSerial>,
    next_id: u8,
    ready: bool,
}

/// Real command channel to the fluidics microcontroller.
pub struct FluidController {
    link: Mutex<ControllerLink>,
    ack_timeout: Duration,
    max_retries: u32,
}

impl FluidController {
    /// Wrap an open serial stream.
    pub fn new(port: DynSerial, timeouts: &TimeoutConfig) -> Self {
        Self {
            link: Mutex::new(ControllerLink {
                port: Some(port),
                next_id: 0,
                ready: false,
            }),
            ack_timeout: Duration::from_millis(timeouts.command_ack_ms),
            max_retries: timeouts.max_command_retries,
        }
    }

    /// Open the controller by USB serial number.
    #[cfg(feature = "serial")]
    pub async fn open(
        config: &crate::config::MicrocontrollerConfig,
        timeouts: &TimeoutConfig,
    ) -> AppResult<Self> {
        let port = crate::hardware::serial::open_by_serial_number(
            &config.serial_number,
            config.baud_rate,
            DEVICE,
        )
        .await?;
        Ok(Self::new(port, timeouts))
    }

    async fn read_response(port: &mut DynSerial) -> AppResult<Response> {
        loop {
            let mut packet = [0u8; RESPONSE_LENGTH];
            port.read_exact(&mut packet).await?;
            match Response::decode(&packet) {
                Ok(response) => return Ok(response),
                Err(e) => warn!(error = %e, "Discarding malformed controller response"),
            }
        }
    }
}

#[async_trait]
impl CommandChannel for FluidController {
    async fn begin(&self) -> AppResult<()> {
        let mut link = self.link.lock().await;
        let port = link
            .port
            .as_mut()
            .ok_or_else(|| FluidicsError::hardware(DEVICE, "serial port is closed"))?;
        let discarded = drain_serial_buffer(port, DRAIN_TIMEOUT_MS).await;
        if discarded > 0 {
            debug!(discarded, "Discarded stale controller bytes");
        }
        link.ready = true;
        info!("Microcontroller link ready");
        Ok(())
    }

    #[instrument(skip(self, command), fields(command = %command), err)]
    async fn send_command(&self, command: Command) -> AppResult<Response> {
        let mut link = self.link.lock().await;
        if !link.ready {
            return Err(FluidicsError::hardware(
                DEVICE,
                format!("'{}' sent before begin()", command.name()),
            ));
        }

        let command_id = link.next_id;
        link.next_id = link.next_id.wrapping_add(1);
        let packet = command.encode(command_id);
        let port = link
            .port
            .as_mut()
            .ok_or_else(|| FluidicsError::hardware(DEVICE, "serial port is closed"))?;

        let mut resends = 0u32;
        'send: loop {
            port.write_all(&packet).await?;
            port.flush().await?;

            let deadline = tokio::time::Instant::now() + self.ack_timeout;
            loop {
                let response =
                    match tokio::time::timeout_at(deadline, Self::read_response(port)).await {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(FluidicsError::timeout(
                                DEVICE,
                                command.name(),
                                self.ack_timeout.as_millis() as u64,
                            ))
                        }
                    };

                if response.command_id != command_id {
                    debug!(
                        expected = command_id,
                        got = response.command_id,
                        "Ignoring response for another command"
                    );
                    continue;
                }

                match response.status {
                    ExecutionStatus::Completed => return Ok(response),
                    ExecutionStatus::InProgress => continue,
                    ExecutionStatus::ChecksumError if resends < self.max_retries => {
                        resends += 1;
                        warn!(command_id, resends, "Controller reported checksum error, resending");
                        continue 'send;
                    }
                    ExecutionStatus::ChecksumError => {
                        return Err(FluidicsError::hardware(
                            DEVICE,
                            format!(
                                "'{}' rejected with checksum errors after {} resends",
                                command.name(),
                                resends
                            ),
                        ))
                    }
                    ExecutionStatus::InvalidCommand => {
                        return Err(FluidicsError::hardware(
                            DEVICE,
                            format!("'{}' rejected as invalid", command),
                        ))
                    }
                    ExecutionStatus::ExecutionError => {
                        return Err(FluidicsError::hardware(
                            DEVICE,
                            format!("'{}' failed during execution", command),
                        ))
                    }
                }
            }
        }
    }

    async fn close(&self) -> AppResult<()> {
        let mut link = self.link.lock().await;
        link.ready = false;
        if let Some(mut port) = link.port.take() {
            port.shutdown().await?;
            info!("Microcontroller link closed");
        }
        Ok(())
    }
}
