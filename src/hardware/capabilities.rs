//! Fluidic Hardware Capabilities
//!
//! Each device in the fluid path is reached through a small capability trait:
//!
//! - [`CommandChannel`]: the microcontroller link (valves, disc pump)
//! - [`SyringePump`]: volume-calibrated aspirate/dispense
//! - [`SelectorValve`]: logical fluidic port selection
//! - [`TemperatureControl`]: setpoint and readback
//! - [`DiscPumpControl`]: constant-flow circulation
//!
//! Operation sets hold `Arc<dyn Trait>` handles, so real drivers and simulated
//! devices are interchangeable.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`AppResult`] so driver errors reach the engine's row boundary intact
//! - Takes `&self`; drivers keep their state behind interior mutability
//!
//! Every call returns only after the device has acknowledged completion. Callers
//! rely on that: a pump command is never issued before the preceding valve switch
//! has finished.

use crate::error::{AppResult, FluidicsError};
use crate::hardware::protocol::{Command, Response};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval between readings while waiting for a temperature setpoint.
pub const TEMPERATURE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capability: Microcontroller Command Channel
///
/// # Contract
/// - `begin()` must be called before the first command
/// - `send_command` returns once the controller reports the command completed
/// - `close()` is idempotent
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Prepare the link for commands.
    async fn begin(&self) -> AppResult<()>;

    /// Send a command and wait for its completion acknowledgement.
    async fn send_command(&self, command: Command) -> AppResult<Response>;

    /// Release the link.
    async fn close(&self) -> AppResult<()>;
}

/// Position of the syringe pump's own distribution valve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpPort {
    /// Line to the selector valve manifold
    Reagent,
    /// Line to the chamber / flow cell
    Chamber,
    /// Line to waste
    Waste,
}

impl std::fmt::Display for PumpPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpPort::Reagent => write!(f, "reagent"),
            PumpPort::Chamber => write!(f, "chamber"),
            PumpPort::Waste => write!(f, "waste"),
        }
    }
}

/// Capability: Syringe Pump
///
/// # Contract
/// - Volumes are in microliters, rates in microliters per second
/// - `aspirate` fails with `VolumeOutOfRange` when the syringe would overfill
/// - `dispense` fails with `VolumeOutOfRange` when more is requested than the syringe holds
/// - Rates faster than the configured speed limit are clamped or rejected by policy
#[async_trait]
pub trait SyringePump: Send + Sync {
    /// Syringe capacity in microliters.
    fn capacity_ul(&self) -> f64;

    /// Volume currently held in the syringe.
    async fn contents_ul(&self) -> AppResult<f64>;

    /// Switch the pump's own valve.
    async fn select_port(&self, port: PumpPort) -> AppResult<()>;

    /// Draw `volume_ul` through the selected pump port.
    async fn aspirate(&self, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()>;

    /// Push `volume_ul` out through the selected pump port.
    async fn dispense(&self, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()>;

    /// Empty the syringe into waste.
    async fn dispense_to_waste(&self, rate_ul_per_s: f64) -> AppResult<()> {
        let contents = self.contents_ul().await?;
        self.select_port(PumpPort::Waste).await?;
        if contents > 0.0 {
            self.dispense(contents, rate_ul_per_s).await?;
        }
        Ok(())
    }

    /// Release the pump. Idempotent.
    async fn close(&self) -> AppResult<()>;
}

/// Capability: Selector Valve System
///
/// # Contract
/// - Ports outside [`SelectorValve::port_range`] fail with `InvalidPort`
/// - `select` returns only after the valve switch is acknowledged
#[async_trait]
pub trait SelectorValve: Send + Sync {
    /// Route `port` to the syringe pump.
    async fn select(&self, port: u32) -> AppResult<()>;

    /// Valid logical ports.
    fn port_range(&self) -> std::ops::RangeInclusive<u32>;

    /// Port most recently selected.
    async fn current_port(&self) -> Option<u32>;

    /// Check a port against [`SelectorValve::port_range`].
    fn validate_port(&self, port: u32) -> AppResult<()> {
        let range = self.port_range();
        if range.contains(&port) {
            Ok(())
        } else {
            Err(FluidicsError::InvalidPort {
                port,
                min: *range.start(),
                max: *range.end(),
            })
        }
    }
}

/// Capability: Temperature Control
#[async_trait]
pub trait TemperatureControl: Send + Sync {
    /// Set the target temperature in degrees Celsius.
    async fn set_setpoint(&self, celsius: f64) -> AppResult<()>;

    /// Read the current temperature in degrees Celsius.
    async fn read_temperature(&self) -> AppResult<f64>;

    /// Poll until the temperature is within `tolerance_c` of `target`.
    ///
    /// Returns the last reading, or a `Timeout` error after `timeout`.
    async fn wait_for_setpoint(
        &self,
        target: f64,
        tolerance_c: f64,
        timeout: Duration,
    ) -> AppResult<f64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reading = self.read_temperature().await?;
            if (reading - target).abs() <= tolerance_c {
                return Ok(reading);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FluidicsError::timeout(
                    "temperature_controller",
                    format!("reach {:.1} C (last reading {:.1} C)", target, reading),
                    timeout.as_millis() as u64,
                ));
            }
            tokio::time::sleep(TEMPERATURE_POLL_INTERVAL).await;
        }
    }

    /// Release the controller.
    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Capability: Disc Pump
#[async_trait]
pub trait DiscPumpControl: Send + Sync {
    /// Start circulating at `power` percent.
    async fn start(&self, power: u8) -> AppResult<()>;

    /// Stop circulation.
    async fn stop(&self) -> AppResult<()>;

    /// Circulate for `duration`, then stop.
    ///
    /// The pump is stopped before the error is returned if the start fails midway.
    async fn run_for(&self, duration: Duration, power: u8) -> AppResult<()> {
        if let Err(e) = self.start(power).await {
            let _ = self.stop().await;
            return Err(e);
        }
        tokio::time::sleep(duration).await;
        self.stop().await
    }
}
