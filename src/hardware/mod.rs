//! Fluidic hardware: capability traits, real drivers and simulated devices.
//!
//! [`build_devices`] is the single factory for the device bundle. It returns the
//! same [`FluidicsDevices`] shape for real hardware and for simulation, so the
//! rest of the crate never branches on the mode.

pub mod capabilities;
pub mod controller;
pub mod disc_pump;
pub mod mock;
pub mod protocol;
pub mod selector_valve;
pub mod serial;
pub mod syringe_pump;
pub mod temperature;

use crate::config::{ApplicationType, FluidicsConfig};
use crate::error::{AppResult, FluidicsError};
use capabilities::{CommandChannel, DiscPumpControl, SelectorValve, SyringePump, TemperatureControl};
use disc_pump::DiscPump;
use mock::{
    CommandLog, FaultPlan, MockMode, SimulatedController, SimulatedSyringePump,
    SimulatedTemperatureController,
};
use protocol::Command;
use selector_valve::SelectorValveSystem;
use std::sync::Arc;
use tracing::{info, warn};

/// Options for simulated devices
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    /// Timing behavior
    pub mode: MockMode,
    /// Injected failures
    pub faults: FaultPlan,
    /// Shared record of device actions
    pub log: CommandLog,
}

impl SimulationOptions {
    /// Instant simulation without faults.
    pub fn instant() -> Self {
        Self::default()
    }

    /// Simulation with hardware-like timing.
    pub fn realistic() -> Self {
        Self {
            mode: MockMode::Realistic,
            ..Self::default()
        }
    }

    /// Use a fault plan.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Record into an existing log.
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = log;
        self
    }
}

/// Real hardware or simulation, never both.
#[derive(Debug, Clone)]
pub enum DeviceMode {
    /// Devices on USB serial ports, resolved by serial number
    Hardware,
    /// Simulated devices
    Simulated(SimulationOptions),
}

impl DeviceMode {
    /// True for simulation.
    pub fn is_simulated(&self) -> bool {
        matches!(self, DeviceMode::Simulated(_))
    }
}

/// Device handles for one fluidics system.
///
/// Owned by the orchestrator; operation sets hold clones of the `Arc`s.
#[derive(Clone)]
pub struct FluidicsDevices {
    /// Microcontroller link
    pub controller: Arc<dyn CommandChannel>,
    /// Syringe pump
    pub syringe_pump: Arc<dyn SyringePump>,
    /// Selector valve cascade
    pub selector_valve: Arc<dyn SelectorValve>,
    /// Temperature controller, when enabled
    pub temperature: Option<Arc<dyn TemperatureControl>>,
    /// Disc pump, Open Chamber only
    pub disc_pump: Option<Arc<dyn DiscPumpControl>>,
}

impl FluidicsDevices {
    /// Release every device, continuing past failures.
    ///
    /// Failures are logged and returned; none of them stops the remaining releases.
    pub async fn shutdown(&self) -> Vec<FluidicsError> {
        let mut failures = Vec::new();

        if let Some(disc_pump) = &self.disc_pump {
            if let Err(e) = disc_pump.stop().await {
                warn!(error = %e, "Failed to stop disc pump during shutdown");
                failures.push(e);
            }
        }
        if let Err(e) = self.syringe_pump.close().await {
            warn!(error = %e, "Failed to close syringe pump");
            failures.push(e);
        }
        if let Some(temperature) = &self.temperature {
            if let Err(e) = temperature.close().await {
                warn!(error = %e, "Failed to close temperature controller");
                failures.push(e);
            }
        }
        if let Err(e) = self.controller.close().await {
            warn!(error = %e, "Failed to close microcontroller link");
            failures.push(e);
        }

        info!(failures = failures.len(), "Fluidics devices released");
        failures
    }
}

/// Build, connect and reset the devices described by `config`.
///
/// The controller link is opened and its command queue cleared, then the
/// selector valves are homed.
pub async fn build_devices(config: &FluidicsConfig, mode: &DeviceMode) -> AppResult<FluidicsDevices> {
    info!(
        application = %config.application_type(),
        simulated = mode.is_simulated(),
        "Building fluidics devices"
    );

    let (controller, syringe_pump, temperature) = match mode {
        DeviceMode::Simulated(options) => build_simulated(config, options),
        DeviceMode::Hardware => build_hardware(config).await?,
    };

    controller.begin().await?;
    controller.send_command(Command::Clear).await?;

    let valves = SelectorValveSystem::new(controller.clone(), &config.selector_valves);
    valves.initialize().await?;

    let disc_pump = match config.application_type() {
        ApplicationType::OpenChamber => Some(
            Arc::new(DiscPump::new(controller.clone(), &config.disc_pump)) as Arc<dyn DiscPumpControl>,
        ),
        ApplicationType::Merfish => None,
    };

    Ok(FluidicsDevices {
        controller,
        syringe_pump,
        selector_valve: Arc::new(valves),
        temperature,
        disc_pump,
    })
}

type CoreDevices = (
    Arc<dyn CommandChannel>,
    Arc<dyn SyringePump>,
    Option<Arc<dyn TemperatureControl>>,
);

fn build_simulated(config: &FluidicsConfig, options: &SimulationOptions) -> CoreDevices {
    let controller: Arc<dyn CommandChannel> = Arc::new(SimulatedController::new(
        options.mode,
        options.faults.clone(),
        options.log.clone(),
    ));
    let pump: Arc<dyn SyringePump> = Arc::new(SimulatedSyringePump::new(
        &config.syringe_pump,
        options.mode,
        options.faults.clone(),
        options.log.clone(),
    ));
    let temperature = config.active_temperature_controller().map(|_| {
        Arc::new(SimulatedTemperatureController::new(
            options.mode,
            options.faults.clone(),
            options.log.clone(),
        )) as Arc<dyn TemperatureControl>
    });
    (controller, pump, temperature)
}

#[cfg(feature = "serial")]
async fn build_hardware(config: &FluidicsConfig) -> AppResult<CoreDevices> {
    use controller::FluidController;
    use syringe_pump::SerialSyringePump;
    use temperature::SerialTemperatureController;

    if config.microcontroller.serial_number.trim().is_empty() {
        return Err(FluidicsError::Configuration(
            "microcontroller.serial_number is required for hardware mode".to_string(),
        ));
    }
    if config.syringe_pump.serial_number.trim().is_empty() {
        return Err(FluidicsError::Configuration(
            "syringe_pump.serial_number is required for hardware mode".to_string(),
        ));
    }

    let controller: Arc<dyn CommandChannel> =
        Arc::new(FluidController::open(&config.microcontroller, &config.timeouts).await?);
    let pump: Arc<dyn SyringePump> =
        Arc::new(SerialSyringePump::open(&config.syringe_pump, &config.timeouts).await?);
    let temperature = match config.active_temperature_controller() {
        Some(tc) => Some(Arc::new(SerialTemperatureController::open(tc, &config.timeouts).await?)
            as Arc<dyn TemperatureControl>),
        None => None,
    };
    Ok((controller, pump, temperature))
}

#[cfg(not(feature = "serial"))]
async fn build_hardware(_config: &FluidicsConfig) -> AppResult<CoreDevices> {
    Err(FluidicsError::Configuration(
        "built without the `serial` feature; only simulated devices are available".to_string(),
    ))
}
