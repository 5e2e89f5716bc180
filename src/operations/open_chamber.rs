//! Open Chamber operation set.
//!
//! Reagents are pipetted into an open chamber by the syringe pump and taken out
//! again by the disc pump, which also circulates the chamber for mixing.

use super::{incubate, FluidPath, OperationKind, OperationParams, OperationRegistry, OperationSet, Thermal};
use crate::config::{DiscPumpConfig, FluidicsConfig};
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::DiscPumpControl;
use crate::hardware::disc_pump::circulation_time;
use crate::hardware::FluidicsDevices;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Protocol family label.
pub const FAMILY: &str = "Open Chamber";

const OPERATIONS: &[(&str, OperationKind)] = &[
    ("Add Reagent", OperationKind::AddReagent),
    ("Flow Probe", OperationKind::AddReagent),
    ("Stain", OperationKind::AddReagent),
    ("Remove Reagent", OperationKind::RemoveReagent),
    ("Wash", OperationKind::Wash),
    ("Mix", OperationKind::Mix),
    ("Incubate", OperationKind::Incubate),
    ("Set Temperature", OperationKind::SetTemperature),
    ("Clean Up", OperationKind::CleanUp),
];

/// Operations for open-chamber protocols.
pub struct OpenChamberOperations {
    registry: OperationRegistry,
    path: FluidPath,
    thermal: Thermal,
    disc_pump: Arc<dyn DiscPumpControl>,
    disc_config: DiscPumpConfig,
}

impl OpenChamberOperations {
    /// Bind the operation table to the device bundle.
    ///
    /// Fails with `MissingDevice` when the bundle carries no disc pump.
    pub fn new(config: &FluidicsConfig, devices: &FluidicsDevices) -> AppResult<Self> {
        let disc_pump = devices
            .disc_pump
            .clone()
            .ok_or(FluidicsError::MissingDevice("disc pump"))?;
        Ok(Self {
            registry: OperationRegistry::new(FAMILY, OPERATIONS),
            path: FluidPath::new(devices.syringe_pump.clone(), devices.selector_valve.clone()),
            thermal: Thermal::new(
                devices.temperature.clone(),
                config.active_temperature_controller(),
            ),
            disc_pump,
            disc_config: config.disc_pump.clone(),
        })
    }

    fn power(&self) -> u8 {
        self.disc_config.max_power
    }

    async fn add(&self, params: &OperationParams) -> AppResult<()> {
        let (volume, rate) = params.require_flow(OperationKind::AddReagent)?;
        self.path.deliver_to_chamber(params.port, volume, rate).await
    }

    /// Drain time: from the volume when given, otherwise the row duration.
    fn drain_time(&self, params: &OperationParams) -> AppResult<Duration> {
        if params.volume_ul > 0.0 {
            return circulation_time(&self.disc_config, params.volume_ul, self.power());
        }
        let hold = params.hold();
        if hold.is_zero() {
            return Err(FluidicsError::InvalidParameter(
                "remove_reagent needs a volume or a duration".to_string(),
            ));
        }
        Ok(hold)
    }

    #[instrument(skip(self, params), fields(volume_ul = params.volume_ul), err)]
    async fn remove(&self, params: &OperationParams) -> AppResult<()> {
        let run = self.drain_time(params)?;
        debug!(seconds = run.as_secs_f64(), "Draining chamber");
        self.disc_pump.run_for(run, self.power()).await
    }

    async fn mix(&self, duration: Duration) -> AppResult<()> {
        if duration.is_zero() {
            return Err(FluidicsError::InvalidParameter(
                "mix needs a positive duration_s".to_string(),
            ));
        }
        self.disc_pump.run_for(duration, self.power()).await
    }

    async fn wash(&self, params: &OperationParams) -> AppResult<()> {
        self.add(params).await?;
        let hold = params.hold();
        if !hold.is_zero() {
            self.disc_pump.run_for(hold, self.power()).await?;
        }
        let run = circulation_time(&self.disc_config, params.volume_ul, self.power())?;
        self.disc_pump.run_for(run, self.power()).await
    }
}

#[async_trait]
impl OperationSet for OpenChamberOperations {
    fn family(&self) -> &'static str {
        self.registry.family()
    }

    fn resolve(&self, name: &str) -> AppResult<OperationKind> {
        self.registry.resolve(name)
    }

    fn supported_operations(&self) -> Vec<String> {
        self.registry.names()
    }

    async fn execute(&self, kind: OperationKind, params: &OperationParams) -> AppResult<()> {
        match kind {
            OperationKind::AddReagent => {
                self.add(params).await?;
                incubate(params.hold()).await;
                Ok(())
            }
            OperationKind::RemoveReagent => self.remove(params).await,
            OperationKind::Mix => self.mix(params.hold()).await,
            OperationKind::Wash => self.wash(params).await,
            OperationKind::Incubate => {
                if let Some(celsius) = params.temperature_c {
                    if self.thermal.is_available() {
                        self.thermal.settle_at(celsius).await?;
                    } else {
                        warn!(setpoint_c = celsius, "No temperature controller; incubating at ambient");
                    }
                }
                incubate(params.hold()).await;
                Ok(())
            }
            OperationKind::SetTemperature => {
                let celsius = params.require_temperature(kind)?;
                self.thermal.settle_at(celsius).await.map(|_| ())
            }
            OperationKind::CleanUp => {
                self.add(params).await?;
                let run = circulation_time(&self.disc_config, params.volume_ul, self.power())?;
                let result = self.disc_pump.run_for(run, self.power()).await;
                self.path.empty(params.flow_rate_ul_per_s).await?;
                result
            }
            OperationKind::Priming | OperationKind::Flow => Err(FluidicsError::UnknownOperation {
                name: kind.to_string(),
                family: FAMILY.to_string(),
            }),
        }
    }
}
