//! MERFISH operation set.
//!
//! Reagent exchange happens by pulling liquid through the flow cell: the selector
//! valve routes a port to the flow cell inlet and the syringe pump draws through
//! its chamber port, then empties into waste. No disc pump is involved.

use super::{incubate, FluidPath, OperationKind, OperationParams, OperationRegistry, OperationSet, Thermal};
use crate::config::FluidicsConfig;
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::PumpPort;
use crate::hardware::FluidicsDevices;
use async_trait::async_trait;
use tracing::{info, instrument, warn};

/// Protocol family label.
pub const FAMILY: &str = "MERFISH";

const OPERATIONS: &[(&str, OperationKind)] = &[
    ("Priming", OperationKind::Priming),
    ("Flow Probe", OperationKind::Flow),
    ("Flow Reagent", OperationKind::Flow),
    ("Stain", OperationKind::Flow),
    ("Wash", OperationKind::Flow),
    ("Flow Wash Buffer", OperationKind::Flow),
    ("Flow Imaging Buffer", OperationKind::Flow),
    ("Flow Cleavage Buffer", OperationKind::Flow),
    ("Flow SSC Rinse", OperationKind::Flow),
    ("Incubate", OperationKind::Incubate),
    ("Set Temperature", OperationKind::SetTemperature),
    ("Clean Up", OperationKind::CleanUp),
];

/// Operations for flow-cell protocols.
pub struct MerfishOperations {
    registry: OperationRegistry,
    path: FluidPath,
    thermal: Thermal,
    tubing_volume_ul: f64,
}

impl MerfishOperations {
    /// Bind the operation table to the device bundle.
    pub fn new(config: &FluidicsConfig, devices: &FluidicsDevices) -> Self {
        Self {
            registry: OperationRegistry::new(FAMILY, OPERATIONS),
            path: FluidPath::new(devices.syringe_pump.clone(), devices.selector_valve.clone()),
            thermal: Thermal::new(
                devices.temperature.clone(),
                config.active_temperature_controller(),
            ),
            tubing_volume_ul: config.syringe_pump.tubing_volume_ul,
        }
    }

    #[instrument(skip(self, params), fields(port = params.port, volume_ul = params.volume_ul), err)]
    async fn flow(&self, params: &OperationParams) -> AppResult<()> {
        let (volume, rate) = params.require_flow(OperationKind::Flow)?;
        self.path
            .draw_to_waste(params.port, PumpPort::Chamber, volume, rate)
            .await?;

        if let Some(chase_port) = params.fill_tubing_with {
            if self.tubing_volume_ul > 0.0 {
                info!(chase_port, volume_ul = self.tubing_volume_ul, "Chasing reagent from tubing");
                self.path
                    .draw_to_waste(chase_port, PumpPort::Chamber, self.tubing_volume_ul, rate)
                    .await?;
            }
        }

        incubate(params.hold()).await;
        Ok(())
    }

    async fn incubate_row(&self, params: &OperationParams) -> AppResult<()> {
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
}

#[async_trait]
impl OperationSet for MerfishOperations {
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
            OperationKind::Flow => self.flow(params).await,
            OperationKind::Priming => {
                let (volume, rate) = params.require_flow(kind)?;
                self.path
                    .draw_to_waste(params.port, PumpPort::Reagent, volume, rate)
                    .await
            }
            OperationKind::Incubate => self.incubate_row(params).await,
            OperationKind::SetTemperature => {
                let celsius = params.require_temperature(kind)?;
                self.thermal.settle_at(celsius).await.map(|_| ())
            }
            OperationKind::CleanUp => {
                let (volume, rate) = params.require_flow(kind)?;
                self.path
                    .draw_to_waste(params.port, PumpPort::Reagent, volume, rate)
                    .await?;
                self.path
                    .draw_to_waste(params.port, PumpPort::Chamber, volume, rate)
                    .await
            }
            OperationKind::AddReagent
            | OperationKind::RemoveReagent
            | OperationKind::Mix
            | OperationKind::Wash => Err(FluidicsError::UnknownOperation {
                name: kind.to_string(),
                family: FAMILY.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CommandLog, DeviceEvent, FaultPlan};
    use crate::hardware::protocol::Command;
    use crate::hardware::{build_devices, DeviceMode, SimulationOptions};
    use crate::sequence::SequenceRow;

    fn config(with_tcm: bool) -> FluidicsConfig {
        let tcm = if with_tcm {
            r#""temperature_controller": { "use_temperature_controller": true, "serial_number": "TCM-1" },"#
        } else {
            ""
        };
        FluidicsConfig::from_json_str(&format!(
            r#"{{
                "application": "MERFISH",
                {}
                "microcontroller": {{ "serial_number": "" }},
                "syringe_pump": {{ "serial_number": "", "volume_ul": 1000, "speed_code_limit": 0,
                                  "tubing_volume_ul": 200 }},
                "selector_valves": {{ "valve_ids": [0, 1, 2], "ports_per_valve": 12 }}
            }}"#,
            tcm
        ))
        .unwrap()
    }

    async fn operations(config: &FluidicsConfig, faults: FaultPlan) -> (MerfishOperations, CommandLog) {
        let options = SimulationOptions::instant().with_faults(faults);
        let log = options.log.clone();
        let devices = build_devices(config, &DeviceMode::Simulated(options))
            .await
            .unwrap();
        log.clear();
        (MerfishOperations::new(config, &devices), log)
    }

    #[tokio::test]
    async fn flow_probe_pulls_through_flow_cell_then_wastes() {
        let (ops, log) = operations(&config(false), FaultPlan::none()).await;
        ops.run_row(&SequenceRow::new("Flow Probe", 5).with_flow(400.0, 20.0))
            .await
            .unwrap();

        let events = log.events();
        assert_eq!(
            events[0],
            DeviceEvent::Controller(Command::SetRotaryValve { valve: 0, position: 5 })
        );
        assert_eq!(events[1], DeviceEvent::PumpPort(PumpPort::Chamber));
        assert!(matches!(events[2], DeviceEvent::Aspirate { volume_ul, .. } if volume_ul == 400.0));
        assert_eq!(events[3], DeviceEvent::PumpPort(PumpPort::Waste));
        assert_eq!(log.dispensed_ul(), 400.0);
    }

    #[tokio::test]
    async fn fill_tubing_chases_with_second_port() {
        let (ops, log) = operations(&config(false), FaultPlan::none()).await;
        ops.run_row(
            &SequenceRow::new("Flow Reagent", 3)
                .with_flow(300.0, 20.0)
                .with_fill_tubing(30),
        )
        .await
        .unwrap();

        let valve_moves = log.controller_commands();
        assert_eq!(valve_moves.first(), Some(&Command::SetRotaryValve { valve: 0, position: 3 }));
        assert_eq!(
            valve_moves[1..].to_vec(),
            vec![
                Command::SetRotaryValve { valve: 0, position: 12 },
                Command::SetRotaryValve { valve: 1, position: 12 },
                Command::SetRotaryValve { valve: 2, position: 8 },
            ]
        );
        assert_eq!(log.dispensed_ul(), 500.0);
    }

    #[tokio::test]
    async fn repeat_runs_the_operation_again() {
        let (ops, log) = operations(&config(false), FaultPlan::none()).await;
        ops.run_row(&SequenceRow::new("Wash", 30).with_flow(100.0, 20.0).with_repeat(3))
            .await
            .unwrap();
        assert_eq!(log.dispensed_ul(), 300.0);
    }

    #[tokio::test(start_paused = true)]
    async fn incubate_holds_for_duration() {
        let (ops, _log) = operations(&config(false), FaultPlan::none()).await;
        let start = tokio::time::Instant::now();
        ops.run_row(&SequenceRow::new("Incubate", 0).with_duration(90.0))
            .await
            .unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_secs(90));
    }

    #[tokio::test]
    async fn set_temperature_requires_controller() {
        let (ops, _log) = operations(&config(false), FaultPlan::none()).await;
        let err = ops
            .run_row(&SequenceRow::new("Set Temperature", 0).with_temperature(37.0))
            .await
            .unwrap_err();
        assert!(matches!(err, FluidicsError::MissingDevice(_)));

        let (ops, log) = operations(&config(true), FaultPlan::none()).await;
        ops.run_row(&SequenceRow::new("Set Temperature", 0).with_temperature(37.0))
            .await
            .unwrap();
        assert_eq!(log.events(), vec![DeviceEvent::Setpoint(37.0)]);
    }

    #[tokio::test]
    async fn pump_fault_surfaces_as_hardware_error() {
        let (ops, _log) = operations(&config(false), FaultPlan::fail_after("aspirate", 0)).await;
        let err = ops
            .run_row(&SequenceRow::new("Flow Probe", 5).with_flow(400.0, 20.0))
            .await
            .unwrap_err();
        assert!(err.is_hardware_error());
    }

    #[tokio::test]
    async fn open_chamber_names_are_unknown() {
        let (ops, log) = operations(&config(false), FaultPlan::none()).await;
        let err = ops
            .run_row(&SequenceRow::new("Mix", 0).with_duration(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, FluidicsError::UnknownOperation { .. }));
        assert!(log.events().is_empty());
        assert_eq!(ops.check_rows(&[SequenceRow::new("Image", 0)]).len(), 1);
    }
}
