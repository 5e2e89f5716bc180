//! Operation sets: protocol-family translation from sequence rows to device calls.
//!
//! Every protocol family publishes a fixed table of operation names. The table is
//! turned into an [`OperationRegistry`] when the set is built, so looking up a row is
//! a map access that yields a tagged [`OperationKind`]. Names outside the table fail
//! with [`FluidicsError::UnknownOperation`]; nothing is skipped silently.
//!
//! Handlers run to completion before returning. The engine relies on that to keep
//! the shared fluid path strictly sequential.

pub mod merfish;
pub mod open_chamber;

pub use merfish::MerfishOperations;
pub use open_chamber::OpenChamberOperations;

use crate::config::{ApplicationType, FluidicsConfig, TemperatureControllerConfig};
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::{PumpPort, SelectorValve, SyringePump, TemperatureControl};
use crate::hardware::FluidicsDevices;
use crate::sequence::SequenceRow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Handler variant an operation name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Fill the lines from a port without touching the sample
    Priming,
    /// Pull reagent through the flow cell, then hold
    Flow,
    /// Hold for `duration_s`, optionally at a temperature
    Incubate,
    /// Change the temperature setpoint and wait for it
    SetTemperature,
    /// Flush a port and empty the syringe
    CleanUp,
    /// Pipette reagent into an open chamber
    AddReagent,
    /// Drain the open chamber with the disc pump
    RemoveReagent,
    /// Circulate the open chamber with the disc pump
    Mix,
    /// Add, mix and remove in one step
    Wash,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OperationKind::Priming => "priming",
            OperationKind::Flow => "flow",
            OperationKind::Incubate => "incubate",
            OperationKind::SetTemperature => "set_temperature",
            OperationKind::CleanUp => "clean_up",
            OperationKind::AddReagent => "add_reagent",
            OperationKind::RemoveReagent => "remove_reagent",
            OperationKind::Mix => "mix",
            OperationKind::Wash => "wash",
        };
        f.write_str(label)
    }
}

/// Row parameters handed to a handler. Fields an operation does not use are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationParams {
    /// Logical fluidic port
    pub port: u32,
    /// Volume in microliters
    pub volume_ul: f64,
    /// Flow rate in microliters per second
    pub flow_rate_ul_per_s: f64,
    /// Hold time in seconds
    pub duration_s: f64,
    /// Port used to chase reagent out of the tubing
    pub fill_tubing_with: Option<u32>,
    /// Temperature setpoint
    pub temperature_c: Option<f64>,
}

impl From<&SequenceRow> for OperationParams {
    fn from(row: &SequenceRow) -> Self {
        Self {
            port: row.fluidic_port,
            volume_ul: row.volume_ul,
            flow_rate_ul_per_s: row.flow_rate_ul_per_s,
            duration_s: row.duration_s,
            fill_tubing_with: row.fill_tubing_with,
            temperature_c: row.temperature_c,
        }
    }
}

impl OperationParams {
    /// Volume and rate, both required to be positive.
    pub fn require_flow(&self, operation: OperationKind) -> AppResult<(f64, f64)> {
        if self.volume_ul <= 0.0 || self.flow_rate_ul_per_s <= 0.0 {
            return Err(FluidicsError::InvalidParameter(format!(
                "{} needs a positive volume and flow rate (got {} uL at {} uL/s)",
                operation, self.volume_ul, self.flow_rate_ul_per_s
            )));
        }
        Ok((self.volume_ul, self.flow_rate_ul_per_s))
    }

    /// Temperature setpoint, required.
    pub fn require_temperature(&self, operation: OperationKind) -> AppResult<f64> {
        self.temperature_c.ok_or_else(|| {
            FluidicsError::InvalidParameter(format!("{} needs a temperature_c value", operation))
        })
    }

    /// Hold time, zero when not given.
    pub fn hold(&self) -> Duration {
        Duration::from_secs_f64(self.duration_s.max(0.0))
    }
}

/// Name to handler map of one protocol family.
#[derive(Debug, Clone)]
pub struct OperationRegistry {
    family: &'static str,
    handlers: HashMap<String, OperationKind>,
}

impl OperationRegistry {
    /// Build from a `(name, kind)` table.
    pub fn new(family: &'static str, table: &[(&str, OperationKind)]) -> Self {
        let handlers = table
            .iter()
            .map(|(name, kind)| (name.to_string(), *kind))
            .collect();
        Self { family, handlers }
    }

    /// Protocol family label.
    pub fn family(&self) -> &'static str {
        self.family
    }

    /// Handler for `name`.
    pub fn resolve(&self, name: &str) -> AppResult<OperationKind> {
        self.handlers
            .get(name)
            .copied()
            .ok_or_else(|| FluidicsError::UnknownOperation {
                name: name.to_string(),
                family: self.family.to_string(),
            })
    }

    /// Supported names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Protocol-family capability object.
#[async_trait]
pub trait OperationSet: Send + Sync {
    /// Protocol family label, e.g. "MERFISH".
    fn family(&self) -> &'static str;

    /// Resolve a sequence name to its handler.
    fn resolve(&self, name: &str) -> AppResult<OperationKind>;

    /// Operation names this set accepts.
    fn supported_operations(&self) -> Vec<String>;

    /// Run one handler once.
    async fn execute(&self, kind: OperationKind, params: &OperationParams) -> AppResult<()>;

    /// Run a row: resolve its name, then execute it `repeat` times.
    async fn run_row(&self, row: &SequenceRow) -> AppResult<()> {
        let kind = self.resolve(&row.sequence_name)?;
        let params = OperationParams::from(row);
        for pass in 0..row.repeat.max(1) {
            debug!(operation = %kind, pass, "Executing operation");
            self.execute(kind, &params).await?;
        }
        Ok(())
    }

    /// Unknown operation names in `rows`, one error per offending row.
    fn check_rows(&self, rows: &[SequenceRow]) -> Vec<FluidicsError> {
        rows.iter()
            .filter_map(|row| self.resolve(&row.sequence_name).err())
            .collect()
    }
}

/// Build the operation set for the configured application.
pub fn build_operation_set(
    config: &FluidicsConfig,
    devices: &FluidicsDevices,
) -> AppResult<Arc<dyn OperationSet>> {
    let set: Arc<dyn OperationSet> = match config.application_type() {
        ApplicationType::Merfish => Arc::new(MerfishOperations::new(config, devices)),
        ApplicationType::OpenChamber => Arc::new(OpenChamberOperations::new(config, devices)?),
    };
    info!(family = set.family(), "Operation set ready");
    Ok(set)
}

// =============================================================================
// Shared device helpers
// =============================================================================

/// Syringe pump plus selector valve, the shared fluid path.
#[derive(Clone)]
pub struct FluidPath {
    pump: Arc<dyn SyringePump>,
    valve: Arc<dyn SelectorValve>,
}

impl FluidPath {
    /// Path over the given devices.
    pub fn new(pump: Arc<dyn SyringePump>, valve: Arc<dyn SelectorValve>) -> Self {
        Self { pump, valve }
    }

    /// Syringe pump handle.
    pub fn pump(&self) -> &Arc<dyn SyringePump> {
        &self.pump
    }

    /// Pull `volume_ul` from `port` through the pump's `inlet`, discarding to waste.
    ///
    /// Volumes larger than the syringe are moved in full strokes, the syringe being
    /// emptied to waste between strokes.
    #[instrument(skip(self), err)]
    pub async fn draw_to_waste(
        &self,
        port: u32,
        inlet: PumpPort,
        volume_ul: f64,
        rate_ul_per_s: f64,
    ) -> AppResult<()> {
        self.valve.select(port).await?;
        self.empty(rate_ul_per_s).await?;
        let mut remaining = volume_ul;
        while remaining > 0.0 {
            let stroke = remaining.min(self.pump.capacity_ul());
            self.pump.select_port(inlet).await?;
            self.pump.aspirate(stroke, rate_ul_per_s).await?;
            self.pump.dispense_to_waste(rate_ul_per_s).await?;
            remaining -= stroke;
        }
        Ok(())
    }

    /// Move `volume_ul` from `port` into the chamber, one syringe stroke at a time.
    #[instrument(skip(self), err)]
    pub async fn deliver_to_chamber(
        &self,
        port: u32,
        volume_ul: f64,
        rate_ul_per_s: f64,
    ) -> AppResult<()> {
        self.valve.select(port).await?;
        self.empty(rate_ul_per_s).await?;
        let mut remaining = volume_ul;
        while remaining > 0.0 {
            let stroke = remaining.min(self.pump.capacity_ul());
            self.pump.select_port(PumpPort::Reagent).await?;
            self.pump.aspirate(stroke, rate_ul_per_s).await?;
            self.pump.select_port(PumpPort::Chamber).await?;
            self.pump.dispense(stroke, rate_ul_per_s).await?;
            remaining -= stroke;
        }
        Ok(())
    }

    /// Empty whatever the syringe holds into waste.
    pub async fn empty(&self, rate_ul_per_s: f64) -> AppResult<()> {
        if self.pump.contents_ul().await? > 0.0 {
            self.pump.dispense_to_waste(rate_ul_per_s).await?;
        }
        Ok(())
    }
}

/// Optional temperature controller with its settle parameters.
#[derive(Clone)]
pub struct Thermal {
    controller: Option<Arc<dyn TemperatureControl>>,
    tolerance_c: f64,
    settle_timeout: Duration,
}

impl Thermal {
    /// Bind the controller (if any) to its configuration.
    pub fn new(
        controller: Option<Arc<dyn TemperatureControl>>,
        config: Option<&TemperatureControllerConfig>,
    ) -> Self {
        let defaults = TemperatureControllerConfig::default();
        let config = config.unwrap_or(&defaults);
        Self {
            controller,
            tolerance_c: config.tolerance_c,
            settle_timeout: Duration::from_secs_f64(config.settle_timeout_s.max(0.0)),
        }
    }

    /// True when a controller is present.
    pub fn is_available(&self) -> bool {
        self.controller.is_some()
    }

    /// Set `celsius` and wait until the reading settles.
    pub async fn settle_at(&self, celsius: f64) -> AppResult<f64> {
        let controller = self
            .controller
            .as_ref()
            .ok_or(FluidicsError::MissingDevice("temperature controller"))?;
        controller.set_setpoint(celsius).await?;
        let reading = controller
            .wait_for_setpoint(celsius, self.tolerance_c, self.settle_timeout)
            .await?;
        info!(setpoint_c = celsius, reading_c = reading, "Temperature settled");
        Ok(reading)
    }
}

/// Hold for `duration`, logging the wait.
pub(crate) async fn incubate(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    info!(seconds = duration.as_secs_f64(), "Incubating");
    tokio::time::sleep(duration).await;
}
