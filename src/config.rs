//! Fluidics Configuration using Figment
//!
//! Strongly-typed configuration for the fluidics system. Configuration is loaded from:
//! 1. A JSON file (the canonical format; `.toml` files are accepted as well)
//! 2. Environment variables prefixed with `FLUIDICS_`, using `__` as the nesting separator
//!
//! # Example
//! ```no_run
//! use rust_fluidics::config::FluidicsConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FluidicsConfig::load_from("config/fluidics.json")?;
//! println!("Application: {:?}", config.application_type());
//! # Ok(())
//! # }
//! ```
//!
//! Environment override example: `FLUIDICS_SYRINGE_PUMP__SPEED_CODE_LIMIT=12`.

use crate::error::{AppResult, FluidicsError};
use crate::hardware::syringe_pump::SpeedTable;
use crate::logging::LoggingConfig;
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application string that selects the Open Chamber protocol family.
pub const OPEN_CHAMBER_APPLICATION: &str = "Open Chamber";

/// Top-level fluidics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluidicsConfig {
    /// Application name; `"Open Chamber"` selects Open Chamber, anything else MERFISH
    pub application: String,
    /// Microcontroller coordinating valves and disc pump
    pub microcontroller: MicrocontrollerConfig,
    /// Syringe pump settings
    pub syringe_pump: SyringePumpConfig,
    /// Selector valve cascade
    #[serde(default)]
    pub selector_valves: SelectorValveConfig,
    /// Optional temperature controller
    #[serde(default)]
    pub temperature_controller: Option<TemperatureControllerConfig>,
    /// Disc pump (Open Chamber only)
    #[serde(default)]
    pub disc_pump: DiscPumpConfig,
    /// Device acknowledgement timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Imaging split used by `run_before_imaging`/`run_after_imaging`
    #[serde(default)]
    pub imaging: ImagingConfig,
    /// Sequence engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging output
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Protocol family selected by the `application` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationType {
    /// Multiplexed FISH: reagent exchange through the syringe and selector valves
    Merfish,
    /// Open chamber: syringe delivery plus disc-pump circulation
    OpenChamber,
}

impl std::fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplicationType::Merfish => write!(f, "MERFISH"),
            ApplicationType::OpenChamber => write!(f, "Open Chamber"),
        }
    }
}

/// Microcontroller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrocontrollerConfig {
    /// USB serial number used to locate the port
    pub serial_number: String,
    /// Serial baud rate
    #[serde(default = "default_controller_baud")]
    pub baud_rate: u32,
}

/// Policy applied when a requested flow rate is faster than `speed_code_limit` allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedLimitPolicy {
    /// Run at the fastest permitted speed and log a warning
    #[default]
    Clamp,
    /// Fail the operation with `SpeedOutOfRange`
    Reject,
}

/// Syringe pump settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyringePumpConfig {
    /// USB serial number used to locate the port
    pub serial_number: String,
    /// Syringe capacity in microliters
    pub volume_ul: f64,
    /// Fastest speed code the plumbing tolerates (lower code = faster)
    pub speed_code_limit: u8,
    /// Pump valve position connected to waste
    #[serde(default = "default_waste_port")]
    pub waste_port: u8,
    /// Pump valve position connected to the chamber / flow cell outlet
    #[serde(default = "default_chamber_port")]
    pub chamber_port: u8,
    /// Pump valve position connected to the selector valve cascade
    #[serde(default = "default_reagent_port")]
    pub reagent_port: u8,
    /// Serial baud rate
    #[serde(default = "default_pump_baud")]
    pub baud_rate: u32,
    /// Volume of the shared tubing, drawn from `fill_tubing_with` to chase a reagent
    #[serde(default = "default_tubing_volume")]
    pub tubing_volume_ul: f64,
    /// Clamp or reject over-speed requests
    #[serde(default)]
    pub speed_limit_policy: SpeedLimitPolicy,
}

/// Selector valve cascade settings
///
/// Valves are chained: every valve except the last spends its final position
/// on the link to the next valve in `valve_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorValveConfig {
    /// Valve addresses on the microcontroller, upstream first
    #[serde(default = "default_valve_ids")]
    pub valve_ids: Vec<u8>,
    /// Positions per rotary valve
    #[serde(default = "default_ports_per_valve")]
    pub ports_per_valve: u32,
    /// Highest port that rounds may remap; ports above are fixed reagents/buffers/waste
    #[serde(default = "default_round_port_max")]
    pub round_port_max: u32,
}

impl Default for SelectorValveConfig {
    fn default() -> Self {
        Self {
            valve_ids: default_valve_ids(),
            ports_per_valve: default_ports_per_valve(),
            round_port_max: default_round_port_max(),
        }
    }
}

impl SelectorValveConfig {
    /// Number of logical ports reachable through the cascade.
    pub fn port_capacity(&self) -> u32 {
        let valves = self.valve_ids.len() as u32;
        if valves == 0 {
            return 0;
        }
        (valves - 1) * (self.ports_per_valve - 1) + self.ports_per_valve
    }
}

/// Temperature controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureControllerConfig {
    /// Whether the controller is present and should be driven
    #[serde(default)]
    pub use_temperature_controller: bool,
    /// USB serial number used to locate the port
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Serial baud rate
    #[serde(default = "default_tcm_baud")]
    pub baud_rate: u32,
    /// Allowed deviation from setpoint when waiting for stability (degrees C)
    #[serde(default = "default_tolerance_c")]
    pub tolerance_c: f64,
    /// Maximum time to wait for the setpoint to be reached
    #[serde(default = "default_settle_timeout_s")]
    pub settle_timeout_s: f64,
}

impl Default for TemperatureControllerConfig {
    fn default() -> Self {
        Self {
            use_temperature_controller: false,
            serial_number: None,
            baud_rate: default_tcm_baud(),
            tolerance_c: default_tolerance_c(),
            settle_timeout_s: default_settle_timeout_s(),
        }
    }
}

/// Disc pump settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscPumpConfig {
    /// Power level used for circulation (0-100)
    #[serde(default = "default_disc_power")]
    pub max_power: u8,
    /// Flow produced at `max_power`, used to turn volumes into run times
    #[serde(default = "default_disc_flow")]
    pub flow_ul_per_s_at_max: f64,
}

impl Default for DiscPumpConfig {
    fn default() -> Self {
        Self {
            max_power: default_disc_power(),
            flow_ul_per_s_at_max: default_disc_flow(),
        }
    }
}

/// Device acknowledgement timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Microcontroller command acknowledgement timeout
    #[serde(default = "default_command_ack_ms")]
    pub command_ack_ms: u64,
    /// Syringe pump ready timeout (covers a full slow stroke)
    #[serde(default = "default_pump_ready_ms")]
    pub pump_ready_ms: u64,
    /// Resends after a checksum error before giving up
    #[serde(default = "default_max_retries")]
    pub max_command_retries: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ack_ms: default_command_ack_ms(),
            pump_ready_ms: default_pump_ready_ms(),
            max_command_retries: default_max_retries(),
        }
    }
}

/// Imaging split for round-based acquisitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingConfig {
    /// Active rows run before imaging each round; the rest run after
    #[serde(default = "default_sequences_before_imaging")]
    pub sequences_before_imaging: usize,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            sequences_before_imaging: default_sequences_before_imaging(),
        }
    }
}

/// Sequence engine tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed per-row overhead added to the time estimate (valve switching, priming)
    #[serde(default)]
    pub row_overhead_s: f64,
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_controller_baud() -> u32 {
    2_000_000
}

fn default_pump_baud() -> u32 {
    9600
}

fn default_tcm_baud() -> u32 {
    57600
}

fn default_waste_port() -> u8 {
    3
}

fn default_chamber_port() -> u8 {
    2
}

fn default_reagent_port() -> u8 {
    1
}

fn default_tubing_volume() -> f64 {
    250.0
}

// Four 10-position valves: 37 ports, covering the round ports and the fixed buffers above them
fn default_valve_ids() -> Vec<u8> {
    vec![0, 1, 2, 3]
}

fn default_ports_per_valve() -> u32 {
    10
}

fn default_round_port_max() -> u32 {
    24
}

fn default_tolerance_c() -> f64 {
    0.5
}

fn default_settle_timeout_s() -> f64 {
    600.0
}

fn default_disc_power() -> u8 {
    100
}

fn default_disc_flow() -> f64 {
    500.0
}

fn default_command_ack_ms() -> u64 {
    5000
}

fn default_pump_ready_ms() -> u64 {
    120_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_sequences_before_imaging() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl FluidicsConfig {
    /// Load configuration from a JSON (or `.toml`) file plus `FLUIDICS_` environment overrides.
    ///
    /// The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FluidicsError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Figment::new().merge(Toml::file(path)),
            _ => Figment::new().merge(Json::file(path)),
        };

        let config: Self = figment
            .merge(Env::prefixed("FLUIDICS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string (no environment overrides).
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Json::string(json)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Protocol family selected by `application`.
    pub fn application_type(&self) -> ApplicationType {
        if self.application == OPEN_CHAMBER_APPLICATION {
            ApplicationType::OpenChamber
        } else {
            ApplicationType::Merfish
        }
    }

    /// Temperature controller settings, if one is enabled.
    pub fn active_temperature_controller(&self) -> Option<&TemperatureControllerConfig> {
        self.temperature_controller
            .as_ref()
            .filter(|tc| tc.use_temperature_controller)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let pump = &self.syringe_pump;
        if !(pump.volume_ul.is_finite() && pump.volume_ul > 0.0) {
            return Err(FluidicsError::Configuration(format!(
                "syringe_pump.volume_ul must be positive, got {}",
                pump.volume_ul
            )));
        }

        if !(pump.tubing_volume_ul.is_finite() && pump.tubing_volume_ul >= 0.0) {
            return Err(FluidicsError::Configuration(format!(
                "syringe_pump.tubing_volume_ul must be non-negative, got {}",
                pump.tubing_volume_ul
            )));
        }

        if pump.speed_code_limit > SpeedTable::MAX_CODE {
            return Err(FluidicsError::Configuration(format!(
                "syringe_pump.speed_code_limit {} exceeds the slowest speed code {}",
                pump.speed_code_limit,
                SpeedTable::MAX_CODE
            )));
        }

        let valves = &self.selector_valves;
        if valves.valve_ids.is_empty() {
            return Err(FluidicsError::Configuration(
                "selector_valves.valve_ids must list at least one valve".to_string(),
            ));
        }
        if valves.ports_per_valve < 2 || valves.ports_per_valve > u32::from(u8::MAX) {
            return Err(FluidicsError::Configuration(format!(
                "selector_valves.ports_per_valve must be 2-{}, got {}",
                u8::MAX,
                valves.ports_per_valve
            )));
        }
        if valves.round_port_max > valves.port_capacity() {
            return Err(FluidicsError::Configuration(format!(
                "selector_valves.round_port_max {} exceeds the {} ports of the valve cascade",
                valves.round_port_max,
                valves.port_capacity()
            )));
        }
        let mut ids = std::collections::HashSet::new();
        for id in &valves.valve_ids {
            if !ids.insert(id) {
                return Err(FluidicsError::Configuration(format!(
                    "Duplicate selector valve id: {}",
                    id
                )));
            }
        }

        if let Some(tc) = self.active_temperature_controller() {
            if tc.serial_number.as_deref().map_or(true, str::is_empty) {
                return Err(FluidicsError::Configuration(
                    "temperature_controller.serial_number is required when the controller is enabled"
                        .to_string(),
                ));
            }
            if tc.tolerance_c <= 0.0 {
                return Err(FluidicsError::Configuration(format!(
                    "temperature_controller.tolerance_c must be positive, got {}",
                    tc.tolerance_c
                )));
            }
        }

        if self.disc_pump.max_power > 100 {
            return Err(FluidicsError::Configuration(format!(
                "disc_pump.max_power must be 0-100, got {}",
                self.disc_pump.max_power
            )));
        }

        LoggingConfig::from_section(&self.logging)?;

        Ok(())
    }
}
