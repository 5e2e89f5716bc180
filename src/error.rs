//! Custom error types for the fluidics engine.
//!
//! This module defines the primary error type, `FluidicsError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while running a fluidic protocol,
//! from configuration and sequence-file issues to device-level failures.
//!
//! ## Error Hierarchy
//!
//! `FluidicsError` consolidates three broad categories:
//!
//! - **Setup errors** (`Config`, `Configuration`, `SequenceTable`, `Csv`, `Io`): raised by
//!   `Fluidics::initialize()` and propagated synchronously to the caller. No run starts.
//! - **Device errors** (`InvalidPort`, `VolumeOutOfRange`, `SpeedOutOfRange`,
//!   `InvalidParameter`, `Hardware`, `Timeout`, `MissingDevice`): raised inside drivers and operation handlers. The engine
//!   catches them at the row boundary, reports them through `on_error` and fails the run.
//! - **Orchestration errors** (`UnknownOperation`, `RunInProgress`, `NotInitialized`,
//!   `RoundsNotSet`, `RoundIndexOutOfRange`, `InvalidTransition`, `EngineTask`).
//!
//! By using `#[from]`, `FluidicsError` can be created from the underlying error types,
//! keeping the `?` operator usable throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, FluidicsError>;

/// Primary error type for the fluidics engine.
#[derive(Error, Debug)]
pub enum FluidicsError {
    /// Configuration file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Sequence table is malformed (missing columns, bad values).
    #[error("Sequence table error: {0}")]
    SequenceTable(String),

    /// CSV reader failure while loading a sequence table.
    #[error("Sequence file error: {0}")]
    Csv(#[from] csv::Error),

    /// Standard I/O failure (file access, serial port I/O).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested fluidic port is outside the configured valve range.
    #[error("Invalid fluidic port {port} (valid range {min}..={max})")]
    InvalidPort {
        /// Requested logical port
        port: u32,
        /// Lowest valid port
        min: u32,
        /// Highest valid port
        max: u32,
    },

    /// Requested volume does not fit in the syringe.
    #[error("Volume {requested_ul} uL out of range (syringe capacity {capacity_ul} uL)")]
    VolumeOutOfRange {
        /// Requested volume in microliters
        requested_ul: f64,
        /// Syringe capacity in microliters
        capacity_ul: f64,
    },

    /// Requested flow rate exceeds the configured pump speed limit.
    #[error("Flow rate {requested_ul_per_s} uL/s exceeds pump limit {limit_ul_per_s} uL/s")]
    SpeedOutOfRange {
        /// Requested flow rate
        requested_ul_per_s: f64,
        /// Fastest rate permitted by `speed_code_limit`
        limit_ul_per_s: f64,
    },

    /// Row parameters are unusable for the requested operation (e.g. zero flow rate).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Device reported a fault or answered with an unusable response.
    #[error("Hardware error on {device}: {message}")]
    Hardware {
        /// Device label (e.g. "syringe_pump")
        device: String,
        /// Device-level message
        message: String,
    },

    /// Device did not acknowledge within the bounded timeout.
    #[error("{device} did not acknowledge '{operation}' within {timeout_ms} ms")]
    Timeout {
        /// Device label
        device: String,
        /// Operation being waited on
        operation: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Sequence row names an operation the active operation set does not provide.
    #[error("Unknown operation '{name}' for {family} protocol")]
    UnknownOperation {
        /// Sequence name from the table
        name: String,
        /// Protocol family of the operation set
        family: String,
    },

    /// Operation requires a device that is not configured.
    #[error("Operation requires a {0}, but none is configured")]
    MissingDevice(&'static str),

    /// A run is already active.
    #[error("A sequence run is already in progress")]
    RunInProgress,

    /// Orchestrator used before `initialize()`.
    #[error("Fluidics system not initialized")]
    NotInitialized,

    /// `update_port` called before `set_rounds`.
    #[error("No rounds configured; call set_rounds first")]
    RoundsNotSet,

    /// Round index outside the configured port list.
    #[error("Round index {index} out of range ({len} rounds configured)")]
    RoundIndexOutOfRange {
        /// Requested round
        index: usize,
        /// Number of configured rounds
        len: usize,
    },

    /// Engine state machine rejected a transition.
    #[error("Invalid run state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Background engine task panicked or was aborted.
    #[error("Engine task failed: {0}")]
    EngineTask(String),
}

impl FluidicsError {
    /// Build a hardware error for the given device.
    pub fn hardware(device: impl Into<String>, message: impl Into<String>) -> Self {
        FluidicsError::Hardware {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a timeout error for the given device and operation.
    pub fn timeout(device: impl Into<String>, operation: impl Into<String>, timeout_ms: u64) -> Self {
        FluidicsError::Timeout {
            device: device.into(),
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// True for errors raised while loading configuration or sequence files.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            FluidicsError::Config(_)
                | FluidicsError::Configuration(_)
                | FluidicsError::SequenceTable(_)
                | FluidicsError::Csv(_)
        )
    }

    /// True for device-level failures (no acknowledgement, fault, timeout).
    pub fn is_hardware_error(&self) -> bool {
        matches!(
            self,
            FluidicsError::Hardware { .. } | FluidicsError::Timeout { .. } | FluidicsError::Io(_)
        )
    }
}
