//! # Rust Fluidics
//!
//! Sequence execution for automated fluidics: a microcontroller with rotary
//! selector valves, a syringe pump, an optional temperature controller and,
//! for open-chamber protocols, a disc pump. A protocol is a table of named
//! operations that runs strictly in order against this shared fluid path.
//!
//! ## Crate Structure
//!
//! - **`config`**: `FluidicsConfig`, loaded with figment from JSON/TOML plus `FLUIDICS_` env overrides.
//! - **`error`**: the `FluidicsError` enum and the `AppResult` alias.
//! - **`logging`**: tracing-subscriber setup (pretty, compact, JSON).
//! - **`sequence`**: sequence rows and tables, CSV loading, run sections and round remapping.
//! - **`hardware`**: capability traits, serial drivers, simulated devices and the
//!   `build_devices` factory.
//! - **`operations`**: MERFISH and Open Chamber operation sets, turning rows into device calls.
//! - **`engine`**: the run state machine, callbacks and time estimates.
//! - **`fluidics`**: the `Fluidics` orchestrator tying everything together.

pub mod config;
pub mod engine;
pub mod error;
pub mod fluidics;
pub mod hardware;
pub mod logging;
pub mod operations;
pub mod sequence;

pub use config::FluidicsConfig;
pub use engine::{
    ChannelCallbacks, EngineEvent, EngineState, LoggingCallbacks, ProgressStatus, RunStatus,
    SequenceCallbacks, TimeEstimate,
};
pub use error::{AppResult, FluidicsError};
pub use fluidics::{Fluidics, FluidicsBuilder};
pub use hardware::{DeviceMode, SimulationOptions};
pub use sequence::{RunSection, SequenceRow, SequenceTable};
