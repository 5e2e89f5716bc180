//! Fluidics orchestrator: the composition root.
//!
//! [`Fluidics`] owns the configuration, the sequence table and every device
//! handle. It builds the operation set for the configured application and runs
//! the [`SequenceEngine`] on a background Tokio task.
//!
//! # Lifecycle
//!
//! ```text
//! build() -> initialize() -> [set_rounds / update_port] -> run_sequences() -> wait_for_completion()
//!                                      ^                                              |
//!                                      +---------------- next round -----------------+
//!                                                                  cleanup()
//! ```
//!
//! Only one run may be active; a second `run_sequences` fails with
//! [`FluidicsError::RunInProgress`]. `cleanup()` never fails: release errors are
//! logged. [`Fluidics::scoped`] pairs `initialize()` with a guaranteed `cleanup()`.
//!
//! # Example
//! ```no_run
//! use rust_fluidics::fluidics::Fluidics;
//! use rust_fluidics::hardware::SimulationOptions;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let fluidics = Fluidics::builder()
//!     .config_path("config/fluidics.json")
//!     .sequence_path("config/sequences.csv")
//!     .simulated(SimulationOptions::instant())
//!     .build()?;
//!
//! fluidics
//!     .scoped(|f| {
//!         Box::pin(async move {
//!             f.set_rounds(vec![7, 8, 9]);
//!             f.update_port(0)?;
//!             f.run_sequences(None)?;
//!             f.wait_for_completion().await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::FluidicsConfig;
use crate::engine::{
    EngineState, LoggingCallbacks, RunControl, RunStatus, SequenceCallbacks, SequenceEngine,
    StateHandle,
};
use crate::error::{AppResult, FluidicsError};
use crate::hardware::{build_devices, DeviceMode, FluidicsDevices, SimulationOptions};
use crate::operations::{build_operation_set, OperationSet};
use crate::sequence::{RoundMapping, RunSection, SequenceTable};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Source<T> {
    Path(PathBuf),
    Value(T),
}

/// Builder for [`Fluidics`].
pub struct FluidicsBuilder {
    config: Option<Source<FluidicsConfig>>,
    sequences: Option<Source<SequenceTable>>,
    mode: DeviceMode,
    callbacks: Arc<dyn SequenceCallbacks>,
    operations: Option<Arc<dyn OperationSet>>,
}

impl Default for FluidicsBuilder {
    fn default() -> Self {
        Self {
            config: None,
            sequences: None,
            mode: DeviceMode::Hardware,
            callbacks: Arc::new(LoggingCallbacks),
            operations: None,
        }
    }
}

impl FluidicsBuilder {
    /// Read configuration from a file during `initialize()`.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(Source::Path(path.into()));
        self
    }

    /// Use an already loaded configuration.
    pub fn config(mut self, config: FluidicsConfig) -> Self {
        self.config = Some(Source::Value(config));
        self
    }

    /// Read the sequence table from a CSV file during `initialize()`.
    pub fn sequence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sequences = Some(Source::Path(path.into()));
        self
    }

    /// Use an in-memory sequence table.
    pub fn sequences(mut self, table: SequenceTable) -> Self {
        self.sequences = Some(Source::Value(table));
        self
    }

    /// Drive simulated devices instead of hardware.
    pub fn simulated(mut self, options: SimulationOptions) -> Self {
        self.mode = DeviceMode::Simulated(options);
        self
    }

    /// Select hardware or simulation explicitly.
    pub fn mode(mut self, mode: DeviceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Observer for every run.
    pub fn callbacks(mut self, callbacks: Arc<dyn SequenceCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Replace the operation set derived from `application`.
    pub fn operation_set(mut self, operations: Arc<dyn OperationSet>) -> Self {
        self.operations = Some(operations);
        self
    }

    /// Finish the builder. Nothing is loaded or opened until `initialize()`.
    pub fn build(self) -> AppResult<Fluidics> {
        let config = self.config.ok_or_else(|| {
            FluidicsError::Configuration("no configuration source given".to_string())
        })?;
        let sequences = self.sequences.ok_or_else(|| {
            FluidicsError::Configuration("no sequence table source given".to_string())
        })?;
        Ok(Fluidics {
            config_source: Some(config),
            sequence_source: Some(sequences),
            mode: self.mode,
            callbacks: self.callbacks,
            custom_operations: self.operations,
            session: None,
            rounds: None,
            run: None,
        })
    }
}

/// Everything `initialize()` produces.
struct Session {
    config: FluidicsConfig,
    sequences: SequenceTable,
    devices: Option<FluidicsDevices>,
    operations: Arc<dyn OperationSet>,
}

/// Background run plus its observation handles.
struct ActiveRun {
    task: Option<JoinHandle<EngineState>>,
    state: StateHandle,
    control: RunControl,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Fluidics system for one configuration and sequence table.
pub struct Fluidics {
    config_source: Option<Source<FluidicsConfig>>,
    sequence_source: Option<Source<SequenceTable>>,
    mode: DeviceMode,
    callbacks: Arc<dyn SequenceCallbacks>,
    custom_operations: Option<Arc<dyn OperationSet>>,
    session: Option<Session>,
    rounds: Option<RoundMapping>,
    run: Option<ActiveRun>,
}

impl Fluidics {
    /// Start building a fluidics system.
    pub fn builder() -> FluidicsBuilder {
        FluidicsBuilder::default()
    }

    /// Fluidics from a configuration file and a sequence file.
    ///
    /// `simulation` selects instant simulated devices instead of hardware.
    pub fn new(
        config_path: impl Into<PathBuf>,
        sequence_path: impl Into<PathBuf>,
        simulation: bool,
    ) -> Self {
        let mode = if simulation {
            DeviceMode::Simulated(SimulationOptions::instant())
        } else {
            DeviceMode::Hardware
        };
        Self {
            config_source: Some(Source::Path(config_path.into())),
            sequence_source: Some(Source::Path(sequence_path.into())),
            mode,
            callbacks: Arc::new(LoggingCallbacks),
            custom_operations: None,
            session: None,
            rounds: None,
            run: None,
        }
    }

    /// Load configuration and sequences, bring up the devices and build the operation set.
    ///
    /// Setup errors are returned directly; no callback fires. Calling this again
    /// after a successful initialization does nothing.
    pub async fn initialize(&mut self) -> AppResult<()> {
        if self.session.is_some() {
            debug!("Fluidics already initialized");
            return Ok(());
        }

        let config = match &self.config_source {
            Some(Source::Path(path)) => FluidicsConfig::load_from(path),
            Some(Source::Value(config)) => config.validate().map(|_| config.clone()),
            None => Err(FluidicsError::NotInitialized),
        }?;
        let sequences = match &self.sequence_source {
            Some(Source::Path(path)) => SequenceTable::from_csv_path(path),
            Some(Source::Value(table)) => Ok(table.clone()),
            None => Err(FluidicsError::NotInitialized),
        }?;

        let devices = build_devices(&config, &self.mode).await?;
        let operations = match &self.custom_operations {
            Some(operations) => operations.clone(),
            None => match build_operation_set(&config, &devices) {
                Ok(operations) => operations,
                Err(e) => {
                    devices.shutdown().await;
                    return Err(e);
                }
            },
        };

        info!(
            application = %config.application_type(),
            family = operations.family(),
            rows = sequences.len(),
            active = sequences.active_len(),
            simulated = self.mode.is_simulated(),
            "Fluidics initialized"
        );
        self.session = Some(Session {
            config,
            sequences,
            devices: Some(devices),
            operations,
        });
        Ok(())
    }

    fn session(&self) -> AppResult<&Session> {
        self.session.as_ref().ok_or(FluidicsError::NotInitialized)
    }

    /// Start the included rows, optionally limited to `section`, in the background.
    ///
    /// Returns the run id as soon as the task is spawned. Must be called inside a
    /// Tokio runtime.
    pub fn run_sequences(&mut self, section: Option<RunSection>) -> AppResult<Uuid> {
        if self.is_running() {
            return Err(FluidicsError::RunInProgress);
        }
        let session = self.session()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FluidicsError::EngineTask(e.to_string()))?;

        let rows = session.sequences.active_rows(section);
        let operations = session.operations.clone();
        let engine_config = session.config.engine.clone();
        let callbacks = self.callbacks.clone();

        let engine = SequenceEngine::new(rows.len(), RunControl::new());
        let state = engine.state();
        let control = engine.control();
        let run_id = state.snapshot().run_id;

        info!(%run_id, rows = rows.len(), ?section, "Starting sequence run");
        let task = runtime.spawn(async move {
            engine
                .run(operations.as_ref(), &rows, &engine_config, callbacks.as_ref())
                .await
        });

        self.run = Some(ActiveRun {
            task: Some(task),
            state,
            control,
        });
        Ok(run_id)
    }

    /// Run the rows that precede imaging in each round.
    pub fn run_before_imaging(&mut self) -> AppResult<Uuid> {
        let split = self.session()?.config.imaging.sequences_before_imaging;
        self.run_sequences(Some(RunSection::new(0, split)))
    }

    /// Run the rows that follow imaging in each round.
    pub fn run_after_imaging(&mut self) -> AppResult<Uuid> {
        let session = self.session()?;
        let split = session.config.imaging.sequences_before_imaging;
        let end = session.sequences.active_len();
        self.run_sequences(Some(RunSection::new(split, end)))
    }

    /// Wait until the background run reaches a terminal state.
    ///
    /// Returns `None` right away when no run was started.
    pub async fn wait_for_completion(&mut self) -> AppResult<Option<EngineState>> {
        let Some(task) = self.run.as_mut().and_then(|run| run.task.take()) else {
            return Ok(None);
        };
        let state = task
            .await
            .map_err(|e| FluidicsError::EngineTask(e.to_string()))?;
        info!(run_id = %state.run_id, status = %state.status, "Sequence run finished");
        Ok(Some(state))
    }

    /// True while a background run is executing.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(ActiveRun::is_running)
    }

    /// Snapshot of the current or most recent run.
    pub fn status(&self) -> Option<EngineState> {
        self.run.as_ref().map(|run| run.state.snapshot())
    }

    /// Hold the active run before its next row.
    pub fn pause(&self) {
        if let Some(run) = &self.run {
            run.control.pause();
        }
    }

    /// Continue a paused run.
    pub fn resume(&self) {
        if let Some(run) = &self.run {
            run.control.resume();
        }
    }

    /// Stop the active run before its next row.
    pub fn cancel(&self) {
        if let Some(run) = &self.run {
            run.control.cancel();
        }
    }

    /// Supply the reagent port for each round.
    pub fn set_rounds(&mut self, rounds: Vec<u32>) {
        debug!(rounds = ?rounds, "Rounds set");
        self.rounds = Some(RoundMapping::new(rounds));
    }

    /// Point every round-addressable "Flow Probe" row at round `index`'s port.
    ///
    /// Returns the number of rows rewritten. A run already in progress keeps the
    /// rows it started with.
    pub fn update_port(&mut self, index: usize) -> AppResult<usize> {
        let port = self
            .rounds
            .as_ref()
            .ok_or(FluidicsError::RoundsNotSet)?
            .port_for(index)?;
        let session = self.session.as_mut().ok_or(FluidicsError::NotInitialized)?;
        let round_port_max = session.config.selector_valves.round_port_max;
        let rewritten = session.sequences.apply_round(port, round_port_max);
        info!(round = index, port, rewritten, "Round port applied");
        Ok(rewritten)
    }

    /// Run the protocol once per round given to `set_rounds`, or once when no
    /// rounds are set, waiting for each run.
    ///
    /// Stops after the first round that does not complete and returns the final
    /// state of the last round run.
    pub async fn run_rounds(&mut self, section: Option<RunSection>) -> AppResult<Option<EngineState>> {
        let rounds = self.rounds.as_ref().map_or(0, RoundMapping::len);
        let mut last = None;
        for round in 0..rounds.max(1) {
            if rounds > 0 {
                self.update_port(round)?;
            }
            self.run_sequences(section)?;
            let Some(state) = self.wait_for_completion().await? else {
                break;
            };
            let status = state.status;
            last = Some(state);
            if status != RunStatus::Completed {
                warn!(round, %status, "Stopping after unsuccessful round");
                break;
            }
        }
        Ok(last)
    }

    /// Loaded sequence table.
    pub fn sequences(&self) -> Option<&SequenceTable> {
        self.session.as_ref().map(|session| &session.sequences)
    }

    /// Loaded configuration.
    pub fn config(&self) -> Option<&FluidicsConfig> {
        self.session.as_ref().map(|session| &session.config)
    }

    /// Operation set in use.
    pub fn operation_set(&self) -> Option<Arc<dyn OperationSet>> {
        self.session
            .as_ref()
            .map(|session| session.operations.clone())
    }

    /// Release every device. Never fails; release errors are logged.
    ///
    /// An active run is cancelled and allowed to finish its current row first.
    pub async fn cleanup(&mut self) {
        if self.is_running() {
            warn!("Cleanup requested during a run; cancelling after the current row");
            self.cancel();
            if let Err(e) = self.wait_for_completion().await {
                warn!(error = %e, "Run ended abnormally during cleanup");
            }
        }

        let Some(devices) = self.session.as_mut().and_then(|session| session.devices.take())
        else {
            return;
        };
        let failures = devices.shutdown().await;
        if failures.is_empty() {
            info!("Fluidics cleaned up");
        } else {
            warn!(failures = failures.len(), "Fluidics cleaned up with errors");
        }
    }

    /// Initialize, run `body`, then clean up whatever the outcome.
    ///
    /// Cleanup also runs when `body` panics; the panic is resumed afterwards.
    pub async fn scoped<T, F>(mut self, body: F) -> AppResult<T>
    where
        F: for<'a> FnOnce(&'a mut Fluidics) -> BoxFuture<'a, AppResult<T>>,
    {
        if let Err(e) = self.initialize().await {
            self.cleanup().await;
            return Err(e);
        }
        let outcome = AssertUnwindSafe(body(&mut self)).catch_unwind().await;
        self.cleanup().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for Fluidics {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            if run.is_running() {
                warn!("Fluidics dropped during a run; requesting cancellation");
                run.control.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunStatus;
    use crate::hardware::mock::{DeviceEvent, FaultPlan};
    use crate::sequence::SequenceRow;

    fn config() -> FluidicsConfig {
        FluidicsConfig::from_json_str(
            r#"{
                "application": "MERFISH",
                "microcontroller": { "serial_number": "" },
                "syringe_pump": { "serial_number": "", "volume_ul": 1000, "speed_code_limit": 0 },
                "selector_valves": { "valve_ids": [0, 1, 2, 3], "ports_per_valve": 10 },
                "imaging": { "sequences_before_imaging": 2 }
            }"#,
        )
        .unwrap()
    }

    fn table() -> SequenceTable {
        SequenceTable::new(vec![
            SequenceRow::new("Flow Probe", 5).with_flow(200.0, 20.0),
            SequenceRow::new("Wash", 30).with_flow(200.0, 20.0),
            SequenceRow::new("Flow Imaging Buffer", 31).with_flow(100.0, 20.0),
            SequenceRow::new("Image", 0).with_include(false),
        ])
    }

    fn fluidics(options: SimulationOptions) -> Fluidics {
        Fluidics::builder()
            .config(config())
            .sequences(table())
            .simulated(options)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_sources() {
        assert!(Fluidics::builder().config(config()).build().is_err());
        assert!(Fluidics::builder().sequences(table()).build().is_err());
    }

    #[tokio::test]
    async fn operations_before_initialize_fail() {
        let mut fluidics = fluidics(SimulationOptions::instant());
        assert!(matches!(
            fluidics.run_sequences(None),
            Err(FluidicsError::NotInitialized)
        ));
        fluidics.set_rounds(vec![7]);
        assert!(matches!(
            fluidics.update_port(0),
            Err(FluidicsError::NotInitialized)
        ));
        assert!(fluidics.wait_for_completion().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_port_checks_rounds() {
        let mut fluidics = fluidics(SimulationOptions::instant());
        fluidics.initialize().await.unwrap();
        assert!(matches!(fluidics.update_port(0), Err(FluidicsError::RoundsNotSet)));

        fluidics.set_rounds(vec![7, 8, 9]);
        assert!(matches!(
            fluidics.update_port(3),
            Err(FluidicsError::RoundIndexOutOfRange { index: 3, len: 3 })
        ));
        assert_eq!(fluidics.update_port(1).unwrap(), 1);
        let ports: Vec<u32> = fluidics
            .sequences()
            .unwrap()
            .rows()
            .iter()
            .map(|row| row.fluidic_port)
            .collect();
        assert_eq!(ports, vec![8, 30, 31, 0]);
    }

    #[tokio::test]
    async fn imaging_split_runs_each_half() {
        let options = SimulationOptions::instant();
        let log = options.log.clone();
        let mut fluidics = fluidics(options);
        fluidics.initialize().await.unwrap();
        log.clear();

        fluidics.run_before_imaging().unwrap();
        let state = fluidics.wait_for_completion().await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.total_rows, 2);
        assert_eq!(log.dispensed_ul(), 400.0);

        fluidics.run_after_imaging().unwrap();
        let state = fluidics.wait_for_completion().await.unwrap().unwrap();
        assert_eq!(state.total_rows, 1);
        assert_eq!(log.dispensed_ul(), 500.0);
        fluidics.cleanup().await;
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_closes_pump() {
        let options = SimulationOptions::instant();
        let log = options.log.clone();
        let mut fluidics = fluidics(options);
        fluidics.initialize().await.unwrap();

        fluidics.cleanup().await;
        fluidics.cleanup().await;
        let closes = log
            .events()
            .into_iter()
            .filter(|event| *event == DeviceEvent::PumpClosed)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn scoped_cleans_up_after_failure() {
        let options = SimulationOptions::instant().with_faults(FaultPlan::fail_after("aspirate", 0));
        let log = options.log.clone();
        let fluidics = fluidics(options);

        let result: AppResult<Option<EngineState>> = fluidics
            .scoped(|f| {
                Box::pin(async move {
                    f.run_sequences(None)?;
                    f.wait_for_completion().await
                })
            })
            .await;

        let state = result.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(log.events().contains(&DeviceEvent::PumpClosed));
        assert!(log.events().contains(&DeviceEvent::ControllerClosed));
    }

    #[tokio::test]
    async fn scoped_reports_setup_errors() {
        let mut bad = config();
        bad.syringe_pump.volume_ul = 0.0;
        let fluidics = Fluidics::builder()
            .config(bad)
            .sequences(table())
            .simulated(SimulationOptions::instant())
            .build()
            .unwrap();
        let err = fluidics
            .scoped(|_| Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
