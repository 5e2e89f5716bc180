//! Simulated fluidics hardware.
//!
//! The simulated devices implement the same capability traits as the real
//! drivers. Valves and the disc pump are simulated one level down: the real
//! [`SelectorValveSystem`](super::selector_valve::SelectorValveSystem) and
//! [`DiscPump`](super::disc_pump::DiscPump) run on top of a [`SimulatedController`].
//!
//! - [`MockMode::Instant`]: zero delays, deterministic, for unit tests
//! - [`MockMode::Realistic`]: sleeps matching volume/rate and valve switching
//!
//! Every simulated device appends to a shared [`CommandLog`], so tests can assert
//! on the exact order in which the fluid path was driven. Failures are injected
//! with a [`FaultPlan`].

use crate::config::{SpeedLimitPolicy, SyringePumpConfig};
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::{CommandChannel, PumpPort, SyringePump, TemperatureControl};
use crate::hardware::protocol::{Command, ExecutionStatus, Response};
use crate::hardware::syringe_pump::{check_aspirate, check_dispense, SpeedTable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Valve switching time in realistic mode.
const VALVE_SWITCH_TIME: Duration = Duration::from_millis(250);
/// Valve homing time in realistic mode.
const VALVE_HOMING_TIME: Duration = Duration::from_secs(1);
/// Temperature ramp in realistic mode (degrees C per second).
const TEMPERATURE_RAMP_C_PER_S: f64 = 0.5;
/// Starting temperature of the simulated controller.
const AMBIENT_C: f64 = 22.0;

/// Operational modes for simulated devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for dry runs and integration tests
    Realistic,
}

// =============================================================================
// Command log
// =============================================================================

/// One recorded device action
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Controller link opened
    ControllerBegin,
    /// Command accepted by the controller
    Controller(Command),
    /// Controller link closed
    ControllerClosed,
    /// Syringe pump valve switched
    PumpPort(PumpPort),
    /// Syringe pump drew fluid
    Aspirate {
        /// Volume in microliters
        volume_ul: f64,
        /// Effective rate after speed-code selection
        rate_ul_per_s: f64,
    },
    /// Syringe pump pushed fluid
    Dispense {
        /// Volume in microliters
        volume_ul: f64,
        /// Effective rate after speed-code selection
        rate_ul_per_s: f64,
    },
    /// Syringe pump released
    PumpClosed,
    /// Temperature setpoint changed
    Setpoint(f64),
}

/// Shared, append-only record of simulated device actions.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
}

impl CommandLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn record(&self, event: DeviceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Snapshot of all events.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commands accepted by the controller, in order.
    pub fn controller_commands(&self) -> Vec<Command> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DeviceEvent::Controller(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Total volume dispensed so far.
    pub fn dispensed_ul(&self) -> f64 {
        self.events()
            .iter()
            .map(|event| match event {
                DeviceEvent::Dispense { volume_ul, .. } => *volume_ul,
                _ => 0.0,
            })
            .sum()
    }

    /// Forget all events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// =============================================================================
// Fault injection
// =============================================================================

/// Failure scenario for a simulated operation
#[derive(Debug, Clone)]
pub enum FaultScenario {
    /// Fail with a device fault after `count` successful calls
    FailAfterN {
        /// Operation name (e.g. "aspirate", "set_rotary_valve")
        operation: &'static str,
        /// Successful calls before failing
        count: u32,
    },
    /// Stop acknowledging after `count` successful calls
    TimeoutAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before timing out
        count: u32,
    },
}

impl FaultScenario {
    fn operation(&self) -> &'static str {
        match self {
            FaultScenario::FailAfterN { operation, .. }
            | FaultScenario::TimeoutAfterN { operation, .. } => operation,
        }
    }

    fn count(&self) -> u32 {
        match self {
            FaultScenario::FailAfterN { count, .. } | FaultScenario::TimeoutAfterN { count, .. } => {
                *count
            }
        }
    }
}

/// Fault injection plan shared by simulated devices
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    scenarios: Arc<Vec<FaultScenario>>,
    counts: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl FaultPlan {
    /// No failures.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fail `operation` after `count` successful calls.
    pub fn fail_after(operation: &'static str, count: u32) -> Self {
        Self::scenarios(vec![FaultScenario::FailAfterN { operation, count }])
    }

    /// Time out `operation` after `count` successful calls.
    pub fn timeout_after(operation: &'static str, count: u32) -> Self {
        Self::scenarios(vec![FaultScenario::TimeoutAfterN { operation, count }])
    }

    /// Plan with several scenarios.
    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            counts: Arc::default(),
        }
    }

    /// Count a call to `operation` and return the injected error, if any.
    pub fn check(&self, device: &str, operation: &'static str) -> AppResult<()> {
        let Some(scenario) = self.scenarios.iter().find(|s| s.operation() == operation) else {
            return Ok(());
        };

        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let calls = counts.entry(operation).or_insert(0);
        *calls += 1;
        if *calls <= scenario.count() {
            return Ok(());
        }

        warn!(device, operation, calls = *calls, "Injecting simulated fault");
        Err(match scenario {
            FaultScenario::FailAfterN { count, .. } => FluidicsError::hardware(
                device,
                format!("injected fault on '{}' after {} calls", operation, count),
            ),
            FaultScenario::TimeoutAfterN { .. } => FluidicsError::timeout(device, operation, 0),
        })
    }
}

// =============================================================================
// SimulatedController
// =============================================================================

/// Simulated microcontroller.
pub struct SimulatedController {
    mode: MockMode,
    faults: FaultPlan,
    log: CommandLog,
    ready: AtomicBool,
    next_id: AtomicU8,
}

impl SimulatedController {
    /// New controller; call `begin()` before sending commands.
    pub fn new(mode: MockMode, faults: FaultPlan, log: CommandLog) -> Self {
        Self {
            mode,
            faults,
            log,
            ready: AtomicBool::new(false),
            next_id: AtomicU8::new(0),
        }
    }
}

#[async_trait]
impl CommandChannel for SimulatedController {
    async fn begin(&self) -> AppResult<()> {
        self.ready.store(true, Ordering::SeqCst);
        self.log.record(DeviceEvent::ControllerBegin);
        debug!("Simulated controller ready");
        Ok(())
    }

    async fn send_command(&self, command: Command) -> AppResult<Response> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(FluidicsError::hardware(
                "microcontroller",
                format!("'{}' sent before begin()", command.name()),
            ));
        }
        self.faults.check("microcontroller", command.name())?;

        if self.mode == MockMode::Realistic {
            match command {
                Command::SetRotaryValve { .. } => tokio::time::sleep(VALVE_SWITCH_TIME).await,
                Command::InitializeValves => tokio::time::sleep(VALVE_HOMING_TIME).await,
                _ => {}
            }
        }

        self.log.record(DeviceEvent::Controller(command));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(id, ExecutionStatus::Completed))
    }

    async fn close(&self) -> AppResult<()> {
        if self.ready.swap(false, Ordering::SeqCst) {
            self.log.record(DeviceEvent::ControllerClosed);
        }
        Ok(())
    }
}

// =============================================================================
// SimulatedSyringePump
// =============================================================================

#[derive(Debug)]
struct SimulatedPumpState {
    contents_ul: f64,
    port: Option<PumpPort>,
    closed: bool,
}

/// Simulated syringe pump with the real pump's volume and speed rules.
pub struct SimulatedSyringePump {
    table: SpeedTable,
    capacity_ul: f64,
    mode: MockMode,
    faults: FaultPlan,
    log: CommandLog,
    state: tokio::sync::Mutex<SimulatedPumpState>,
}

impl SimulatedSyringePump {
    /// Pump calibrated from configuration.
    pub fn new(config: &SyringePumpConfig, mode: MockMode, faults: FaultPlan, log: CommandLog) -> Self {
        Self {
            table: SpeedTable::from_config(config),
            capacity_ul: config.volume_ul,
            mode,
            faults,
            log,
            state: tokio::sync::Mutex::new(SimulatedPumpState {
                contents_ul: 0.0,
                port: None,
                closed: false,
            }),
        }
    }

    /// Pump with explicit capacity and speed limit.
    pub fn with_capacity(
        capacity_ul: f64,
        speed_code_limit: u8,
        policy: SpeedLimitPolicy,
        log: CommandLog,
    ) -> Self {
        Self {
            table: SpeedTable::new(capacity_ul, speed_code_limit, policy),
            capacity_ul,
            mode: MockMode::Instant,
            faults: FaultPlan::none(),
            log,
            state: tokio::sync::Mutex::new(SimulatedPumpState {
                contents_ul: 0.0,
                port: None,
                closed: false,
            }),
        }
    }

    async fn travel(&self, volume_ul: f64, rate_ul_per_s: f64) {
        if self.mode == MockMode::Realistic && rate_ul_per_s > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(volume_ul / rate_ul_per_s)).await;
        }
    }
}

#[async_trait]
impl SyringePump for SimulatedSyringePump {
    fn capacity_ul(&self) -> f64 {
        self.capacity_ul
    }

    async fn contents_ul(&self) -> AppResult<f64> {
        Ok(self.state.lock().await.contents_ul)
    }

    async fn select_port(&self, port: PumpPort) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FluidicsError::hardware("syringe_pump", "pump is closed"));
        }
        self.faults.check("syringe_pump", "select_port")?;
        state.port = Some(port);
        self.log.record(DeviceEvent::PumpPort(port));
        Ok(())
    }

    async fn aspirate(&self, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FluidicsError::hardware("syringe_pump", "pump is closed"));
        }
        let speed = self.table.select(rate_ul_per_s)?;
        check_aspirate(&self.table, state.contents_ul, volume_ul)?;
        self.faults.check("syringe_pump", "aspirate")?;

        self.travel(volume_ul, speed.rate_ul_per_s).await;
        state.contents_ul += volume_ul;
        self.log.record(DeviceEvent::Aspirate {
            volume_ul,
            rate_ul_per_s: speed.rate_ul_per_s,
        });
        Ok(())
    }

    async fn dispense(&self, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FluidicsError::hardware("syringe_pump", "pump is closed"));
        }
        let speed = self.table.select(rate_ul_per_s)?;
        check_dispense(state.contents_ul, volume_ul)?;
        self.faults.check("syringe_pump", "dispense")?;

        self.travel(volume_ul, speed.rate_ul_per_s).await;
        state.contents_ul = (state.contents_ul - volume_ul).max(0.0);
        self.log.record(DeviceEvent::Dispense {
            volume_ul,
            rate_ul_per_s: speed.rate_ul_per_s,
        });
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            self.log.record(DeviceEvent::PumpClosed);
        }
        Ok(())
    }
}

// =============================================================================
// SimulatedTemperatureController
// =============================================================================

#[derive(Debug)]
struct ThermalState {
    temperature_c: f64,
    setpoint_c: Option<f64>,
    updated_at: tokio::time::Instant,
}

/// Simulated temperature controller that ramps toward its setpoint.
pub struct SimulatedTemperatureController {
    mode: MockMode,
    faults: FaultPlan,
    log: CommandLog,
    state: Mutex<ThermalState>,
}

impl SimulatedTemperatureController {
    /// Controller starting at ambient temperature.
    pub fn new(mode: MockMode, faults: FaultPlan, log: CommandLog) -> Self {
        Self {
            mode,
            faults,
            log,
            state: Mutex::new(ThermalState {
                temperature_c: AMBIENT_C,
                setpoint_c: None,
                updated_at: tokio::time::Instant::now(),
            }),
        }
    }

    fn advance(&self, state: &mut ThermalState) {
        let now = tokio::time::Instant::now();
        if let Some(target) = state.setpoint_c {
            match self.mode {
                MockMode::Instant => state.temperature_c = target,
                MockMode::Realistic => {
                    let elapsed = now.duration_since(state.updated_at).as_secs_f64();
                    let step = TEMPERATURE_RAMP_C_PER_S * elapsed;
                    let delta = target - state.temperature_c;
                    state.temperature_c += delta.clamp(-step, step);
                }
            }
        }
        state.updated_at = now;
    }
}

#[async_trait]
impl TemperatureControl for SimulatedTemperatureController {
    async fn set_setpoint(&self, celsius: f64) -> AppResult<()> {
        self.faults.check("temperature_controller", "set_setpoint")?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.advance(&mut state);
        state.setpoint_c = Some(celsius);
        self.log.record(DeviceEvent::Setpoint(celsius));
        Ok(())
    }

    async fn read_temperature(&self) -> AppResult<f64> {
        self.faults.check("temperature_controller", "read_temperature")?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.advance(&mut state);
        Ok(state.temperature_c)
    }
}
