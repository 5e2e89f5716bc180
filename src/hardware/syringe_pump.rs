//! Syringe pump driver.
//!
//! Flow rates are converted to the pump's speed codes through [`SpeedTable`].
//! Codes run from 0 (fastest) to [`SpeedTable::MAX_CODE`] (slowest) and each
//! one fixes the time of a full plunger stroke. `speed_code_limit` is the
//! fastest code the plumbing tolerates; requests beyond it are clamped or
//! rejected according to [`SpeedLimitPolicy`].
//!
//! [`SerialSyringePump`] speaks the OEM ASCII protocol:
//!
//! ```text
//! host:  /1I3S12P1500R\r      select valve 3, speed 12, aspirate 1500 steps, run
//! pump:  /0`\x03\r\n          status byte: 0x20 = ready, low nibble = error code
//! ```

use crate::config::{SpeedLimitPolicy, SyringePumpConfig, TimeoutConfig};
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::{PumpPort, SyringePump};
use crate::hardware::serial::{wrap_shared, DynSerial, SharedPort};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEVICE: &str = "syringe_pump";

/// Plunger steps for a full stroke.
pub const FULL_STROKE_STEPS: u32 = 3000;

/// Seconds per full stroke for each speed code.
const STROKE_SECONDS: [f64; 41] = [
    1.25, 1.30, 1.39, 1.52, 1.71, 1.97, 2.37, 2.77, 3.38, 4.03, // 0-9
    5.0, 6.0, 7.0, 8.0, 9.0, 10.0, // 10-15
    12.0, 14.0, 16.0, 18.0, 20.0, // 16-20
    25.0, 30.0, 35.0, 40.0, 45.0, 50.0, // 21-26
    60.0, 70.0, 80.0, 90.0, 100.0, // 27-31
    120.0, 150.0, 180.0, 200.0, 240.0, 300.0, 400.0, 500.0, 600.0, // 32-40
];

/// Interval between `Q` status polls while the pump is busy.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Speed code chosen for a requested rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSelection {
    /// Pump speed code
    pub code: u8,
    /// Flow produced by `code`
    pub rate_ul_per_s: f64,
    /// Request was faster than the limit and got clamped
    pub clamped: bool,
}

/// Rate to speed-code calibration for one syringe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedTable {
    syringe_volume_ul: f64,
    speed_code_limit: u8,
    policy: SpeedLimitPolicy,
}

impl SpeedTable {
    /// Slowest speed code.
    pub const MAX_CODE: u8 = 40;

    /// Calibration for a syringe of `syringe_volume_ul`.
    pub fn new(syringe_volume_ul: f64, speed_code_limit: u8, policy: SpeedLimitPolicy) -> Self {
        Self {
            syringe_volume_ul,
            speed_code_limit: speed_code_limit.min(Self::MAX_CODE),
            policy,
        }
    }

    /// Calibration from the pump configuration.
    pub fn from_config(config: &SyringePumpConfig) -> Self {
        Self::new(
            config.volume_ul,
            config.speed_code_limit,
            config.speed_limit_policy,
        )
    }

    /// Flow rate of a speed code in microliters per second.
    pub fn rate_for_code(&self, code: u8) -> f64 {
        let index = usize::from(code.min(Self::MAX_CODE));
        self.syringe_volume_ul / STROKE_SECONDS[index]
    }

    /// Fastest permitted rate.
    pub fn max_rate(&self) -> f64 {
        self.rate_for_code(self.speed_code_limit)
    }

    /// Pick the fastest code not faster than `rate_ul_per_s`.
    ///
    /// Rates slower than the slowest code run at the slowest code.
    pub fn select(&self, rate_ul_per_s: f64) -> AppResult<SpeedSelection> {
        if !(rate_ul_per_s.is_finite() && rate_ul_per_s > 0.0) {
            return Err(FluidicsError::InvalidParameter(format!(
                "flow rate must be positive, got {} uL/s",
                rate_ul_per_s
            )));
        }

        let limit = self.max_rate();
        if rate_ul_per_s > limit {
            return match self.policy {
                SpeedLimitPolicy::Reject => Err(FluidicsError::SpeedOutOfRange {
                    requested_ul_per_s: rate_ul_per_s,
                    limit_ul_per_s: limit,
                }),
                SpeedLimitPolicy::Clamp => Ok(SpeedSelection {
                    code: self.speed_code_limit,
                    rate_ul_per_s: limit,
                    clamped: true,
                }),
            };
        }

        let code = (self.speed_code_limit..=Self::MAX_CODE)
            .find(|code| self.rate_for_code(*code) <= rate_ul_per_s)
            .unwrap_or(Self::MAX_CODE);
        Ok(SpeedSelection {
            code,
            rate_ul_per_s: self.rate_for_code(code),
            clamped: false,
        })
    }

    /// Plunger steps for a volume.
    pub fn steps_for_volume(&self, volume_ul: f64) -> u32 {
        let steps = (volume_ul / self.syringe_volume_ul * f64::from(FULL_STROKE_STEPS)).round();
        (steps.max(0.0) as u32).min(FULL_STROKE_STEPS)
    }

    /// Volume moved by `steps`.
    pub fn volume_for_steps(&self, steps: u32) -> f64 {
        f64::from(steps) / f64::from(FULL_STROKE_STEPS) * self.syringe_volume_ul
    }
}

/// Room left in the syringe must cover `volume_ul`.
pub(crate) fn check_aspirate(
    table: &SpeedTable,
    contents_ul: f64,
    volume_ul: f64,
) -> AppResult<()> {
    if !(volume_ul.is_finite() && volume_ul >= 0.0)
        || contents_ul + volume_ul > table.syringe_volume_ul + f64::EPSILON
    {
        return Err(FluidicsError::VolumeOutOfRange {
            requested_ul: volume_ul,
            capacity_ul: table.syringe_volume_ul - contents_ul,
        });
    }
    Ok(())
}

/// The syringe must hold at least `volume_ul`.
pub(crate) fn check_dispense(contents_ul: f64, volume_ul: f64) -> AppResult<()> {
    if !(volume_ul.is_finite() && volume_ul >= 0.0) || volume_ul > contents_ul + 1e-6 {
        return Err(FluidicsError::VolumeOutOfRange {
            requested_ul: volume_ul,
            capacity_ul: contents_ul,
        });
    }
    Ok(())
}

/// Decode a pump error code.
fn describe_error(code: u8) -> &'static str {
    match code {
        1 => "initialization error",
        2 => "invalid command",
        3 => "invalid operand",
        6 => "EEPROM failure",
        7 => "device not initialized",
        9 => "plunger overload",
        10 => "valve overload",
        11 => "plunger move not allowed",
        15 => "command overflow",
        _ => "unknown error",
    }
}

struct PumpState {
    plunger_steps: u32,
    port: Option<PumpPort>,
    closed: bool,
}

/// Syringe pump on a serial line.
pub struct SerialSyringePump {
    port: Mutex<Option<SharedPort>>,
    state: Mutex<PumpState>,
    table: SpeedTable,
    config: SyringePumpConfig,
    ready_timeout: Duration,
}

impl SerialSyringePump {
    /// Wrap an open serial stream. Call [`SerialSyringePump::initialize`] before use.
    pub fn new(port: DynSerial, config: &SyringePumpConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            port: Mutex::new(Some(wrap_shared(port))),
            state: Mutex::new(PumpState {
                plunger_steps: 0,
                port: None,
                closed: false,
            }),
            table: SpeedTable::from_config(config),
            config: config.clone(),
            ready_timeout: Duration::from_millis(timeouts.pump_ready_ms),
        }
    }

    /// Open by USB serial number and home the plunger.
    #[cfg(feature = "serial")]
    pub async fn open(config: &SyringePumpConfig, timeouts: &TimeoutConfig) -> AppResult<Self> {
        let port = crate::hardware::serial::open_by_serial_number(
            &config.serial_number,
            config.baud_rate,
            DEVICE,
        )
        .await?;
        let pump = Self::new(port, config, timeouts);
        pump.initialize().await?;
        Ok(pump)
    }

    /// Home the plunger, pushing any contents to waste.
    pub async fn initialize(&self) -> AppResult<()> {
        self.execute(&format!("Z{}", self.config.waste_port)).await?;
        let mut state = self.state.lock().await;
        state.plunger_steps = 0;
        state.port = Some(PumpPort::Waste);
        info!(capacity_ul = self.table.syringe_volume_ul, "Syringe pump initialized");
        Ok(())
    }

    fn valve_number(&self, port: PumpPort) -> u8 {
        match port {
            PumpPort::Reagent => self.config.reagent_port,
            PumpPort::Chamber => self.config.chamber_port,
            PumpPort::Waste => self.config.waste_port,
        }
    }

    /// Send one command string and wait until the pump is ready again.
    async fn execute(&self, body: &str) -> AppResult<()> {
        let guard = self.port.lock().await;
        let port = guard
            .as_ref()
            .ok_or_else(|| FluidicsError::hardware(DEVICE, "pump is closed"))?;
        let mut io = port.lock().await;

        debug!(command = body, "Syringe pump command");
        io.get_mut()
            .write_all(format!("/1{}R\r", body).as_bytes())
            .await?;
        io.get_mut().flush().await?;

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        let mut status = self.read_status(&mut io, deadline).await?;
        while !status.ready {
            tokio::time::sleep(POLL_INTERVAL).await;
            io.get_mut().write_all(b"/1Q\r").await?;
            io.get_mut().flush().await?;
            status = self.read_status(&mut io, deadline).await?;
        }
        Ok(())
    }

    async fn read_status(
        &self,
        io: &mut tokio::io::BufReader<DynSerial>,
        deadline: tokio::time::Instant,
    ) -> AppResult<PumpStatus> {
        let timeout_ms = self.ready_timeout.as_millis() as u64;
        let mut line = Vec::new();
        match tokio::time::timeout_at(deadline, io.read_until(b'\n', &mut line)).await {
            Ok(Ok(0)) => {
                return Err(FluidicsError::hardware(DEVICE, "serial line closed"));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(FluidicsError::timeout(DEVICE, "ready", timeout_ms)),
        }
        let status = PumpStatus::parse(&line)?;
        if status.error_code != 0 {
            return Err(FluidicsError::hardware(
                DEVICE,
                format!(
                    "error {} ({})",
                    status.error_code,
                    describe_error(status.error_code)
                ),
            ));
        }
        Ok(status)
    }

    async fn move_plunger(&self, aspirate: bool, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()> {
        let speed = self.table.select(rate_ul_per_s)?;
        if speed.clamped {
            warn!(
                requested_ul_per_s = rate_ul_per_s,
                limit_ul_per_s = speed.rate_ul_per_s,
                "Flow rate clamped to pump speed limit"
            );
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FluidicsError::hardware(DEVICE, "pump is closed"));
        }
        let contents = self.table.volume_for_steps(state.plunger_steps);
        let steps = self.table.steps_for_volume(volume_ul);
        let command = if aspirate {
            check_aspirate(&self.table, contents, volume_ul)?;
            format!("S{}P{}", speed.code, steps)
        } else {
            check_dispense(contents, volume_ul)?;
            format!("S{}D{}", speed.code, steps.min(state.plunger_steps))
        };
        self.execute(&command).await?;

        state.plunger_steps = if aspirate {
            (state.plunger_steps + steps).min(FULL_STROKE_STEPS)
        } else {
            state.plunger_steps.saturating_sub(steps)
        };
        Ok(())
    }
}

/// Parsed status reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PumpStatus {
    ready: bool,
    error_code: u8,
}

impl PumpStatus {
    const READY_BIT: u8 = 0x20;

    /// Parse `/0<status>[data]\x03\r\n`.
    fn parse(line: &[u8]) -> AppResult<Self> {
        let start = line
            .iter()
            .position(|b| *b == b'/')
            .ok_or_else(|| FluidicsError::hardware(DEVICE, "reply missing start character"))?;
        let status = *line.get(start + 2).ok_or_else(|| {
            FluidicsError::hardware(
                DEVICE,
                format!("truncated reply: {:?}", String::from_utf8_lossy(line)),
            )
        })?;
        Ok(Self {
            ready: status & Self::READY_BIT != 0,
            error_code: status & 0x0F,
        })
    }
}

#[async_trait]
impl SyringePump for SerialSyringePump {
    fn capacity_ul(&self) -> f64 {
        self.table.syringe_volume_ul
    }

    async fn contents_ul(&self) -> AppResult<f64> {
        let state = self.state.lock().await;
        Ok(self.table.volume_for_steps(state.plunger_steps))
    }

    async fn select_port(&self, port: PumpPort) -> AppResult<()> {
        {
            let state = self.state.lock().await;
            if state.port == Some(port) {
                return Ok(());
            }
        }
        self.execute(&format!("I{}", self.valve_number(port))).await?;
        self.state.lock().await.port = Some(port);
        debug!(%port, "Pump valve switched");
        Ok(())
    }

    async fn aspirate(&self, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()> {
        self.move_plunger(true, volume_ul, rate_ul_per_s).await
    }

    async fn dispense(&self, volume_ul: f64, rate_ul_per_s: f64) -> AppResult<()> {
        self.move_plunger(false, volume_ul, rate_ul_per_s).await
    }

    async fn close(&self) -> AppResult<()> {
        self.state.lock().await.closed = true;
        if let Some(port) = self.port.lock().await.take() {
            let mut io = port.lock().await;
            io.get_mut().shutdown().await?;
            info!("Syringe pump closed");
        }
        Ok(())
    }
}
