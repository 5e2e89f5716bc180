//! Disc pump driven through the microcontroller.

use crate::config::DiscPumpConfig;
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::{CommandChannel, DiscPumpControl};
use crate::hardware::protocol::Command;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Time the disc pump needs to move `volume_ul` at `power` percent.
///
/// `flow_ul_per_s_at_max` scales linearly with power up to `max_power`.
pub fn circulation_time(config: &DiscPumpConfig, volume_ul: f64, power: u8) -> AppResult<Duration> {
    let effective = power.min(config.max_power);
    let flow = if config.max_power == 0 {
        0.0
    } else {
        config.flow_ul_per_s_at_max * f64::from(effective) / f64::from(config.max_power)
    };
    if flow <= 0.0 {
        return Err(FluidicsError::InvalidParameter(format!(
            "disc pump moves no fluid at power {}",
            power
        )));
    }
    Ok(Duration::from_secs_f64(volume_ul.max(0.0) / flow))
}

/// Disc pump for continuous circulation.
pub struct DiscPump {
    channel: Arc<dyn CommandChannel>,
    config: DiscPumpConfig,
}

impl DiscPump {
    /// Disc pump on top of a command channel.
    pub fn new(channel: Arc<dyn CommandChannel>, config: &DiscPumpConfig) -> Self {
        Self {
            channel,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl DiscPumpControl for DiscPump {
    async fn start(&self, power: u8) -> AppResult<()> {
        if power > 100 {
            return Err(FluidicsError::InvalidParameter(format!(
                "disc pump power must be 0-100, got {}",
                power
            )));
        }
        let power = power.min(self.config.max_power);
        self.channel
            .send_command(Command::SetDiscPumpPower { power })
            .await?;
        debug!(power, "Disc pump running");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.channel
            .send_command(Command::SetDiscPumpPower { power: 0 })
            .await?;
        debug!("Disc pump stopped");
        Ok(())
    }
}
