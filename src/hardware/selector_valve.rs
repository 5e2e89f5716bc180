//! Selector valve cascade.
//!
//! Rotary valves are chained in `valve_ids` order, the first one feeding the
//! syringe pump. Every valve but the last spends its final position on the link
//! to the next valve, so logical ports are numbered across the chain:
//!
//! ```text
//! valve 0: ports 1..P-1, position P -> valve 1
//! valve 1: ports P..2P-2, position P -> valve 2
//! valve 2: ports 2P-1..3P-1
//! ```

use crate::config::SelectorValveConfig;
use crate::error::{AppResult, FluidicsError};
use crate::hardware::capabilities::{CommandChannel, SelectorValve};
use crate::hardware::protocol::Command;
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One valve move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValvePosition {
    /// Valve address
    pub valve: u8,
    /// 1-based position
    pub position: u8,
}

/// Logical port to valve-chain mapping.
#[derive(Debug, Clone)]
pub struct ValveCascade {
    valve_ids: Vec<u8>,
    ports_per_valve: u32,
}

impl ValveCascade {
    /// Build from configuration.
    pub fn new(config: &SelectorValveConfig) -> Self {
        Self {
            valve_ids: config.valve_ids.clone(),
            ports_per_valve: config.ports_per_valve,
        }
    }

    /// Number of reachable ports.
    pub fn capacity(&self) -> u32 {
        let valves = self.valve_ids.len() as u32;
        if valves == 0 {
            return 0;
        }
        (valves - 1) * (self.ports_per_valve - 1) + self.ports_per_valve
    }

    /// Valve moves routing `port` to the pump, upstream valve first.
    ///
    /// Fails with `InvalidPort` when `port` is outside `1..=capacity()` or a
    /// position does not fit the one-byte valve command.
    pub fn route(&self, port: u32) -> AppResult<Vec<ValvePosition>> {
        let capacity = self.capacity();
        let invalid = || FluidicsError::InvalidPort {
            port,
            min: 1,
            max: capacity,
        };
        if port == 0 || port > capacity {
            return Err(invalid());
        }

        let mut remaining = port - 1;
        let mut moves = Vec::new();
        let last = self.valve_ids.len().saturating_sub(1);
        for (index, valve) in self.valve_ids.iter().enumerate() {
            if index == last || remaining < self.ports_per_valve - 1 {
                moves.push(ValvePosition {
                    valve: *valve,
                    position: u8::try_from(remaining + 1).map_err(|_| invalid())?,
                });
                break;
            }
            moves.push(ValvePosition {
                valve: *valve,
                position: u8::try_from(self.ports_per_valve).map_err(|_| invalid())?,
            });
            remaining -= self.ports_per_valve - 1;
        }
        Ok(moves)
    }
}

/// Selector valve system driven through the microcontroller.
pub struct SelectorValveSystem {
    channel: Arc<dyn CommandChannel>,
    cascade: ValveCascade,
    current: Mutex<Option<u32>>,
}

impl SelectorValveSystem {
    /// Build the cascade on top of a command channel.
    pub fn new(channel: Arc<dyn CommandChannel>, config: &SelectorValveConfig) -> Self {
        Self {
            channel,
            cascade: ValveCascade::new(config),
            current: Mutex::new(None),
        }
    }

    /// Home every valve.
    pub async fn initialize(&self) -> AppResult<()> {
        self.channel.send_command(Command::InitializeValves).await?;
        *self.current.lock().await = None;
        info!(ports = self.cascade.capacity(), "Selector valves initialized");
        Ok(())
    }
}

#[async_trait]
impl SelectorValve for SelectorValveSystem {
    async fn select(&self, port: u32) -> AppResult<()> {
        self.validate_port(port)?;
        let route = self.cascade.route(port)?;
        let mut current = self.current.lock().await;
        for step in route {
            self.channel
                .send_command(Command::SetRotaryValve {
                    valve: step.valve,
                    position: step.position,
                })
                .await?;
        }
        *current = Some(port);
        debug!(port, "Selector valve port active");
        Ok(())
    }

    fn port_range(&self) -> RangeInclusive<u32> {
        1..=self.cascade.capacity()
    }

    async fn current_port(&self) -> Option<u32> {
        *self.current.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluidicsError;
    use crate::hardware::mock::{CommandLog, DeviceEvent, FaultPlan, MockMode, SimulatedController};

    fn cascade(ids: Vec<u8>, ppv: u32) -> ValveCascade {
        ValveCascade::new(&SelectorValveConfig {
            valve_ids: ids,
            ports_per_valve: ppv,
            round_port_max: 24,
        })
    }

    fn pos(valve: u8, position: u8) -> ValvePosition {
        ValvePosition { valve, position }
    }

    #[test]
    fn single_valve_maps_directly() {
        let cascade = cascade(vec![0], 10);
        assert_eq!(cascade.capacity(), 10);
        assert_eq!(cascade.route(10).unwrap(), vec![pos(0, 10)]);
    }

    #[test]
    fn chained_valves_use_link_positions() {
        let cascade = cascade(vec![0, 1, 2], 12);
        assert_eq!(cascade.capacity(), 34);
        assert_eq!(cascade.route(5).unwrap(), vec![pos(0, 5)]);
        assert_eq!(cascade.route(11).unwrap(), vec![pos(0, 11)]);
        assert_eq!(cascade.route(12).unwrap(), vec![pos(0, 12), pos(1, 1)]);
        assert_eq!(cascade.route(23).unwrap(), vec![pos(0, 12), pos(1, 12), pos(2, 1)]);
        assert_eq!(cascade.route(34).unwrap(), vec![pos(0, 12), pos(1, 12), pos(2, 12)]);
        assert!(matches!(
            cascade.route(35),
            Err(FluidicsError::InvalidPort { port: 35, max: 34, .. })
        ));
    }

    #[test]
    fn positions_beyond_a_byte_are_not_truncated() {
        let cascade = cascade(vec![0], 300);
        assert_eq!(cascade.route(255).unwrap(), vec![pos(0, 255)]);
        assert!(matches!(
            cascade.route(260),
            Err(FluidicsError::InvalidPort { port: 260, .. })
        ));

        let chained = self::cascade(vec![0, 1], 300);
        assert!(matches!(
            chained.route(2),
            Ok(moves) if moves == vec![pos(0, 2)]
        ));
        assert!(matches!(
            chained.route(400),
            Err(FluidicsError::InvalidPort { port: 400, .. })
        ));
    }

    #[tokio::test]
    async fn select_sends_moves_in_order() {
        let log = CommandLog::new();
        let controller = Arc::new(SimulatedController::new(
            MockMode::Instant,
            FaultPlan::none(),
            log.clone(),
        ));
        controller.begin().await.unwrap();
        let valves = SelectorValveSystem::new(
            controller,
            &SelectorValveConfig {
                valve_ids: vec![4, 5],
                ports_per_valve: 8,
                round_port_max: 24,
            },
        );

        valves.select(9).await.unwrap();
        assert_eq!(valves.current_port().await, Some(9));
        assert_eq!(
            log.controller_commands(),
            vec![
                Command::SetRotaryValve { valve: 4, position: 8 },
                Command::SetRotaryValve { valve: 5, position: 2 },
            ]
        );
        assert!(matches!(log.events().last(), Some(DeviceEvent::Controller(_))));
    }

    #[tokio::test]
    async fn out_of_range_port_is_rejected_without_moving() {
        let log = CommandLog::new();
        let controller = Arc::new(SimulatedController::new(
            MockMode::Instant,
            FaultPlan::none(),
            log.clone(),
        ));
        controller.begin().await.unwrap();
        let valves = SelectorValveSystem::new(
            controller,
            &SelectorValveConfig {
                valve_ids: vec![0],
                ports_per_valve: 10,
                round_port_max: 10,
            },
        );

        let err = valves.select(11).await.unwrap_err();
        assert!(matches!(
            err,
            FluidicsError::InvalidPort { port: 11, min: 1, max: 10 }
        ));
        assert!(matches!(valves.select(0).await, Err(FluidicsError::InvalidPort { .. })));
        assert!(log.controller_commands().is_empty());
        assert_eq!(valves.current_port().await, None);
    }

    #[tokio::test]
    async fn controller_fault_surfaces_as_hardware_error() {
        let log = CommandLog::new();
        let controller = Arc::new(SimulatedController::new(
            MockMode::Instant,
            FaultPlan::fail_after("set_rotary_valve", 0),
            log,
        ));
        controller.begin().await.unwrap();
        let valves = SelectorValveSystem::new(controller, &SelectorValveConfig::default());

        let err = valves.select(3).await.unwrap_err();
        assert!(err.is_hardware_error());
        assert_eq!(valves.current_port().await, None);
    }
}
