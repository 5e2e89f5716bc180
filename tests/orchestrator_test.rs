//! Orchestrator behavior against a recording operation set and simulated devices.

use async_trait::async_trait;
use rust_fluidics::engine::{ChannelCallbacks, EngineEvent, ProgressStatus, RunStatus, TimeEstimate};
use rust_fluidics::hardware::mock::{DeviceEvent, FaultPlan};
use rust_fluidics::operations::{OperationKind, OperationParams, OperationRegistry, OperationSet};
use rust_fluidics::{
    AppResult, Fluidics, FluidicsConfig, FluidicsError, SequenceRow, SequenceTable,
    SimulationOptions,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// Records `(operation, port)` per executed row; fails on `fail_on_port`.
struct RecordingOperations {
    registry: OperationRegistry,
    calls: Mutex<Vec<(OperationKind, u32)>>,
    fail_on_port: Option<u32>,
}

impl RecordingOperations {
    fn new(fail_on_port: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            registry: OperationRegistry::new(
                "Recording",
                &[
                    ("Flow Probe", OperationKind::Flow),
                    ("Wash", OperationKind::Wash),
                    ("Image", OperationKind::Incubate),
                ],
            ),
            calls: Mutex::new(Vec::new()),
            fail_on_port,
        })
    }

    fn calls(&self) -> Vec<(OperationKind, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperationSet for RecordingOperations {
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
        if Some(params.port) == self.fail_on_port {
            return Err(FluidicsError::hardware("selector_valve", "no acknowledgement"));
        }
        self.calls.lock().unwrap().push((kind, params.port));
        Ok(())
    }
}

fn config() -> FluidicsConfig {
    FluidicsConfig::from_json_str(
        r#"{
            "application": "MERFISH",
            "microcontroller": { "serial_number": "" },
            "syringe_pump": { "serial_number": "", "volume_ul": 5000, "speed_code_limit": 10 },
            "selector_valves": { "valve_ids": [0, 1, 2, 3], "ports_per_valve": 10 }
        }"#,
    )
    .unwrap()
}

fn scenario_table() -> SequenceTable {
    SequenceTable::new(vec![
        SequenceRow::new("Flow Probe", 5).with_flow(500.0, 10.0),
        SequenceRow::new("Wash", 30).with_flow(1000.0, 20.0),
        SequenceRow::new("Image", 0).with_include(false),
    ])
}

fn fluidics_with(
    table: SequenceTable,
    operations: Arc<RecordingOperations>,
) -> (Fluidics, UnboundedReceiver<EngineEvent>) {
    let (callbacks, events) = ChannelCallbacks::channel();
    let fluidics = Fluidics::builder()
        .config(config())
        .sequences(table)
        .simulated(SimulationOptions::instant())
        .callbacks(Arc::new(callbacks))
        .operation_set(operations)
        .build()
        .unwrap();
    (fluidics, events)
}

fn drain(events: &mut UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn progress(events: &[EngineEvent]) -> Vec<(usize, String, ProgressStatus)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Progress {
                index,
                sequence_name,
                status,
            } => Some((*index, sequence_name.clone(), *status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn excluded_rows_never_execute() {
    let operations = RecordingOperations::new(None);
    let (mut fluidics, mut events) = fluidics_with(scenario_table(), operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics.run_sequences(None).unwrap();
    let state = fluidics.wait_for_completion().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    assert_eq!(
        operations.calls(),
        vec![(OperationKind::Flow, 5), (OperationKind::Wash, 30)]
    );

    let events = drain(&mut events);
    assert_eq!(
        events.first(),
        Some(&EngineEvent::Estimate(TimeEstimate {
            total_time_s: 100.0,
            sequence_count: 2,
        }))
    );
    assert_eq!(
        progress(&events),
        vec![
            (0, "Flow Probe".to_string(), ProgressStatus::Completed),
            (1, "Wash".to_string(), ProgressStatus::Completed),
        ]
    );
    let finished = events
        .iter()
        .filter(|event| **event == EngineEvent::Finished)
        .count();
    assert_eq!(finished, 1);
    fluidics.cleanup().await;
}

#[tokio::test]
async fn empty_table_estimates_zero_then_finishes() {
    let operations = RecordingOperations::new(None);
    let table = SequenceTable::new(vec![SequenceRow::new("Image", 0).with_include(false)]);
    let (mut fluidics, mut events) = fluidics_with(table, operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics.run_sequences(None).unwrap();
    let state = fluidics.wait_for_completion().await.unwrap().unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(operations.calls().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![
            EngineEvent::Estimate(TimeEstimate {
                total_time_s: 0.0,
                sequence_count: 0,
            }),
            EngineEvent::Finished,
        ]
    );
}

#[tokio::test]
async fn round_remaps_only_low_flow_probe_ports() {
    let operations = RecordingOperations::new(None);
    let (mut fluidics, _events) = fluidics_with(scenario_table(), operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics.set_rounds(vec![7, 8, 9]);
    fluidics.update_port(1).unwrap();
    fluidics.run_sequences(None).unwrap();
    fluidics.wait_for_completion().await.unwrap();

    assert_eq!(
        operations.calls(),
        vec![(OperationKind::Flow, 8), (OperationKind::Wash, 30)]
    );

    fluidics.update_port(2).unwrap();
    let ports: Vec<u32> = fluidics
        .sequences()
        .unwrap()
        .rows()
        .iter()
        .map(|row| row.fluidic_port)
        .collect();
    assert_eq!(ports, vec![9, 30, 0]);
}

#[tokio::test]
async fn flow_probe_above_round_range_keeps_its_port() {
    let operations = RecordingOperations::new(None);
    let table = SequenceTable::new(vec![
        SequenceRow::new("Flow Probe", 24),
        SequenceRow::new("Flow Probe", 25),
    ]);
    let (mut fluidics, _events) = fluidics_with(table, operations);
    fluidics.initialize().await.unwrap();

    fluidics.set_rounds(vec![3]);
    assert_eq!(fluidics.update_port(0).unwrap(), 1);
    let ports: Vec<u32> = fluidics
        .sequences()
        .unwrap()
        .rows()
        .iter()
        .map(|row| row.fluidic_port)
        .collect();
    assert_eq!(ports, vec![3, 25]);
}

#[tokio::test]
async fn run_rounds_remaps_each_round_in_turn() {
    let operations = RecordingOperations::new(None);
    let (mut fluidics, _events) = fluidics_with(scenario_table(), operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics.set_rounds(vec![7, 8]);
    let state = fluidics.run_rounds(None).await.unwrap().unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(
        operations.calls(),
        vec![
            (OperationKind::Flow, 7),
            (OperationKind::Wash, 30),
            (OperationKind::Flow, 8),
            (OperationKind::Wash, 30),
        ]
    );
}

#[tokio::test]
async fn run_rounds_stops_at_first_failed_round() {
    let operations = RecordingOperations::new(Some(8));
    let (mut fluidics, _events) = fluidics_with(scenario_table(), operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics.set_rounds(vec![7, 8, 9]);
    let state = fluidics.run_rounds(None).await.unwrap().unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(
        operations.calls(),
        vec![(OperationKind::Flow, 7), (OperationKind::Wash, 30)]
    );
}

#[tokio::test]
async fn run_rounds_without_rounds_runs_once_unmapped() {
    let operations = RecordingOperations::new(None);
    let (mut fluidics, _events) = fluidics_with(scenario_table(), operations.clone());
    fluidics.initialize().await.unwrap();

    let state = fluidics.run_rounds(None).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(
        operations.calls(),
        vec![(OperationKind::Flow, 5), (OperationKind::Wash, 30)]
    );
}

#[tokio::test]
async fn run_rounds_propagates_remap_errors() {
    let operations = RecordingOperations::new(None);
    let (mut fluidics, _events) = fluidics_with(scenario_table(), operations.clone());

    fluidics.set_rounds(vec![7]);
    let err = fluidics.run_rounds(None).await.unwrap_err();
    assert!(matches!(err, FluidicsError::NotInitialized));
    assert!(operations.calls().is_empty());
    assert!(fluidics.status().is_none());
}

#[tokio::test]
async fn hardware_error_stops_remaining_rows() {
    let operations = RecordingOperations::new(Some(2));
    let table = SequenceTable::new(
        (1..=5)
            .map(|port| SequenceRow::new("Wash", port).with_flow(100.0, 10.0))
            .collect(),
    );
    let (mut fluidics, mut events) = fluidics_with(table, operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics.run_sequences(None).unwrap();
    let state = fluidics.wait_for_completion().await.unwrap().unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(operations.calls(), vec![(OperationKind::Wash, 1)]);

    let events = drain(&mut events);
    let errors: Vec<&EngineEvent> = events
        .iter()
        .filter(|event| matches!(event, EngineEvent::Error(_)))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], EngineEvent::Error(m) if m.contains("Wash") && m.contains("no acknowledgement")));
    assert!(!events.contains(&EngineEvent::Finished));
    assert_eq!(
        progress(&events).last(),
        Some(&(1, "Wash".to_string(), ProgressStatus::Error))
    );
    assert_eq!(fluidics.status().unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn section_limits_the_run() {
    let operations = RecordingOperations::new(None);
    let table = SequenceTable::new(
        (1..=5)
            .map(|port| SequenceRow::new("Wash", port).with_include(port != 2))
            .collect(),
    );
    let (mut fluidics, _events) = fluidics_with(table, operations.clone());
    fluidics.initialize().await.unwrap();

    fluidics
        .run_sequences(Some(rust_fluidics::RunSection::new(1, 3)))
        .unwrap();
    fluidics.wait_for_completion().await.unwrap();
    assert_eq!(
        operations.calls(),
        vec![(OperationKind::Wash, 3), (OperationKind::Wash, 4)]
    );
}

#[tokio::test]
async fn wait_before_run_returns_immediately() {
    let operations = RecordingOperations::new(None);
    let (mut fluidics, _events) = fluidics_with(scenario_table(), operations);
    assert!(fluidics.wait_for_completion().await.unwrap().is_none());
    fluidics.initialize().await.unwrap();
    assert!(fluidics.wait_for_completion().await.unwrap().is_none());
    assert!(fluidics.status().is_none());
}

#[tokio::test(start_paused = true)]
async fn second_run_is_rejected_while_active() {
    let options = SimulationOptions::realistic();
    let mut fluidics = Fluidics::builder()
        .config(config())
        .sequences(SequenceTable::new(vec![
            SequenceRow::new("Incubate", 0).with_duration(60.0),
        ]))
        .simulated(options)
        .build()
        .unwrap();
    fluidics.initialize().await.unwrap();

    fluidics.run_sequences(None).unwrap();
    assert!(fluidics.is_running());
    assert!(matches!(
        fluidics.run_sequences(None),
        Err(FluidicsError::RunInProgress)
    ));

    let state = fluidics.wait_for_completion().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(fluidics.run_sequences(None).is_ok());
    fluidics.wait_for_completion().await.unwrap();
    fluidics.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn cleanup_cancels_an_active_run_after_current_row() {
    let options = SimulationOptions::instant();
    let log = options.log.clone();
    let mut fluidics = Fluidics::builder()
        .config(config())
        .sequences(SequenceTable::new(vec![
            SequenceRow::new("Incubate", 0).with_duration(30.0),
            SequenceRow::new("Wash", 30).with_flow(100.0, 10.0),
        ]))
        .simulated(options)
        .build()
        .unwrap();
    fluidics.initialize().await.unwrap();
    log.clear();

    fluidics.run_sequences(None).unwrap();
    while fluidics.status().map(|state| state.status) != Some(RunStatus::Running) {
        tokio::task::yield_now().await;
    }
    fluidics.cleanup().await;

    let state = fluidics.status().unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.current_index, 1);
    assert_eq!(log.dispensed_ul(), 0.0);
    assert!(log.events().contains(&DeviceEvent::PumpClosed));
}

#[tokio::test]
async fn simulated_merfish_protocol_runs_end_to_end() {
    let options = SimulationOptions::instant().with_faults(FaultPlan::none());
    let log = options.log.clone();
    let (callbacks, mut events) = ChannelCallbacks::channel();
    let mut fluidics = Fluidics::builder()
        .config(config())
        .sequences(SequenceTable::new(vec![
            SequenceRow::new("Priming", 31).with_flow(800.0, 50.0),
            SequenceRow::new("Flow Probe", 5)
                .with_flow(6000.0, 20.0)
                .with_fill_tubing(30),
            SequenceRow::new("Incubate", 0).with_duration(0.0),
            SequenceRow::new("Wash", 30).with_flow(1000.0, 20.0).with_repeat(2),
        ]))
        .simulated(options)
        .callbacks(Arc::new(callbacks))
        .build()
        .unwrap();
    fluidics.initialize().await.unwrap();
    assert_eq!(fluidics.operation_set().unwrap().family(), "MERFISH");

    fluidics.run_sequences(None).unwrap();
    let state = fluidics.wait_for_completion().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.last_error);

    // priming + probe (two strokes) + tubing chase + two washes
    assert_eq!(log.dispensed_ul(), 800.0 + 6000.0 + 250.0 + 2000.0);
    assert_eq!(progress(&drain(&mut events)).len(), 4);

    fluidics.cleanup().await;
    assert!(log.events().contains(&DeviceEvent::ControllerClosed));
}

#[tokio::test]
async fn default_valves_reach_buffer_ports() {
    let config = FluidicsConfig::from_json_str(
        r#"{
            "application": "MERFISH",
            "microcontroller": { "serial_number": "" },
            "syringe_pump": { "serial_number": "", "volume_ul": 5000, "speed_code_limit": 10 }
        }"#,
    )
    .unwrap();
    let mut fluidics = Fluidics::builder()
        .config(config)
        .sequences(SequenceTable::new(vec![
            SequenceRow::new("Flow Probe", 24).with_flow(100.0, 10.0),
            SequenceRow::new("Wash", 30).with_flow(100.0, 10.0),
        ]))
        .simulated(SimulationOptions::instant())
        .build()
        .unwrap();
    fluidics.initialize().await.unwrap();

    fluidics.run_sequences(None).unwrap();
    let state = fluidics.wait_for_completion().await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.last_error);
    fluidics.cleanup().await;
}
