//! Sequence execution engine.
//!
//! The engine walks a filtered, remapped list of [`SequenceRow`]s strictly in
//! order, handing each one to an [`OperationSet`]. Row *i+1* never starts before
//! row *i*'s handler has returned, since every row drives the same fluid path.
//!
//! # State Machine
//!
//! ```text
//! Idle ──> Running ──> Completed
//!   │       │  ▲  └──> Failed
//!   │  pause│  │resume
//!   │       ▼  │
//!   │      Paused ───> Cancelled <── Running
//!   └────────────────> Cancelled
//! ```
//!
//! Terminal states (`Completed`, `Failed`, `Cancelled`) never change again.
//! Pause and cancel requests are honored between rows only; a row in progress
//! always runs to completion.
//!
//! # Events
//!
//! A run reports through [`SequenceCallbacks`]:
//! - `on_estimate` once, before the first row
//! - `update_progress(index, name, Completed)` after every successful row
//! - on a failing row, `update_progress(index, name, Error)` followed by one `on_error`
//! - `on_finished` once, only when every row succeeded

use crate::config::EngineConfig;
use crate::operations::OperationSet;
use crate::sequence::SequenceRow;
use crate::error::{AppResult, FluidicsError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

// =============================================================================
// Run state
// =============================================================================

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created, not started
    Idle,
    /// Executing rows
    Running,
    /// Waiting between rows for a resume
    Paused,
    /// Every row finished
    Completed,
    /// A row failed; the remaining rows were skipped
    Failed,
    /// Stopped on request
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "Idle"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Paused => write!(f, "Paused"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl RunStatus {
    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Check if `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

/// Failure recorded for the row that ended a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Row index within the run
    pub index: usize,
    /// Operation name of the row
    pub sequence_name: String,
    /// Human-readable description
    pub message: String,
}

/// Snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Rows finished so far
    pub current_index: usize,
    /// Rows in the run
    pub total_rows: usize,
    /// Lifecycle state
    pub status: RunStatus,
    /// Failure that ended the run
    pub last_error: Option<ErrorInfo>,
    /// When the first row was dispatched
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached
    pub finished_at: Option<DateTime<Utc>>,
}

impl EngineState {
    /// Idle state for a run of `total_rows`.
    pub fn new(total_rows: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            current_index: 0,
            total_rows,
            status: RunStatus::Idle,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: RunStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(FluidicsError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        match next {
            RunStatus::Running if self.started_at.is_none() => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}

// =============================================================================
// Run control
// =============================================================================

/// Request from the caller, read by the engine between rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep going
    Run,
    /// Hold before the next row
    Pause,
    /// Stop before the next row
    Cancel,
}

/// Pause/resume/cancel handle shared between caller and engine.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// Fresh handle in the `Run` state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self { tx: Arc::new(tx) }
    }

    /// Hold the run before its next row.
    pub fn pause(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Run {
                *signal = ControlSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Continue a paused run.
    pub fn resume(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Pause {
                *signal = ControlSignal::Run;
                true
            } else {
                false
            }
        });
    }

    /// Stop the run before its next row. Cannot be undone.
    pub fn cancel(&self) {
        self.tx.send_replace(ControlSignal::Cancel);
    }

    /// Current request.
    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ControlSignal> {
        self.tx.subscribe()
    }
}

// =============================================================================
// Callbacks
// =============================================================================

/// Outcome attached to a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    /// Row finished
    Completed,
    /// Row failed
    Error,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStatus::Completed => write!(f, "completed"),
            ProgressStatus::Error => write!(f, "error"),
        }
    }
}

/// Observer of a run.
///
/// Every method has a logging default, so implementors override only what they
/// need. Calls come from the engine's background task, one at a time.
pub trait SequenceCallbacks: Send + Sync {
    /// Row `index` changed state.
    fn update_progress(&self, index: usize, sequence_name: &str, status: ProgressStatus) {
        info!(index, sequence = sequence_name, %status, "Sequence {} ({}): {}", index, sequence_name, status);
    }

    /// The run failed.
    fn on_error(&self, message: &str) {
        error!("Error: {}", message);
    }

    /// Every row completed.
    fn on_finished(&self) {
        info!("Experiment completed");
    }

    /// Estimated duration, reported before the first row.
    fn on_estimate(&self, total_time_s: f64, sequence_count: usize) {
        info!(total_time_s, sequence_count, "Est. time: {}s, Sequences: {}", total_time_s, sequence_count);
    }
}

/// Callbacks that only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCallbacks;

impl SequenceCallbacks for LoggingCallbacks {}

/// Callback event, as forwarded by [`ChannelCallbacks`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Time estimate
    Estimate(TimeEstimate),
    /// Row progress
    Progress {
        /// Row index within the run
        index: usize,
        /// Operation name
        sequence_name: String,
        /// Outcome
        status: ProgressStatus,
    },
    /// Run failure
    Error(String),
    /// Run success
    Finished,
}

/// Callbacks that forward every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelCallbacks {
    /// Callbacks plus the receiving end of their channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: EngineEvent) {
        // Receiver gone: nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl SequenceCallbacks for ChannelCallbacks {
    fn update_progress(&self, index: usize, sequence_name: &str, status: ProgressStatus) {
        self.send(EngineEvent::Progress {
            index,
            sequence_name: sequence_name.to_string(),
            status,
        });
    }

    fn on_error(&self, message: &str) {
        self.send(EngineEvent::Error(message.to_string()));
    }

    fn on_finished(&self) {
        self.send(EngineEvent::Finished);
    }

    fn on_estimate(&self, total_time_s: f64, sequence_count: usize) {
        self.send(EngineEvent::Estimate(TimeEstimate {
            total_time_s,
            sequence_count,
        }));
    }
}

// =============================================================================
// Estimate
// =============================================================================

/// Expected duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    /// Sum of nominal row durations plus per-row overhead
    pub total_time_s: f64,
    /// Rows in the run
    pub sequence_count: usize,
}

impl TimeEstimate {
    /// Estimate for `rows`, adding `row_overhead_s` per row.
    pub fn for_rows(rows: &[SequenceRow], row_overhead_s: f64) -> Self {
        let total_time_s = rows
            .iter()
            .map(|row| row.nominal_duration_s() + row_overhead_s.max(0.0))
            .sum();
        Self {
            total_time_s,
            sequence_count: rows.len(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Shared, readable view of a run's [`EngineState`].
#[derive(Debug, Clone)]
pub struct StateHandle {
    inner: Arc<Mutex<EngineState>>,
}

impl StateHandle {
    fn new(state: EngineState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> EngineState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn transition(&self, next: RunStatus) {
        if let Err(e) = self.update(|state| state.transition(next)) {
            warn!(error = %e, "Ignoring run state change");
        }
    }
}

enum Gate {
    Proceed,
    Cancelled,
}

/// Executes one run.
///
/// Create one engine per run; its [`StateHandle`] and [`RunControl`] stay valid
/// after the run ends.
pub struct SequenceEngine {
    state: StateHandle,
    control: RunControl,
}

impl SequenceEngine {
    /// Engine for a run of `total_rows`, steered by `control`.
    pub fn new(total_rows: usize, control: RunControl) -> Self {
        Self {
            state: StateHandle::new(EngineState::new(total_rows)),
            control,
        }
    }

    /// State handle for observers.
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Control handle for pause/resume/cancel.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Execute `rows` in order and return the terminal state.
    ///
    /// Row failures are reported through `callbacks` and end the run as `Failed`;
    /// they are not returned as errors.
    pub async fn run(
        &self,
        operations: &dyn OperationSet,
        rows: &[SequenceRow],
        config: &EngineConfig,
        callbacks: &dyn SequenceCallbacks,
    ) -> EngineState {
        let run_id = self.state.snapshot().run_id;
        let mut control = self.control.subscribe();

        let cancelled_early = *control.borrow_and_update() == ControlSignal::Cancel;
        if cancelled_early {
            self.state.transition(RunStatus::Cancelled);
            info!(%run_id, "Run cancelled before start");
            return self.state.snapshot();
        }

        self.state.transition(RunStatus::Running);
        let estimate = TimeEstimate::for_rows(rows, config.row_overhead_s);
        info!(
            %run_id,
            family = operations.family(),
            rows = rows.len(),
            estimated_s = estimate.total_time_s,
            "Sequence run started"
        );
        callbacks.on_estimate(estimate.total_time_s, estimate.sequence_count);

        for (index, row) in rows.iter().enumerate() {
            if let Gate::Cancelled = self.gate(&mut control).await {
                self.state.transition(RunStatus::Cancelled);
                info!(%run_id, completed = index, "Run cancelled");
                return self.state.snapshot();
            }

            let span = tracing::info_span!(
                "row",
                index,
                operation = %row.sequence_name,
                port = row.fluidic_port
            );
            match operations.run_row(row).instrument(span).await {
                Ok(()) => {
                    self.state.update(|state| state.current_index = index + 1);
                    callbacks.update_progress(index, &row.sequence_name, ProgressStatus::Completed);
                }
                Err(e) => {
                    let message = format!(
                        "Sequence {} ({}) failed: {}",
                        index, row.sequence_name, e
                    );
                    error!(%run_id, index, error = %e, "Row failed, aborting run");
                    callbacks.update_progress(index, &row.sequence_name, ProgressStatus::Error);
                    callbacks.on_error(&message);
                    self.state.update(|state| {
                        state.last_error = Some(ErrorInfo {
                            index,
                            sequence_name: row.sequence_name.clone(),
                            message,
                        })
                    });
                    self.state.transition(RunStatus::Failed);
                    return self.state.snapshot();
                }
            }
        }

        self.state.transition(RunStatus::Completed);
        info!(%run_id, rows = rows.len(), "Sequence run completed");
        callbacks.on_finished();
        self.state.snapshot()
    }

    /// Wait out a pause; report whether to continue.
    async fn gate(&self, control: &mut watch::Receiver<ControlSignal>) -> Gate {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                ControlSignal::Run => {
                    if self.state.snapshot().status == RunStatus::Paused {
                        self.state.transition(RunStatus::Running);
                        info!("Run resumed");
                    }
                    return Gate::Proceed;
                }
                ControlSignal::Cancel => return Gate::Cancelled,
                ControlSignal::Pause => {
                    if self.state.snapshot().status == RunStatus::Running {
                        self.state.transition(RunStatus::Paused);
                        info!("Run paused");
                    }
                    if control.changed().await.is_err() {
                        return Gate::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{OperationKind, OperationParams, OperationRegistry};
    use async_trait::async_trait;
    use tracing_test::traced_test;

    /// Records executed ports; fails on a chosen port.
    struct RecordingOperations {
        registry: OperationRegistry,
        executed: Mutex<Vec<u32>>,
        fail_on_port: Option<u32>,
    }

    impl RecordingOperations {
        fn new(fail_on_port: Option<u32>) -> Self {
            Self {
                registry: OperationRegistry::new(
                    "Test",
                    &[("Flow Probe", OperationKind::Flow), ("Wash", OperationKind::Flow)],
                ),
                executed: Mutex::new(Vec::new()),
                fail_on_port,
            }
        }

        fn executed(&self) -> Vec<u32> {
            self.executed.lock().unwrap().clone()
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

        async fn execute(&self, _kind: OperationKind, params: &OperationParams) -> AppResult<()> {
            if Some(params.port) == self.fail_on_port {
                return Err(FluidicsError::hardware("syringe_pump", "plunger overload"));
            }
            self.executed.lock().unwrap().push(params.port);
            Ok(())
        }
    }

    fn rows(ports: &[u32]) -> Vec<SequenceRow> {
        ports
            .iter()
            .map(|port| SequenceRow::new("Wash", *port).with_flow(100.0, 10.0))
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut state = EngineState::new(1);
        state.transition(RunStatus::Running).unwrap();
        state.transition(RunStatus::Completed).unwrap();
        assert!(state.finished_at.is_some());
        for next in [RunStatus::Running, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(matches!(
                state.transition(next),
                Err(FluidicsError::InvalidTransition { .. })
            ));
        }
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[test]
    fn estimate_sums_durations_and_overhead() {
        let rows = vec![
            SequenceRow::new("Flow Probe", 5).with_flow(500.0, 10.0),
            SequenceRow::new("Incubate", 0).with_duration(60.0).with_repeat(2),
        ];
        let estimate = TimeEstimate::for_rows(&rows, 5.0);
        assert_eq!(estimate.sequence_count, 2);
        assert_eq!(estimate.total_time_s, 50.0 + 120.0 + 10.0);
    }

    #[tokio::test]
    async fn successful_run_reports_in_order() {
        let ops = RecordingOperations::new(None);
        let (callbacks, mut rx) = ChannelCallbacks::channel();
        let engine = SequenceEngine::new(3, RunControl::new());

        let state = engine
            .run(&ops, &rows(&[1, 2, 3]), &EngineConfig::default(), &callbacks)
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.current_index, 3);
        assert_eq!(ops.executed(), vec![1, 2, 3]);

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            EngineEvent::Estimate(TimeEstimate { total_time_s: 30.0, sequence_count: 3 })
        );
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Progress { index, status: ProgressStatus::Completed, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(events.last(), Some(&EngineEvent::Finished));
    }

    #[tokio::test]
    async fn failing_row_stops_the_run() {
        let ops = RecordingOperations::new(Some(2));
        let (callbacks, mut rx) = ChannelCallbacks::channel();
        let engine = SequenceEngine::new(3, RunControl::new());

        let state = engine
            .run(&ops, &rows(&[1, 2, 3]), &EngineConfig::default(), &callbacks)
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(ops.executed(), vec![1]);
        let error = state.last_error.unwrap();
        assert_eq!(error.index, 1);
        assert!(error.message.contains("plunger overload"));

        let events = drain(&mut rx);
        assert!(events.contains(&EngineEvent::Progress {
            index: 1,
            sequence_name: "Wash".to_string(),
            status: ProgressStatus::Error,
        }));
        assert_eq!(
            events.iter().filter(|e| matches!(e, EngineEvent::Error(_))).count(),
            1
        );
        assert!(!events.contains(&EngineEvent::Finished));
    }

    #[tokio::test]
    async fn unknown_operation_fails_at_its_row() {
        let ops = RecordingOperations::new(None);
        let (callbacks, mut rx) = ChannelCallbacks::channel();
        let engine = SequenceEngine::new(2, RunControl::new());
        let rows = vec![
            SequenceRow::new("Wash", 30).with_flow(100.0, 10.0),
            SequenceRow::new("Image", 0),
        ];

        let state = engine
            .run(&ops, &rows, &EngineConfig::default(), &callbacks)
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(ops.executed(), vec![30]);
        let errors: Vec<EngineEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::Error(_)))
            .collect();
        assert!(matches!(&errors[..], [EngineEvent::Error(m)] if m.contains("Unknown operation 'Image'")));
    }

    #[tokio::test]
    async fn empty_run_completes_immediately() {
        let ops = RecordingOperations::new(None);
        let (callbacks, mut rx) = ChannelCallbacks::channel();
        let engine = SequenceEngine::new(0, RunControl::new());

        let state = engine
            .run(&ops, &[], &EngineConfig::default(), &callbacks)
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(
            drain(&mut rx),
            vec![
                EngineEvent::Estimate(TimeEstimate { total_time_s: 0.0, sequence_count: 0 }),
                EngineEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_before_start_runs_nothing() {
        let ops = RecordingOperations::new(None);
        let control = RunControl::new();
        control.cancel();
        control.resume();
        let engine = SequenceEngine::new(2, control);

        let state = engine
            .run(&ops, &rows(&[1, 2]), &EngineConfig::default(), &LoggingCallbacks)
            .await;
        assert_eq!(state.status, RunStatus::Cancelled);
        assert!(ops.executed().is_empty());
    }

    /// Pauses the run from inside the first row, then checks the gate holds.
    struct PausingOperations {
        control: RunControl,
        executed: Mutex<usize>,
    }

    #[async_trait]
    impl OperationSet for PausingOperations {
        fn family(&self) -> &'static str {
            "Test"
        }

        fn resolve(&self, _name: &str) -> AppResult<OperationKind> {
            Ok(OperationKind::Incubate)
        }

        fn supported_operations(&self) -> Vec<String> {
            Vec::new()
        }

        async fn execute(&self, _kind: OperationKind, _params: &OperationParams) -> AppResult<()> {
            *self.executed.lock().unwrap() += 1;
            self.control.pause();
            Ok(())
        }
    }

    async fn wait_for_pause(state: &StateHandle, ops: &PausingOperations, executed: usize) {
        while state.snapshot().status != RunStatus::Paused || *ops.executed.lock().unwrap() != executed {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn pause_holds_between_rows_until_resume() {
        let control = RunControl::new();
        let ops = Arc::new(PausingOperations {
            control: control.clone(),
            executed: Mutex::new(0),
        });
        let engine = Arc::new(SequenceEngine::new(3, control.clone()));
        let state = engine.state();

        let task = {
            let ops = ops.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .run(ops.as_ref(), &rows(&[1, 2, 3]), &EngineConfig::default(), &LoggingCallbacks)
                    .await
            })
        };

        wait_for_pause(&state, &ops, 1).await;
        assert_eq!(state.snapshot().current_index, 1);

        control.resume();
        wait_for_pause(&state, &ops, 2).await;

        control.resume();
        let final_state = task.await.unwrap();
        assert_eq!(final_state.status, RunStatus::Completed);
        assert_eq!(*ops.executed.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn cancel_while_paused_ends_the_run() {
        let control = RunControl::new();
        let ops = Arc::new(PausingOperations {
            control: control.clone(),
            executed: Mutex::new(0),
        });
        let engine = Arc::new(SequenceEngine::new(3, control.clone()));
        let state = engine.state();

        let task = {
            let ops = ops.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .run(ops.as_ref(), &rows(&[1, 2, 3]), &EngineConfig::default(), &LoggingCallbacks)
                    .await
            })
        };

        wait_for_pause(&state, &ops, 1).await;
        control.cancel();
        let final_state = task.await.unwrap();
        assert_eq!(final_state.status, RunStatus::Cancelled);
        assert_eq!(final_state.current_index, 1);
        assert_eq!(*ops.executed.lock().unwrap(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn default_callbacks_log_progress() {
        let ops = RecordingOperations::new(None);
        let engine = SequenceEngine::new(1, RunControl::new());
        engine
            .run(&ops, &rows(&[7]), &EngineConfig::default(), &LoggingCallbacks)
            .await;

        assert!(logs_contain("Est. time: 10s, Sequences: 1"));
        assert!(logs_contain("Sequence 0 (Wash): completed"));
        assert!(logs_contain("Experiment completed"));
    }
}
