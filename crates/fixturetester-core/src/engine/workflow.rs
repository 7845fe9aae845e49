//! Test workflow state machine
//!
//! Drives one run through its fixed phase order:
//!
//! `Connect → IdleBaseline → AdjacencyAndRunning → CloseOutputs →
//! SensorSweep → Result`
//!
//! One run is active at a time per fixture; confirmable commands are never
//! overlapped. Every phase is cancellable at entry and every loop checks
//! the token at its top; early exits still attempt a best-effort all-OFF
//! so no channel is left energized.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TestLimits;
use crate::engine::adjacency::AdjacencyProbe;
use crate::engine::classifier::{self, ChannelSnapshot};
use crate::engine::reader::{BatchError, BatchReader};
use crate::engine::session::{
    check_channel_ranges, FaultVerdict, RangeFailure, SensorResult, StepSnapshot, TestReport,
    TestSession,
};
use crate::engine::{CancelToken, Presenter};
use crate::link::ports::PortProvider;
use crate::link::transport::{
    probe_binary, probe_text, BinaryLink, LinkError, LinkEvent, ProbeError, TextLink,
};
use crate::profile::{DeviceProfile, DeviceRole, ReadingState, SensorKind};
use crate::protocol::frame::{opcode, ChannelMask};
use crate::store::ReadingStore;

/// Wait for a handshake reply during the connect scan.
const HANDSHAKE_WAIT: Duration = Duration::from_millis(500);

/// Number of flow readings taken while the flow actuator is enabled.
const FLOW_READS_ENABLED: usize = 3;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A handshake answered with the other role's protocol. Callers can
    /// offer switching workflows instead of retrying.
    #[error("port {port} answered with the wrong protocol while probing for {expected}")]
    WrongDevice { port: String, expected: DeviceRole },

    #[error("no connectable port identified as {role}")]
    NoDevice { role: DeviceRole },

    #[error("{0} disconnected mid-run")]
    Disconnected(DeviceRole),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("run cancelled")]
    Cancelled,

    #[error("workflow phase entered without connected links")]
    NotConnected,
}

impl From<BatchError> for WorkflowError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Link(e) => WorkflowError::Link(e),
            BatchError::Cancelled => WorkflowError::Cancelled,
        }
    }
}

/// Workflow phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    IdleBaseline,
    AdjacencyAndRunning,
    CloseOutputs,
    SensorSweep,
    Result,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Connect => "connecting",
            Phase::IdleBaseline => "capturing idle baseline",
            Phase::AdjacencyAndRunning => "stimulating channels",
            Phase::CloseOutputs => "closing outputs",
            Phase::SensorSweep => "sweeping sensors",
            Phase::Result => "evaluating results",
        }
    }

    fn start_progress(self) -> f32 {
        match self {
            Phase::Connect => 0.0,
            Phase::IdleBaseline => 0.10,
            Phase::AdjacencyAndRunning => 0.35,
            Phase::CloseOutputs => 0.80,
            Phase::SensorSweep => 0.85,
            Phase::Result => 0.95,
        }
    }
}

/// Step-mode navigation commands from the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommand {
    /// Advance past the current snapshot (or continue the run when the
    /// newest snapshot is showing)
    Next,
    /// Show the previous recorded snapshot
    Back,
}

struct Links {
    arduino: TextLink,
    stm32: BinaryLink,
}

/// The workflow engine: one instance per fixture, parameterized by a
/// device profile and a presenter.
pub struct TestRunner {
    profile: DeviceProfile,
    limits: TestLimits,
    presenter: Arc<dyn Presenter>,
    cancel: CancelToken,
    store: ReadingStore,
    links: Option<Links>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    step_rx: Option<mpsc::UnboundedReceiver<StepCommand>>,
    last_report: Option<TestReport>,
}

impl TestRunner {
    pub fn new(profile: DeviceProfile, limits: TestLimits, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            profile,
            limits,
            presenter,
            cancel: CancelToken::new(),
            store: ReadingStore::new(),
            links: None,
            events_rx: None,
            step_rx: None,
            last_report: None,
        }
    }

    /// Cancellation handle for shells; safe to trigger from any task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The most recent completed or cancelled run, without re-running.
    pub fn last_report(&self) -> Option<&TestReport> {
        self.last_report.as_ref()
    }

    /// Replace the limits snapshot used by the next run.
    pub fn set_limits(&mut self, limits: TestLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> &TestLimits {
        &self.limits
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Shared reading store (tests and diagnostic shells).
    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    /// Create the step-mode control channel. Only consulted while
    /// `limits.step_mode` is set; dropping the sender resumes free-run.
    pub fn step_handle(&mut self) -> mpsc::UnboundedSender<StepCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.step_rx = Some(rx);
        tx
    }

    /// Execute one complete run.
    ///
    /// Always snapshots the session into the last-result holder, even on
    /// cancellation or error; only a successful run returns the report.
    pub async fn run(&mut self, ports: &dyn PortProvider) -> Result<TestReport, WorkflowError> {
        self.cancel.reset();
        self.store.clear_all();
        let mut session = TestSession::new(Utc::now());
        info!(profile = self.profile.name, "test run starting");

        let outcome = self.execute(&mut session, ports).await;
        let finished_at = Utc::now();

        match outcome {
            Ok(()) => {
                let report = session.into_report(self.profile.name, finished_at);
                info!(passed = report.passed, duration_ms = report.duration_ms(), "test run finished");
                self.presenter.on_report(&report);
                self.last_report = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                if matches!(e, WorkflowError::Cancelled) {
                    session.cancelled = true;
                }
                warn!(error = %e, "test run aborted");
                self.all_outputs_off_best_effort().await;
                let report = session.into_report(self.profile.name, finished_at);
                self.presenter.on_report(&report);
                self.last_report = Some(report);
                Err(e)
            }
        }
    }

    async fn execute(
        &mut self,
        session: &mut TestSession,
        ports: &dyn PortProvider,
    ) -> Result<(), WorkflowError> {
        self.enter_phase(Phase::Connect)?;
        self.ensure_connected(ports).await?;

        self.enter_phase(Phase::IdleBaseline)?;
        self.idle_baseline(session).await?;

        self.enter_phase(Phase::AdjacencyAndRunning)?;
        self.adjacency_and_running(session).await?;

        self.enter_phase(Phase::CloseOutputs)?;
        self.close_outputs().await?;

        self.enter_phase(Phase::SensorSweep)?;
        self.sensor_sweep(session).await?;

        self.enter_phase(Phase::Result)?;
        self.build_result(session);
        self.presenter.on_status("done", 1.0);
        Ok(())
    }

    /// Cancellation and disconnect check at every phase boundary.
    fn enter_phase(&mut self, phase: Phase) -> Result<(), WorkflowError> {
        if self.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        if let Some(rx) = &mut self.events_rx {
            if let Ok(LinkEvent::Disconnected(role)) = rx.try_recv() {
                // Force-close both links; the next run reconnects.
                self.links = None;
                return Err(WorkflowError::Disconnected(role));
            }
        }
        debug!(phase = ?phase, "entering phase");
        self.presenter.on_status(phase.label(), phase.start_progress());
        Ok(())
    }

    /// Connect scan: text handshake claims the Arduino role first, then
    /// the binary firmware handshake claims the STM32 role among the
    /// remaining candidates. Open/probe failures move to the next
    /// candidate; a wrong-role answer aborts the scan distinctly.
    async fn ensure_connected(&mut self, ports: &dyn PortProvider) -> Result<(), WorkflowError> {
        if let Some(links) = &self.links {
            if !links.arduino.is_closed() && !links.stm32.is_closed() {
                debug!("links still healthy, skipping reconnect");
                return Ok(());
            }
            self.links = None;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut exclude: HashSet<String> = HashSet::new();

        let mut arduino_io = None;
        for port in ports.list_ports(&exclude) {
            if self.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            let mut io = match ports.open(&port, self.profile.baud_rate) {
                Ok(io) => io,
                Err(e) => {
                    debug!(port = %port, error = %e, "open failed, next candidate");
                    continue;
                }
            };
            match probe_text(&mut io, &self.profile, HANDSHAKE_WAIT).await {
                Ok(ident) => {
                    info!(port = %port, ident = %ident, "Arduino link identified");
                    exclude.insert(port);
                    arduino_io = Some(io);
                    break;
                }
                Err(ProbeError::WrongRole) => {
                    return Err(WorkflowError::WrongDevice {
                        port,
                        expected: DeviceRole::Arduino,
                    });
                }
                Err(e) => {
                    debug!(port = %port, error = %e, "text probe failed, next candidate");
                }
            }
        }
        let arduino_io = arduino_io.ok_or(WorkflowError::NoDevice {
            role: DeviceRole::Arduino,
        })?;

        let mut stm32_io = None;
        for port in ports.list_ports(&exclude) {
            if self.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            let mut io = match ports.open(&port, self.profile.baud_rate) {
                Ok(io) => io,
                Err(e) => {
                    debug!(port = %port, error = %e, "open failed, next candidate");
                    continue;
                }
            };
            match probe_binary(&mut io, HANDSHAKE_WAIT).await {
                Ok(firmware) => {
                    info!(port = %port, firmware = %firmware, "STM32 link identified");
                    exclude.insert(port);
                    stm32_io = Some(io);
                    break;
                }
                Err(ProbeError::WrongRole) => {
                    return Err(WorkflowError::WrongDevice {
                        port,
                        expected: DeviceRole::Stm32,
                    });
                }
                Err(e) => {
                    debug!(port = %port, error = %e, "binary probe failed, next candidate");
                }
            }
        }
        let stm32_io = stm32_io.ok_or(WorkflowError::NoDevice {
            role: DeviceRole::Stm32,
        })?;

        self.links = Some(Links {
            arduino: TextLink::spawn(arduino_io, &self.profile, self.store.clone(), events_tx.clone()),
            stm32: BinaryLink::spawn(stm32_io, &self.profile, self.store.clone(), events_tx),
        });
        self.events_rx = Some(events_rx);
        Ok(())
    }

    /// All outputs confirmed OFF, then a paired batch read of every GPIO
    /// channel in the idle state.
    async fn idle_baseline(&mut self, session: &mut TestSession) -> Result<(), WorkflowError> {
        let links = self.links.as_ref().ok_or(WorkflowError::NotConnected)?;

        let all = ChannelMask::all(self.profile.gpio_channels);
        if !links.stm32.send_gpio(opcode::GPIO_OFF, all, &self.limits).await? {
            warn!("all-off was never confirmed before the baseline read");
        }
        self.store.set_capture_state(ReadingState::Idle);

        let channels: Vec<u8> = self.profile.gpio_range().collect();
        let reader = BatchReader {
            arduino: &links.arduino,
            stm32: &links.stm32,
            store: &self.store,
            limits: &self.limits,
            cancel: &self.cancel,
            presenter: self.presenter.as_ref(),
        };
        let outcome = reader.read_channels(&channels, ReadingState::Idle).await?;
        for channel in outcome.missing {
            session.note_unresponsive(channel);
        }
        Ok(())
    }

    /// Per channel: confirmed ON, running capture, adjacency probes,
    /// confirmed OFF. The store's capture state is Running only for the
    /// stimulated channel's own read; neighbor probes record fresh idle
    /// values that never touch the `first()` baseline.
    async fn adjacency_and_running(
        &mut self,
        session: &mut TestSession,
    ) -> Result<(), WorkflowError> {
        let links = self.links.as_ref().ok_or(WorkflowError::NotConnected)?;
        let reader = BatchReader {
            arduino: &links.arduino,
            stm32: &links.stm32,
            store: &self.store,
            limits: &self.limits,
            cancel: &self.cancel,
            presenter: self.presenter.as_ref(),
        };
        let mut probe = AdjacencyProbe::new(&self.profile, &self.limits, &self.store);
        let total = f32::from(self.profile.gpio_channels).max(1.0);

        for channel in self.profile.gpio_range() {
            if self.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            let progress = 0.35 + 0.45 * (f32::from(channel) / total);
            self.presenter
                .on_status(&format!("testing channel {channel}"), progress);
            self.presenter.on_channel_active(channel);

            let mask = ChannelMask::single(channel);
            if !links.stm32.send_gpio(opcode::GPIO_ON, mask, &self.limits).await? {
                warn!(channel, "ON never confirmed, skipping channel");
                session.note_unresponsive(channel);
                // The device may have acted without us seeing the ack.
                let _ = links.stm32.send_gpio(opcode::GPIO_OFF, mask, &self.limits).await;
                continue;
            }

            self.store.set_capture_state(ReadingState::Running);
            let got_running = reader
                .paired_attempt(channel, ReadingState::Running, self.limits.running_read_timeout_ms)
                .await?;
            self.store.set_capture_state(ReadingState::Idle);
            if !got_running {
                session.note_unresponsive(channel);
            }

            let own = self.channel_snapshot(channel);
            let suppress_arduino = classifier::shows_no_actuation(&own, &self.limits);
            if suppress_arduino {
                debug!(channel, "no discernible actuation, suppressing drain-side evidence");
            }

            let outcome = probe.probe_stimulated(channel, suppress_arduino, &reader).await?;
            session.adjacency_faults.extend(outcome.faults);
            session.rail_notes.extend(outcome.notes);
            session.snapshots.push(StepSnapshot {
                channel,
                arduino_running: own.arduino_running,
                stm32_running: own.stm32_running,
                comparisons: outcome.comparisons,
            });

            if self.limits.step_mode {
                if let Some(step_rx) = self.step_rx.as_mut() {
                    navigate_snapshots(
                        step_rx,
                        &self.cancel,
                        self.presenter.as_ref(),
                        &session.snapshots,
                    )
                    .await?;
                }
            }

            if !links.stm32.send_gpio(opcode::GPIO_OFF, mask, &self.limits).await? {
                warn!(channel, "OFF never confirmed; final close will retry");
            }
        }
        Ok(())
    }

    /// Final confirmed all-channels OFF.
    async fn close_outputs(&mut self) -> Result<(), WorkflowError> {
        let links = self.links.as_ref().ok_or(WorkflowError::NotConnected)?;
        let all = ChannelMask::all(self.profile.gpio_channels);
        if !links.stm32.send_gpio(opcode::GPIO_OFF, all, &self.limits).await? {
            warn!("final all-off was never confirmed");
        }
        self.store.set_capture_state(ReadingState::Idle);
        Ok(())
    }

    /// Read the non-GPIO sensors with their kind-specific settle times.
    async fn sensor_sweep(&mut self, session: &mut TestSession) -> Result<(), WorkflowError> {
        let links = self.links.as_ref().ok_or(WorkflowError::NotConnected)?;
        let reader = BatchReader {
            arduino: &links.arduino,
            stm32: &links.stm32,
            store: &self.store,
            limits: &self.limits,
            cancel: &self.cancel,
            presenter: self.presenter.as_ref(),
        };

        for sensor in &self.profile.sensors {
            if self.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            self.presenter
                .on_status(&format!("reading {}", sensor.name), Phase::SensorSweep.start_progress());

            let value = match sensor.kind {
                SensorKind::Pressure => {
                    settle(&self.cancel, self.limits.pressure_settle_ms).await?;
                    reader.read_arduino(sensor.channel).await?
                }
                SensorKind::Temperature => {
                    // Temperature conversion needs materially longer than
                    // the other sensors before the value is trustworthy.
                    settle(&self.cancel, self.limits.temperature_settle_ms).await?;
                    reader.read_arduino(sensor.channel).await?
                }
                SensorKind::Flow => {
                    links.stm32.send_frame(opcode::FLOW_ENABLE, [0; 4]).await?;
                    let mut enabled_value = None;
                    for _ in 0..FLOW_READS_ENABLED {
                        settle(&self.cancel, self.limits.flow_settle_ms).await?;
                        if let Some(v) = reader.read_arduino(sensor.channel).await? {
                            enabled_value = Some(v);
                        }
                    }
                    links.stm32.send_frame(opcode::FLOW_DISABLE, [0; 4]).await?;
                    settle(&self.cancel, self.limits.flow_settle_ms).await?;
                    // Post-disable reading is recorded in the store for
                    // diagnostics; the pass band applies while enabled.
                    let _ = reader.read_arduino(sensor.channel).await?;
                    enabled_value
                }
            };

            if let Some(value) = value {
                let range = match sensor.kind {
                    SensorKind::Pressure => self.limits.pressure_range,
                    SensorKind::Temperature => self.limits.temperature_range,
                    SensorKind::Flow => self.limits.flow_range,
                };
                if !range.contains(value) {
                    session.range_failures.push(RangeFailure {
                        device: DeviceRole::Arduino,
                        channel: sensor.channel,
                        state: ReadingState::Idle,
                        label: sensor.name.to_string(),
                        value,
                        range,
                    });
                }
            } else {
                warn!(sensor = sensor.name, "sensor never answered");
            }
            session.sensors.push(SensorResult {
                name: sensor.name.to_string(),
                channel: sensor.channel,
                value,
            });
        }
        Ok(())
    }

    /// Classify every channel, filter adjacency evidence for
    /// load-disconnected channels, and apply the pass bands.
    fn build_result(&self, session: &mut TestSession) {
        for channel in self.profile.gpio_range() {
            let snapshot = self.channel_snapshot(channel);
            if snapshot.is_empty() {
                // No data at all: no verdict, excluded from pass/fail.
                session.note_unresponsive(channel);
                continue;
            }
            if let Some(category) = classifier::classify(&snapshot, &self.limits) {
                debug!(channel, category = %category, "fault classified");
                session.verdicts.push(FaultVerdict { channel, category });
            }
            check_channel_ranges(channel, &snapshot, &self.limits, &mut session.range_failures);
        }
        session.filter_adjacency_for_disconnected();
    }

    /// The four classification operands for a channel: pristine `first()`
    /// idle baselines, latest running captures.
    fn channel_snapshot(&self, channel: u8) -> ChannelSnapshot {
        ChannelSnapshot::new(
            self.store.first(DeviceRole::Arduino, ReadingState::Idle, channel),
            self.store.latest(DeviceRole::Arduino, ReadingState::Running, channel),
            self.store.first(DeviceRole::Stm32, ReadingState::Idle, channel),
            self.store.latest(DeviceRole::Stm32, ReadingState::Running, channel),
        )
    }

    /// Best-effort de-energize on early exit; failures are deliberately
    /// swallowed, the run is already ending.
    async fn all_outputs_off_best_effort(&self) {
        if let Some(links) = &self.links {
            let all = ChannelMask::all(self.profile.gpio_channels);
            if let Err(e) = links.stm32.send_gpio(opcode::GPIO_OFF, all, &self.limits).await {
                warn!(error = %e, "best-effort all-off failed");
            }
        }
    }
}

/// Step-mode pause: show the newest snapshot and let the shell walk
/// forward/backward through the recorded history. Navigation never
/// affects the classification result. A dropped controller resumes
/// free-run.
async fn navigate_snapshots(
    step_rx: &mut mpsc::UnboundedReceiver<StepCommand>,
    cancel: &CancelToken,
    presenter: &dyn Presenter,
    snapshots: &[StepSnapshot],
) -> Result<(), WorkflowError> {
    let mut cursor = snapshots.len() - 1;
    loop {
        presenter.on_step(&snapshots[cursor]);
        let command = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            command = step_rx.recv() => command,
        };
        match command {
            None => return Ok(()),
            Some(StepCommand::Next) if cursor + 1 >= snapshots.len() => return Ok(()),
            Some(StepCommand::Next) => cursor += 1,
            Some(StepCommand::Back) => cursor = cursor.saturating_sub(1),
        }
    }
}

/// Cancellable settle delay for sensors that genuinely need warm-up time.
async fn settle(cancel: &CancelToken, ms: u64) -> Result<(), WorkflowError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
    }
}
