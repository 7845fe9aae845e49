//! E2E tests for the complete test workflow
//!
//! Runs the real engine against an in-process mock fixture speaking both
//! wire protocols over `tokio::io::duplex`: a text-protocol device task
//! (Arduino role) and a binary-protocol device task (STM32 role) sharing
//! one electrical model. Paused tokio time keeps the retry/settle
//! schedules instant and deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use fixturetester_core::engine::session::StepSnapshot;
use fixturetester_core::engine::workflow::{StepCommand, TestRunner, WorkflowError};
use fixturetester_core::engine::{CancelToken, NullPresenter, Presenter};
use fixturetester_core::link::ports::{DeviceIo, PortProvider};
use fixturetester_core::profile::{full_fixture, DeviceRole, ReadingState};
use fixturetester_core::protocol::frame::{self, opcode, FrameDecoder};
use fixturetester_core::{FaultCategory, TestLimits};

// ---------------------------------------------------------------------------
// Mock fixture
// ---------------------------------------------------------------------------

/// Shared electrical model both device tasks consult.
#[derive(Clone)]
struct ElectricalModel {
    inner: Arc<Mutex<ModelInner>>,
}

struct ModelInner {
    arduino_idle: HashMap<u8, i32>,
    arduino_running: HashMap<u8, i32>,
    stm32_idle: HashMap<u8, i32>,
    stm32_running: HashMap<u8, i32>,
    /// (stimulated, victim, device, shifted_value): while `stimulated` is
    /// ON, reads of `victim` on `device` return `shifted_value`.
    coupling: Vec<(u8, u8, DeviceRole, i32)>,
    sensors: HashMap<u8, i32>,
    flow_channel: u8,
    flow_on_value: i32,
    flow_off_value: i32,
    gpio_mask: u32,
    flow_enabled: bool,
    /// Confirmations to swallow before starting to acknowledge
    drop_confirms: u32,
}

impl ElectricalModel {
    /// Every channel healthy: 798/36 on the drain sensor, 5/345 on the
    /// source sensor, sensors mid-band.
    fn healthy() -> Self {
        let mut arduino_idle = HashMap::new();
        let mut arduino_running = HashMap::new();
        let mut stm32_idle = HashMap::new();
        let mut stm32_running = HashMap::new();
        for ch in 0..18u8 {
            arduino_idle.insert(ch, 798);
            arduino_running.insert(ch, 36);
            stm32_idle.insert(ch, 5);
            stm32_running.insert(ch, 345);
        }
        let sensors = HashMap::from([(18u8, 512), (19u8, 400)]);
        Self {
            inner: Arc::new(Mutex::new(ModelInner {
                arduino_idle,
                arduino_running,
                stm32_idle,
                stm32_running,
                coupling: Vec::new(),
                sensors,
                flow_channel: 20,
                flow_on_value: 500,
                flow_off_value: 20,
                gpio_mask: 0,
                flow_enabled: false,
                drop_confirms: 0,
            })),
        }
    }

    fn set_channel(&self, ch: u8, a_idle: i32, a_run: i32, s_idle: i32, s_run: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.arduino_idle.insert(ch, a_idle);
        inner.arduino_running.insert(ch, a_run);
        inner.stm32_idle.insert(ch, s_idle);
        inner.stm32_running.insert(ch, s_run);
    }

    fn couple(&self, stimulated: u8, victim: u8, device: DeviceRole, shifted: i32) {
        self.inner
            .lock()
            .unwrap()
            .coupling
            .push((stimulated, victim, device, shifted));
    }

    fn set_drop_confirms(&self, count: u32) {
        self.inner.lock().unwrap().drop_confirms = count;
    }

    fn value(&self, device: DeviceRole, ch: u8) -> i32 {
        let inner = self.inner.lock().unwrap();
        if device == DeviceRole::Arduino {
            if ch == inner.flow_channel {
                return if inner.flow_enabled {
                    inner.flow_on_value
                } else {
                    inner.flow_off_value
                };
            }
            if let Some(&v) = inner.sensors.get(&ch) {
                return v;
            }
        }
        let on = inner.gpio_mask & (1 << ch) != 0;
        if on {
            return match device {
                DeviceRole::Arduino => inner.arduino_running[&ch],
                DeviceRole::Stm32 => inner.stm32_running[&ch],
            };
        }
        for &(stim, victim, dev, shifted) in &inner.coupling {
            if victim == ch && dev == device && inner.gpio_mask & (1 << stim) != 0 {
                return shifted;
            }
        }
        match device {
            DeviceRole::Arduino => inner.arduino_idle[&ch],
            DeviceRole::Stm32 => inner.stm32_idle[&ch],
        }
    }

    /// Apply a GPIO mask frame; returns whether to acknowledge it.
    fn apply_gpio(&self, op: u8, mask_bytes: [u8; 3]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mask = u32::from(mask_bytes[0])
            | (u32::from(mask_bytes[1]) << 8)
            | (u32::from(mask_bytes[2]) << 16);
        match op {
            opcode::GPIO_ON => inner.gpio_mask |= mask,
            opcode::GPIO_OFF => inner.gpio_mask &= !mask,
            _ => {}
        }
        if inner.drop_confirms > 0 {
            inner.drop_confirms -= 1;
            return false;
        }
        true
    }

    fn set_flow(&self, enabled: bool) {
        self.inner.lock().unwrap().flow_enabled = enabled;
    }
}

/// Arduino-role device: answers `ident` and `get <pin>` lines.
async fn text_device(mut io: DuplexStream, model: ElectricalModel) {
    let mut buf = [0u8; 128];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let reply = if line == "ident" {
                "FIXT-A fw 1.4\n".to_string()
            } else if let Some(pin) = line.strip_prefix("get ") {
                match pin.parse::<u8>() {
                    Ok(pin) => {
                        let name = match pin {
                            18 => "pressure",
                            19 => "temperature",
                            20 => "flow",
                            _ => "gpio",
                        };
                        format!("{name}({pin}): {}\n", model.value(DeviceRole::Arduino, pin))
                    }
                    Err(_) => continue,
                }
            } else {
                continue;
            };
            if io.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

struct BinaryBehavior {
    /// Reply a firmware frame to unparseable input (simulates the wrong
    /// device answering a text probe)
    chatty: bool,
    /// Exit (dropping the stream) after this many decoded frames
    die_after_frames: Option<u32>,
}

impl Default for BinaryBehavior {
    fn default() -> Self {
        Self {
            chatty: false,
            die_after_frames: None,
        }
    }
}

/// STM32-role device: firmware query, GPIO masks with acks, reads, flow.
async fn binary_device(mut io: DuplexStream, model: ElectricalModel, behavior: BinaryBehavior) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];
    let mut frames_handled = 0u32;
    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let frames = decoder.push(&buf[..n]);
        if frames.is_empty() && behavior.chatty {
            let reply = frame::encode(opcode::FIRMWARE, [9, 9, 0, 0]);
            if io.write_all(&reply).await.is_err() {
                return;
            }
            continue;
        }
        for f in frames {
            frames_handled += 1;
            let reply = match f.opcode {
                opcode::FIRMWARE => Some(frame::encode(opcode::FIRMWARE, [1, 2, 0, 0])),
                opcode::GPIO_ON | opcode::GPIO_OFF => {
                    let mask = [f.payload[0], f.payload[1], f.payload[2]];
                    if model.apply_gpio(f.opcode, mask) {
                        Some(frame::encode(f.opcode, f.payload))
                    } else {
                        None
                    }
                }
                opcode::READ_CHANNEL => {
                    let ch = f.payload[0];
                    let value = model.value(DeviceRole::Stm32, ch);
                    Some(frame::encode(
                        opcode::READ_CHANNEL,
                        [ch, (value & 0xFF) as u8, ((value >> 8) & 0xFF) as u8, 0],
                    ))
                }
                opcode::FLOW_ENABLE => {
                    model.set_flow(true);
                    None
                }
                opcode::FLOW_DISABLE => {
                    model.set_flow(false);
                    None
                }
                _ => None,
            };
            if let Some(reply) = reply {
                if io.write_all(&reply).await.is_err() {
                    return;
                }
            }
            if let Some(limit) = behavior.die_after_frames {
                if frames_handled >= limit {
                    return;
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PortKind {
    Text,
    Binary,
    ChattyBinary,
    DyingBinary(u32),
}

struct MockProvider {
    model: ElectricalModel,
    ports: Vec<(String, PortKind)>,
}

impl MockProvider {
    /// Binary device listed first so the connect scan has to skip past it
    /// while hunting for the text device.
    fn standard(model: ElectricalModel) -> Self {
        Self {
            model,
            ports: vec![
                ("ttyFIX0".to_string(), PortKind::Binary),
                ("ttyFIX1".to_string(), PortKind::Text),
            ],
        }
    }
}

impl PortProvider for MockProvider {
    fn list_ports(&self, exclude: &HashSet<String>) -> Vec<String> {
        self.ports
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !exclude.contains(name))
            .collect()
    }

    fn open(&self, port: &str, _baud_rate: u32) -> std::io::Result<DeviceIo> {
        let kind = self
            .ports
            .iter()
            .find(|(name, _)| name == port)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| std::io::Error::other("unknown port"))?;
        let (near, far) = tokio::io::duplex(4096);
        let model = self.model.clone();
        match kind {
            PortKind::Text => {
                tokio::spawn(text_device(far, model));
            }
            PortKind::Binary => {
                tokio::spawn(binary_device(far, model, BinaryBehavior::default()));
            }
            PortKind::ChattyBinary => {
                tokio::spawn(binary_device(
                    far,
                    model,
                    BinaryBehavior { chatty: true, die_after_frames: None },
                ));
            }
            PortKind::DyingBinary(limit) => {
                tokio::spawn(binary_device(
                    far,
                    model,
                    BinaryBehavior { chatty: false, die_after_frames: Some(limit) },
                ));
            }
        }
        Ok(Box::new(near))
    }
}

fn make_runner(presenter: Arc<dyn Presenter>) -> TestRunner {
    TestRunner::new(full_fixture(), TestLimits::default(), presenter)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_healthy_fixture_passes() {
    let model = ElectricalModel::healthy();
    let provider = MockProvider::standard(model);
    let mut runner = make_runner(Arc::new(NullPresenter));

    let report = runner.run(&provider).await.expect("run should succeed");

    assert!(report.passed);
    assert!(report.verdicts.is_empty());
    assert!(report.adjacency_faults.is_empty());
    assert!(report.range_failures.is_empty());
    assert!(report.unresponsive.is_empty());
    assert!(!report.cancelled);

    // Every GPIO channel produced an idle baseline on both devices.
    for ch in 0..18u8 {
        assert_eq!(
            runner.store().first(DeviceRole::Arduino, ReadingState::Idle, ch),
            Some(798)
        );
        assert_eq!(
            runner.store().first(DeviceRole::Stm32, ReadingState::Idle, ch),
            Some(5)
        );
        assert_eq!(
            runner.store().latest(DeviceRole::Arduino, ReadingState::Running, ch),
            Some(36)
        );
    }

    // All three sensors answered in-band.
    let sensor_names: Vec<&str> = report.sensors.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(sensor_names, vec!["pressure", "temperature", "flow"]);
    assert_eq!(report.sensors[2].value, Some(500));

    // Rail neighbors of the end channels were noted, not compared.
    assert!(report.rail_notes.iter().any(|n| n.stimulated == 0));
    assert!(report.rail_notes.iter().any(|n| n.stimulated == 17));

    // The snapshot outlives the session.
    assert!(runner.last_report().unwrap().passed);
}

#[tokio::test(start_paused = true)]
async fn test_seeded_faults_are_classified_in_priority_order() {
    let model = ElectricalModel::healthy();
    // Channel 2: drain saturated in both states.
    model.set_channel(2, 1015, 1020, 5, 345);
    // Channel 7: source rises while its idle stays near zero.
    model.set_channel(7, 798, 36, 5, 450);
    let provider = MockProvider::standard(model);
    let mut runner = make_runner(Arc::new(NullPresenter));

    let report = runner.run(&provider).await.expect("run should complete");

    assert!(!report.passed);
    assert_eq!(
        report.channels_with(FaultCategory::DrainSupplyShort),
        vec![2]
    );
    assert_eq!(
        report.channels_with(FaultCategory::GateSourceShort),
        vec![7]
    );
    // Channel 2 satisfies the gate-source pattern too; priority order
    // must keep it out of that list.
    assert_eq!(report.verdicts.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_load_disconnected_suppresses_adjacency_evidence() {
    let model = ElectricalModel::healthy();
    // Channel 5: unloaded (drain never moves, source in the unloaded band).
    model.set_channel(5, 800, 750, 10, 55);
    // Stimulating 5 shifts neighbor 6 on both sensors.
    model.couple(5, 6, DeviceRole::Arduino, 400);
    model.couple(5, 6, DeviceRole::Stm32, 300);
    // Stimulating 9 shifts neighbor 10 on the source sensor: a real short.
    model.couple(9, 10, DeviceRole::Stm32, 300);
    let provider = MockProvider::standard(model);
    let mut runner = make_runner(Arc::new(NullPresenter));

    let report = runner.run(&provider).await.expect("run should complete");

    assert!(!report.passed);
    assert_eq!(
        report.channels_with(FaultCategory::LoadDisconnected),
        vec![5]
    );
    // Nothing mentioning the unloaded channel survives the filter.
    assert!(report
        .adjacency_faults
        .iter()
        .all(|f| !f.mentions(5)));
    // The genuine coupling elsewhere does survive.
    assert!(report
        .adjacency_faults
        .iter()
        .any(|f| f.device == DeviceRole::Stm32 && f.stimulated == 9 && f.neighbor == 10));
}

#[tokio::test(start_paused = true)]
async fn test_wrong_role_answer_aborts_the_scan() {
    let model = ElectricalModel::healthy();
    let provider = MockProvider {
        model,
        ports: vec![("ttyFIX0".to_string(), PortKind::ChattyBinary)],
    };
    let mut runner = make_runner(Arc::new(NullPresenter));

    let err = runner.run(&provider).await.unwrap_err();
    match err {
        WorkflowError::WrongDevice { port, expected } => {
            assert_eq!(port, "ttyFIX0");
            assert_eq!(expected, DeviceRole::Arduino);
        }
        other => panic!("expected WrongDevice, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_no_connectable_port_is_a_distinct_failure() {
    let provider = MockProvider {
        model: ElectricalModel::healthy(),
        ports: Vec::new(),
    };
    let mut runner = make_runner(Arc::new(NullPresenter));

    let err = runner.run(&provider).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::NoDevice { role: DeviceRole::Arduino }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_confirmation_is_retried() {
    let model = ElectricalModel::healthy();
    model.set_drop_confirms(1);
    let provider = MockProvider::standard(model);
    let mut runner = make_runner(Arc::new(NullPresenter));

    let report = runner.run(&provider).await.expect("retry should recover");
    assert!(report.passed);
}

/// Presenter that cancels the run when a given status appears.
struct CancelOnStatus {
    needle: &'static str,
    token: OnceLock<CancelToken>,
    fired: AtomicBool,
}

impl Presenter for CancelOnStatus {
    fn on_status(&self, status: &str, _progress: f32) {
        if status.contains(self.needle) && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(token) = self.token.get() {
                token.cancel();
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_the_run_and_snapshots() {
    let model = ElectricalModel::healthy();
    let provider = MockProvider::standard(model);

    let presenter = Arc::new(CancelOnStatus {
        needle: "testing channel 3",
        token: OnceLock::new(),
        fired: AtomicBool::new(false),
    });
    let mut runner = TestRunner::new(full_fixture(), TestLimits::default(), presenter.clone());
    presenter.token.set(runner.cancel_token()).ok().unwrap();

    let err = runner.run(&provider).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Cancelled));

    let report = runner.last_report().expect("cancelled run still snapshots");
    assert!(report.cancelled);
    assert!(!report.passed);
}

/// Presenter that reports each step-mode snapshot's channel.
struct StepRecorder {
    notes: mpsc::UnboundedSender<u8>,
}

impl Presenter for StepRecorder {
    fn on_step(&self, snapshot: &StepSnapshot) {
        let _ = self.notes.send(snapshot.channel);
    }
}

#[tokio::test(start_paused = true)]
async fn test_step_mode_supports_backward_navigation() {
    let model = ElectricalModel::healthy();
    let provider = MockProvider::standard(model);

    let (notes_tx, mut notes_rx) = mpsc::unbounded_channel();
    let mut limits = TestLimits::default();
    limits.step_mode = true;
    let mut runner = TestRunner::new(
        full_fixture(),
        limits,
        Arc::new(StepRecorder { notes: notes_tx }),
    );
    let commands = runner.step_handle();

    // Driver: step back once when channel 1 first shows, otherwise keep
    // advancing. Collect the sequence of shown snapshots.
    let driver = tokio::spawn(async move {
        let mut shown = Vec::new();
        let mut did_back = false;
        while let Some(channel) = notes_rx.recv().await {
            shown.push(channel);
            let command = if channel == 1 && !did_back {
                did_back = true;
                StepCommand::Back
            } else {
                StepCommand::Next
            };
            if commands.send(command).is_err() {
                break;
            }
        }
        shown
    });

    let report = runner.run(&provider).await.expect("run should complete");
    assert!(report.passed);
    drop(runner);

    let shown = driver.await.unwrap();
    // Pause for channel 1 walked back to the channel-0 snapshot and
    // forward again before resuming.
    assert_eq!(&shown[..5], &[0, 1, 0, 1, 2]);
    assert_eq!(shown.len(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_mid_run_disconnect_fails_instead_of_hanging() {
    let model = ElectricalModel::healthy();
    let provider = MockProvider {
        model,
        ports: vec![
            ("ttyFIX0".to_string(), PortKind::DyingBinary(6)),
            ("ttyFIX1".to_string(), PortKind::Text),
        ],
    };
    let mut runner = make_runner(Arc::new(NullPresenter));

    let err = runner.run(&provider).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Disconnected(_) | WorkflowError::Link(_)
    ));
    assert!(runner.last_report().is_some());
}
