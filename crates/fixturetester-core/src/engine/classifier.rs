//! Electrical fault classifier
//!
//! Classifies one channel from four numbers: the Arduino (drain-side) and
//! STM32 (source-side) readings in the idle and running states. Rules run
//! in strict priority order and the first match wins; a rule can only
//! match when every reading it consults is present. No data yields no
//! verdict, never a guessed one.
//!
//! The function is pure: readings and limits in, verdict out.

use serde::Serialize;

use crate::config::TestLimits;

/// Fault kinds, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FaultCategory {
    /// Drain shorted to the supply rail: Arduino saturated in both states
    DrainSupplyShort,
    /// Gate shorted to drain
    GateDrainShort,
    /// Drain shorted to source: idle readings look like running readings
    DrainSourceShort,
    /// Drain shorted to ground
    DrainGroundShort,
    /// No load connected; the channel is excluded from short attribution
    LoadDisconnected,
    /// Gate shorted to ground
    GateGroundShort,
    /// Gate shorted to source
    GateSourceShort,
    /// One sensor saw the actuation, the other did not: miswired channel
    WireFault,
}

impl std::fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultCategory::DrainSupplyShort => "drain-supply short",
            FaultCategory::GateDrainShort => "gate-drain short",
            FaultCategory::DrainSourceShort => "drain-source short",
            FaultCategory::DrainGroundShort => "drain-ground short",
            FaultCategory::LoadDisconnected => "load disconnected",
            FaultCategory::GateGroundShort => "gate-ground short",
            FaultCategory::GateSourceShort => "gate-source short",
            FaultCategory::WireFault => "wire fault",
        };
        f.write_str(label)
    }
}

/// The four readings a channel is judged on. Any of them may be missing
/// if the device never answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub arduino_idle: Option<i32>,
    pub arduino_running: Option<i32>,
    pub stm32_idle: Option<i32>,
    pub stm32_running: Option<i32>,
}

impl ChannelSnapshot {
    pub fn new(
        arduino_idle: Option<i32>,
        arduino_running: Option<i32>,
        stm32_idle: Option<i32>,
        stm32_running: Option<i32>,
    ) -> Self {
        Self {
            arduino_idle,
            arduino_running,
            stm32_idle,
            stm32_running,
        }
    }

    /// True when no reading at all exists for the channel.
    pub fn is_empty(&self) -> bool {
        self.arduino_idle.is_none()
            && self.arduino_running.is_none()
            && self.stm32_idle.is_none()
            && self.stm32_running.is_none()
    }
}

/// Classify one channel. Returns `None` when the readings match no fault
/// signature (the channel is electrically sound) or when the required
/// readings are absent.
pub fn classify(snapshot: &ChannelSnapshot, limits: &TestLimits) -> Option<FaultCategory> {
    // 1. Drain-supply short: saturated drain voltage in both states.
    if let (Some(a_idle), Some(a_run)) = (snapshot.arduino_idle, snapshot.arduino_running) {
        if a_idle > limits.arduino_saturation && a_run > limits.arduino_saturation {
            return Some(FaultCategory::DrainSupplyShort);
        }
    }

    // 2. Gate-drain short.
    if let (Some(a_idle), Some(a_run), Some(s_run)) = (
        snapshot.arduino_idle,
        snapshot.arduino_running,
        snapshot.stm32_running,
    ) {
        if a_idle < limits.arduino_near_zero
            && limits.gate_drain_arduino_running.contains(a_run)
            && limits.gate_drain_stm32_running.contains(s_run)
        {
            return Some(FaultCategory::GateDrainShort);
        }
    }

    // 3. Drain-source short: both idle readings sit in their running bands.
    if let (Some(a_idle), Some(s_idle)) = (snapshot.arduino_idle, snapshot.stm32_idle) {
        if limits.drain_source_arduino.contains(a_idle)
            && limits.drain_source_stm32.contains(s_idle)
        {
            return Some(FaultCategory::DrainSourceShort);
        }
    }

    // 4. Drain-ground short. Checked only after 2/3 so those signatures
    // are not swallowed by the bare near-zero test.
    if let Some(a_idle) = snapshot.arduino_idle {
        if a_idle < limits.arduino_near_zero {
            return Some(FaultCategory::DrainGroundShort);
        }
    }

    // 5. Load disconnected.
    if is_load_disconnected(snapshot, limits) {
        return Some(FaultCategory::LoadDisconnected);
    }

    // 6. Gate-ground short: drain never leaves idle, source never rises.
    if let (Some(a_idle), Some(a_run), Some(s_idle), Some(s_run)) = (
        snapshot.arduino_idle,
        snapshot.arduino_running,
        snapshot.stm32_idle,
        snapshot.stm32_running,
    ) {
        if a_idle >= limits.arduino_idle_normal_min
            && a_run >= limits.arduino_idle_normal_min
            && s_idle < limits.gate_ground_stm32_idle_max
            && s_run < limits.gate_ground_stm32_running_max
        {
            return Some(FaultCategory::GateGroundShort);
        }
    }

    // 7. Gate-source short.
    if let (Some(s_idle), Some(s_run)) = (snapshot.stm32_idle, snapshot.stm32_running) {
        if s_run > limits.gate_source_stm32_running_min
            && s_idle < limits.gate_source_stm32_idle_max
        {
            return Some(FaultCategory::GateSourceShort);
        }
    }

    // 8. Wire fault: the source sensor saw a normal actuation the drain
    // sensor never registered.
    if let (Some(a_idle), Some(a_run), Some(s_run)) = (
        snapshot.arduino_idle,
        snapshot.arduino_running,
        snapshot.stm32_running,
    ) {
        if (a_idle - a_run).abs() < limits.wire_fault_arduino_delta
            && limits.stm32_running_range.contains(s_run)
        {
            return Some(FaultCategory::WireFault);
        }
    }

    None
}

/// The load-disconnected signature on its own: the drain never moves and
/// the source current lands in the narrow unloaded band while its idle
/// value is otherwise normal.
pub fn is_load_disconnected(snapshot: &ChannelSnapshot, limits: &TestLimits) -> bool {
    if let (Some(a_idle), Some(a_run), Some(s_idle), Some(s_run)) = (
        snapshot.arduino_idle,
        snapshot.arduino_running,
        snapshot.stm32_idle,
        snapshot.stm32_running,
    ) {
        (a_idle - a_run).abs() < limits.load_disc_arduino_delta
            && limits.load_disc_stm32_running.contains(s_run)
            && limits.stm32_idle_range.contains(s_idle)
    } else {
        false
    }
}

/// Whether the stimulated channel itself showed any discernible electrical
/// change. An unloaded or dead channel produces spurious neighbor readings,
/// so adjacency probing suppresses drain-side evidence for such channels.
pub fn shows_no_actuation(snapshot: &ChannelSnapshot, limits: &TestLimits) -> bool {
    if is_load_disconnected(snapshot, limits) {
        return true;
    }
    if let (Some(a_idle), Some(a_run)) = (snapshot.arduino_idle, snapshot.arduino_running) {
        if (a_idle - a_run).abs() < limits.wire_fault_arduino_delta {
            return true;
        }
    }
    false
}
