//! Test limits and timing parameters
//!
//! Every threshold, retry count, and settle time the engine consults lives
//! in [`TestLimits`]. The struct is a read-mostly snapshot for the duration
//! of a run: the shell loads/saves it (JSON with per-field defaults so
//! partial files still parse), the engine only reads it.

use serde::{Deserialize, Serialize};

/// Inclusive pass band for a sensed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdRange {
    /// Lower bound (inclusive)
    pub min: i32,
    /// Upper bound (inclusive)
    pub max: i32,
}

impl ThresholdRange {
    /// Create a new range. `min` must not exceed `max`.
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Whether `value` falls inside the band (inclusive on both ends).
    pub fn contains(&self, value: i32) -> bool {
        self.min <= value && value <= self.max
    }
}

impl std::fmt::Display for ThresholdRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

fn default_confirm_retry_interval_ms() -> u64 {
    100
}

fn default_confirm_max_retries() -> u32 {
    5
}

fn default_read_poll_interval_ms() -> u64 {
    50
}

fn default_hardware_wait_ms() -> u64 {
    300
}

fn default_read_max_retries() -> u32 {
    5
}

fn default_running_read_timeout_ms() -> u64 {
    500
}

fn default_probe_max_resends() -> u32 {
    5
}

fn default_probe_total_wait_ms() -> u64 {
    800
}

fn default_adjacency_delta() -> i32 {
    100
}

fn default_skip_tested_pairs() -> bool {
    true
}

fn default_arduino_saturation() -> i32 {
    1000
}

fn default_arduino_near_zero() -> i32 {
    100
}

fn default_gate_drain_arduino_running() -> ThresholdRange {
    ThresholdRange::new(350, 480)
}

fn default_gate_drain_stm32_running() -> ThresholdRange {
    ThresholdRange::new(420, 570)
}

fn default_drain_source_arduino() -> ThresholdRange {
    ThresholdRange::new(25, 60)
}

fn default_drain_source_stm32() -> ThresholdRange {
    ThresholdRange::new(330, 375)
}

fn default_load_disc_arduino_delta() -> i32 {
    180
}

fn default_load_disc_stm32_running() -> ThresholdRange {
    ThresholdRange::new(40, 70)
}

fn default_arduino_idle_normal_min() -> i32 {
    700
}

fn default_gate_ground_stm32_idle_max() -> i32 {
    50
}

fn default_gate_ground_stm32_running_max() -> i32 {
    100
}

fn default_gate_source_stm32_running_min() -> i32 {
    400
}

fn default_gate_source_stm32_idle_max() -> i32 {
    50
}

fn default_wire_fault_arduino_delta() -> i32 {
    100
}

fn default_arduino_idle_range() -> ThresholdRange {
    ThresholdRange::new(700, 1023)
}

fn default_arduino_running_range() -> ThresholdRange {
    ThresholdRange::new(25, 480)
}

fn default_stm32_idle_range() -> ThresholdRange {
    ThresholdRange::new(0, 50)
}

fn default_stm32_running_range() -> ThresholdRange {
    ThresholdRange::new(300, 400)
}

fn default_pressure_range() -> ThresholdRange {
    ThresholdRange::new(200, 800)
}

fn default_temperature_range() -> ThresholdRange {
    ThresholdRange::new(100, 600)
}

fn default_flow_range() -> ThresholdRange {
    ThresholdRange::new(300, 700)
}

fn default_pressure_settle_ms() -> u64 {
    400
}

fn default_temperature_settle_ms() -> u64 {
    1000
}

fn default_flow_settle_ms() -> u64 {
    400
}

fn default_step_mode() -> bool {
    false
}

/// Thresholds and timing parameters for one test run.
///
/// Variant-specific tuning (retry counts, fault bands) is configuration
/// data, not code: different fixture profiles share this one struct and
/// shells may persist per-profile files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLimits {
    // --- command confirmation (GPIO ON/OFF) ---
    /// Wait per confirmation attempt before resending, in milliseconds
    #[serde(default = "default_confirm_retry_interval_ms")]
    pub confirm_retry_interval_ms: u64,
    /// Total send attempts for a confirmable command
    #[serde(default = "default_confirm_max_retries")]
    pub confirm_max_retries: u32,

    // --- batch reads ---
    /// Store polling interval while waiting for paired readings, in milliseconds
    #[serde(default = "default_read_poll_interval_ms")]
    pub read_poll_interval_ms: u64,
    /// Per-attempt wait for the hardware to answer a read, in milliseconds
    #[serde(default = "default_hardware_wait_ms")]
    pub hardware_wait_ms: u64,
    /// Re-send passes over channels still missing data after phase 1
    #[serde(default = "default_read_max_retries")]
    pub read_max_retries: u32,
    /// Cap on the event-driven wait for a stimulated channel's running value
    #[serde(default = "default_running_read_timeout_ms")]
    pub running_read_timeout_ms: u64,

    // --- adjacency probing ---
    /// Resend attempts for a single neighbor probe
    #[serde(default = "default_probe_max_resends")]
    pub probe_max_resends: u32,
    /// Cumulative wait budget for a single neighbor probe, in milliseconds
    #[serde(default = "default_probe_total_wait_ms")]
    pub probe_total_wait_ms: u64,
    /// Max |fresh - baseline| before a neighbor counts as shorted
    #[serde(default = "default_adjacency_delta")]
    pub adjacency_delta: i32,
    /// Skip re-probing a pin pair already tested from either side
    #[serde(default = "default_skip_tested_pairs")]
    pub skip_tested_pairs: bool,

    // --- fault classifier ---
    /// Arduino reading above this on both states means drain-supply short
    #[serde(default = "default_arduino_saturation")]
    pub arduino_saturation: i32,
    /// Arduino idle readings below this count as near-zero
    #[serde(default = "default_arduino_near_zero")]
    pub arduino_near_zero: i32,
    /// Arduino running band for the gate-drain signature
    #[serde(default = "default_gate_drain_arduino_running")]
    pub gate_drain_arduino_running: ThresholdRange,
    /// STM32 running band for the gate-drain signature
    #[serde(default = "default_gate_drain_stm32_running")]
    pub gate_drain_stm32_running: ThresholdRange,
    /// Arduino band an idle reading falls into for the drain-source signature
    #[serde(default = "default_drain_source_arduino")]
    pub drain_source_arduino: ThresholdRange,
    /// STM32 band an idle reading falls into for the drain-source signature
    #[serde(default = "default_drain_source_stm32")]
    pub drain_source_stm32: ThresholdRange,
    /// Max |idle - running| on the Arduino side for load-disconnected
    #[serde(default = "default_load_disc_arduino_delta")]
    pub load_disc_arduino_delta: i32,
    /// Abnormal STM32 running band for load-disconnected
    #[serde(default = "default_load_disc_stm32_running")]
    pub load_disc_stm32_running: ThresholdRange,
    /// Floor of the normal Arduino idle region
    #[serde(default = "default_arduino_idle_normal_min")]
    pub arduino_idle_normal_min: i32,
    /// STM32 idle ceiling for the gate-ground signature
    #[serde(default = "default_gate_ground_stm32_idle_max")]
    pub gate_ground_stm32_idle_max: i32,
    /// STM32 running ceiling for the gate-ground signature
    #[serde(default = "default_gate_ground_stm32_running_max")]
    pub gate_ground_stm32_running_max: i32,
    /// STM32 running floor for the gate-source signature
    #[serde(default = "default_gate_source_stm32_running_min")]
    pub gate_source_stm32_running_min: i32,
    /// STM32 idle ceiling for the gate-source signature
    #[serde(default = "default_gate_source_stm32_idle_max")]
    pub gate_source_stm32_idle_max: i32,
    /// Max |idle - running| on the Arduino side for the wire-fault signature
    #[serde(default = "default_wire_fault_arduino_delta")]
    pub wire_fault_arduino_delta: i32,

    // --- pass/fail bands ---
    /// Expected Arduino idle band
    #[serde(default = "default_arduino_idle_range")]
    pub arduino_idle_range: ThresholdRange,
    /// Expected Arduino running band
    #[serde(default = "default_arduino_running_range")]
    pub arduino_running_range: ThresholdRange,
    /// Expected STM32 idle band
    #[serde(default = "default_stm32_idle_range")]
    pub stm32_idle_range: ThresholdRange,
    /// Expected STM32 running band
    #[serde(default = "default_stm32_running_range")]
    pub stm32_running_range: ThresholdRange,
    /// Expected pressure sensor band
    #[serde(default = "default_pressure_range")]
    pub pressure_range: ThresholdRange,
    /// Expected temperature sensor band
    #[serde(default = "default_temperature_range")]
    pub temperature_range: ThresholdRange,
    /// Expected flow sensor band (while flow is enabled)
    #[serde(default = "default_flow_range")]
    pub flow_range: ThresholdRange,

    // --- sensor settle times ---
    /// Pressure sensor settle before the value is trustworthy, in milliseconds
    #[serde(default = "default_pressure_settle_ms")]
    pub pressure_settle_ms: u64,
    /// Temperature sensor settle (conversion time), in milliseconds
    #[serde(default = "default_temperature_settle_ms")]
    pub temperature_settle_ms: u64,
    /// Flow spin-up settle after enable and between reads, in milliseconds
    #[serde(default = "default_flow_settle_ms")]
    pub flow_settle_ms: u64,

    // --- workflow ---
    /// Pause after each adjacency sub-test for manual inspection
    #[serde(default = "default_step_mode")]
    pub step_mode: bool,
}

impl Default for TestLimits {
    fn default() -> Self {
        Self {
            confirm_retry_interval_ms: default_confirm_retry_interval_ms(),
            confirm_max_retries: default_confirm_max_retries(),
            read_poll_interval_ms: default_read_poll_interval_ms(),
            hardware_wait_ms: default_hardware_wait_ms(),
            read_max_retries: default_read_max_retries(),
            running_read_timeout_ms: default_running_read_timeout_ms(),
            probe_max_resends: default_probe_max_resends(),
            probe_total_wait_ms: default_probe_total_wait_ms(),
            adjacency_delta: default_adjacency_delta(),
            skip_tested_pairs: default_skip_tested_pairs(),
            arduino_saturation: default_arduino_saturation(),
            arduino_near_zero: default_arduino_near_zero(),
            gate_drain_arduino_running: default_gate_drain_arduino_running(),
            gate_drain_stm32_running: default_gate_drain_stm32_running(),
            drain_source_arduino: default_drain_source_arduino(),
            drain_source_stm32: default_drain_source_stm32(),
            load_disc_arduino_delta: default_load_disc_arduino_delta(),
            load_disc_stm32_running: default_load_disc_stm32_running(),
            arduino_idle_normal_min: default_arduino_idle_normal_min(),
            gate_ground_stm32_idle_max: default_gate_ground_stm32_idle_max(),
            gate_ground_stm32_running_max: default_gate_ground_stm32_running_max(),
            gate_source_stm32_running_min: default_gate_source_stm32_running_min(),
            gate_source_stm32_idle_max: default_gate_source_stm32_idle_max(),
            wire_fault_arduino_delta: default_wire_fault_arduino_delta(),
            arduino_idle_range: default_arduino_idle_range(),
            arduino_running_range: default_arduino_running_range(),
            stm32_idle_range: default_stm32_idle_range(),
            stm32_running_range: default_stm32_running_range(),
            pressure_range: default_pressure_range(),
            temperature_range: default_temperature_range(),
            flow_range: default_flow_range(),
            pressure_settle_ms: default_pressure_settle_ms(),
            temperature_settle_ms: default_temperature_settle_ms(),
            flow_settle_ms: default_flow_settle_ms(),
            step_mode: default_step_mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains_is_inclusive() {
        let range = ThresholdRange::new(350, 480);
        assert!(range.contains(350));
        assert!(range.contains(480));
        assert!(range.contains(400));
        assert!(!range.contains(349));
        assert!(!range.contains(481));
    }

    #[test]
    fn test_default_limits_match_documented_values() {
        let limits = TestLimits::default();
        assert_eq!(limits.confirm_retry_interval_ms, 100);
        assert_eq!(limits.confirm_max_retries, 5);
        assert_eq!(limits.read_poll_interval_ms, 50);
        assert_eq!(limits.hardware_wait_ms, 300);
        assert_eq!(limits.probe_total_wait_ms, 800);
        assert_eq!(limits.adjacency_delta, 100);
        assert_eq!(limits.arduino_saturation, 1000);
        assert_eq!(limits.load_disc_arduino_delta, 180);
        assert_eq!(limits.gate_drain_arduino_running, ThresholdRange::new(350, 480));
        assert_eq!(limits.drain_source_stm32, ThresholdRange::new(330, 375));
        assert!(limits.temperature_settle_ms >= 1000);
        assert!(!limits.step_mode);
    }

    #[test]
    fn test_partial_json_uses_field_defaults() {
        let json = r#"{"adjacency_delta": 55, "step_mode": true}"#;
        let limits: TestLimits = serde_json::from_str(json).unwrap();
        assert_eq!(limits.adjacency_delta, 55);
        assert!(limits.step_mode);
        assert_eq!(limits.confirm_max_retries, 5);
        assert_eq!(limits.gate_drain_stm32_running, ThresholdRange::new(420, 570));
    }

    #[test]
    fn test_round_trip() {
        let mut limits = TestLimits::default();
        limits.hardware_wait_ms = 250;
        limits.flow_range = ThresholdRange::new(100, 200);
        let json = serde_json::to_string(&limits).unwrap();
        let loaded: TestLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.hardware_wait_ms, 250);
        assert_eq!(loaded.flow_range, ThresholdRange::new(100, 200));
    }
}
