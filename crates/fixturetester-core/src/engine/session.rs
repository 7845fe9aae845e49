//! Run-scoped session state and the final report
//!
//! A [`TestSession`] accumulates everything one run produces; it is
//! created on workflow start, mutated throughout, and snapshotted into a
//! [`TestReport`] on completion or cancellation. The snapshot outlives the
//! session so shells can show the last result without re-running.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{TestLimits, ThresholdRange};
use crate::engine::classifier::{ChannelSnapshot, FaultCategory};
use crate::profile::{DeviceRole, Neighbor, ReadingState};

/// Final classification for one channel. A channel carries at most one
/// category; classification is short-circuiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultVerdict {
    pub channel: u8,
    pub category: FaultCategory,
}

/// A neighbor whose reading moved while another channel was stimulated,
/// recorded per sensing device because the two have different noise
/// floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdjacencyFault {
    pub device: DeviceRole,
    /// Channel under stimulation when the shift was observed
    pub stimulated: u8,
    /// Neighbor whose value shifted off its idle baseline
    pub neighbor: u8,
    pub baseline: i32,
    pub fresh: i32,
}

impl AdjacencyFault {
    /// True when `channel` appears on either side of the pair.
    pub fn mentions(&self, channel: u8) -> bool {
        self.stimulated == channel || self.neighbor == channel
    }
}

impl std::fmt::Display for AdjacencyFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}-{}", self.device, self.stimulated, self.neighbor)
    }
}

/// Informational note for a rail neighbor; rails are never compared
/// numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RailNote {
    pub stimulated: u8,
    pub rail: Neighbor,
}

/// One neighbor comparison, kept for step-mode inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NeighborComparison {
    pub device: DeviceRole,
    pub neighbor: u8,
    pub baseline: Option<i32>,
    pub fresh: Option<i32>,
    pub shorted: bool,
}

/// Everything recorded while one channel was stimulated; the unit of
/// step-mode navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSnapshot {
    pub channel: u8,
    pub arduino_running: Option<i32>,
    pub stm32_running: Option<i32>,
    pub comparisons: Vec<NeighborComparison>,
}

/// A reading outside its configured pass band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeFailure {
    pub device: DeviceRole,
    pub channel: u8,
    pub state: ReadingState,
    /// `gpio` for channel readings, the sensor name otherwise
    pub label: String,
    pub value: i32,
    pub range: ThresholdRange,
}

/// One swept sensor's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorResult {
    pub name: String,
    pub channel: u8,
    /// Missing when the sensor never answered
    pub value: Option<i32>,
}

/// Mutable state of the run in progress.
#[derive(Debug)]
pub struct TestSession {
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub verdicts: Vec<FaultVerdict>,
    pub adjacency_faults: Vec<AdjacencyFault>,
    pub rail_notes: Vec<RailNote>,
    pub range_failures: Vec<RangeFailure>,
    pub sensors: Vec<SensorResult>,
    /// Channels with no usable data after all retries; excluded from
    /// pass/fail instead of failing it
    pub unresponsive: Vec<u8>,
    /// Per-channel stimulation snapshots for step-mode navigation
    pub snapshots: Vec<StepSnapshot>,
}

impl TestSession {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            cancelled: false,
            verdicts: Vec::new(),
            adjacency_faults: Vec::new(),
            rail_notes: Vec::new(),
            range_failures: Vec::new(),
            sensors: Vec::new(),
            unresponsive: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Channels carrying the given verdict.
    pub fn channels_with(&self, category: FaultCategory) -> Vec<u8> {
        self.verdicts
            .iter()
            .filter(|v| v.category == category)
            .map(|v| v.channel)
            .collect()
    }

    /// Note a channel that failed to produce data; deduplicated.
    pub fn note_unresponsive(&mut self, channel: u8) {
        if !self.unresponsive.contains(&channel) {
            self.unresponsive.push(channel);
        }
    }

    /// Drop adjacency evidence that mentions a load-disconnected channel
    /// on either side of the pair: an unloaded channel produces spurious
    /// neighbor readings.
    pub fn filter_adjacency_for_disconnected(&mut self) {
        let disconnected = self.channels_with(FaultCategory::LoadDisconnected);
        if disconnected.is_empty() {
            return;
        }
        self.adjacency_faults
            .retain(|fault| !disconnected.iter().any(|&ch| fault.mentions(ch)));
    }

    /// Freeze the session into its report.
    pub fn into_report(self, profile: &str, finished_at: DateTime<Utc>) -> TestReport {
        let passed = !self.cancelled
            && self.verdicts.is_empty()
            && self.adjacency_faults.is_empty()
            && self.range_failures.is_empty();
        TestReport {
            profile: profile.to_string(),
            started_at: self.started_at,
            finished_at,
            cancelled: self.cancelled,
            passed,
            verdicts: self.verdicts,
            adjacency_faults: self.adjacency_faults,
            rail_notes: self.rail_notes,
            range_failures: self.range_failures,
            sensors: self.sensors,
            unresponsive: self.unresponsive,
        }
    }
}

/// Immutable outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Aggregate verdict: no faults, no adjacency shorts, every present
    /// reading inside its band. Unresponsive channels do not fail a run.
    pub passed: bool,
    pub verdicts: Vec<FaultVerdict>,
    pub adjacency_faults: Vec<AdjacencyFault>,
    pub rail_notes: Vec<RailNote>,
    pub range_failures: Vec<RangeFailure>,
    pub sensors: Vec<SensorResult>,
    pub unresponsive: Vec<u8>,
}

impl TestReport {
    /// Channels carrying the given verdict.
    pub fn channels_with(&self, category: FaultCategory) -> Vec<u8> {
        self.verdicts
            .iter()
            .filter(|v| v.category == category)
            .map(|v| v.channel)
            .collect()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Check every present reading of a channel against its pass bands,
/// appending failures.
pub fn check_channel_ranges(
    channel: u8,
    snapshot: &ChannelSnapshot,
    limits: &TestLimits,
    out: &mut Vec<RangeFailure>,
) {
    let checks = [
        (DeviceRole::Arduino, ReadingState::Idle, snapshot.arduino_idle, limits.arduino_idle_range),
        (DeviceRole::Arduino, ReadingState::Running, snapshot.arduino_running, limits.arduino_running_range),
        (DeviceRole::Stm32, ReadingState::Idle, snapshot.stm32_idle, limits.stm32_idle_range),
        (DeviceRole::Stm32, ReadingState::Running, snapshot.stm32_running, limits.stm32_running_range),
    ];
    for (device, state, value, range) in checks {
        if let Some(value) = value {
            if !range.contains(value) {
                out.push(RangeFailure {
                    device,
                    channel,
                    state,
                    label: "gpio".to_string(),
                    value,
                    range,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacency_filter_drops_entries_mentioning_dead_channel() {
        let mut session = TestSession::new(Utc::now());
        session.verdicts.push(FaultVerdict {
            channel: 5,
            category: FaultCategory::LoadDisconnected,
        });
        session.adjacency_faults = vec![
            AdjacencyFault { device: DeviceRole::Arduino, stimulated: 5, neighbor: 6, baseline: 700, fresh: 400 },
            AdjacencyFault { device: DeviceRole::Stm32, stimulated: 4, neighbor: 5, baseline: 20, fresh: 300 },
            AdjacencyFault { device: DeviceRole::Arduino, stimulated: 8, neighbor: 9, baseline: 710, fresh: 300 },
        ];

        session.filter_adjacency_for_disconnected();

        assert_eq!(session.adjacency_faults.len(), 1);
        assert_eq!(session.adjacency_faults[0].stimulated, 8);
    }

    #[test]
    fn test_report_pass_fail_aggregation() {
        let session = TestSession::new(Utc::now());
        let report = session.into_report("full-18ch", Utc::now());
        assert!(report.passed);

        let mut session = TestSession::new(Utc::now());
        session.verdicts.push(FaultVerdict {
            channel: 2,
            category: FaultCategory::GateSourceShort,
        });
        let report = session.into_report("full-18ch", Utc::now());
        assert!(!report.passed);
        assert_eq!(report.channels_with(FaultCategory::GateSourceShort), vec![2]);
    }

    #[test]
    fn test_unresponsive_channels_do_not_fail_the_run() {
        let mut session = TestSession::new(Utc::now());
        session.unresponsive.push(11);
        let report = session.into_report("full-18ch", Utc::now());
        assert!(report.passed);
        assert_eq!(report.unresponsive, vec![11]);
    }

    #[test]
    fn test_cancelled_session_never_passes() {
        let mut session = TestSession::new(Utc::now());
        session.cancelled = true;
        let report = session.into_report("full-18ch", Utc::now());
        assert!(!report.passed);
        assert!(report.cancelled);
    }

    #[test]
    fn test_range_check_flags_out_of_band_readings() {
        let limits = TestLimits::default();
        let snapshot = ChannelSnapshot::new(Some(650), Some(36), Some(5), Some(345));
        let mut failures = Vec::new();
        check_channel_ranges(3, &snapshot, &limits, &mut failures);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].device, DeviceRole::Arduino);
        assert_eq!(failures[0].state, ReadingState::Idle);
        assert_eq!(failures[0].value, 650);
    }

    #[test]
    fn test_range_check_skips_missing_readings() {
        let limits = TestLimits::default();
        let snapshot = ChannelSnapshot::new(None, None, None, None);
        let mut failures = Vec::new();
        check_channel_ranges(0, &snapshot, &limits, &mut failures);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_adjacency_fault_display() {
        let fault = AdjacencyFault {
            device: DeviceRole::Arduino,
            stimulated: 3,
            neighbor: 4,
            baseline: 798,
            fresh: 402,
        };
        assert_eq!(fault.to_string(), "Arduino: 3-4");
    }
}
