//! Channel reading store
//!
//! Append-only time series of readings per (device, state, channel),
//! shared between the workflow and both transport reader tasks. `first()`
//! is never overwritten once a key has data, so the pristine idle baseline
//! survives later adjacency probes that re-read idle channels. Readings
//! are point-in-time snapshots; writes are plain appends, so there is no
//! read-modify-write race to guard beyond the mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::profile::{DeviceRole, ReadingState};

/// One captured reading. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReading {
    pub device: DeviceRole,
    pub channel: u8,
    pub state: ReadingState,
    pub value: i32,
    /// Strictly increasing per (device, state, channel) stream
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    series: HashMap<(DeviceRole, ReadingState, u8), Vec<ChannelReading>>,
    /// State stamped onto readings arriving from the transports
    capture_state: Option<ReadingState>,
    next_sequence: u64,
}

/// Cheaply cloneable handle to the shared store.
#[derive(Debug, Clone, Default)]
pub struct ReadingStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state stamped onto subsequently recorded readings.
    ///
    /// The workflow flips this to `Running` only for the stimulated
    /// channel's own capture window; adjacency probes of idle neighbors
    /// run with it back at `Idle`.
    pub fn set_capture_state(&self, state: ReadingState) {
        self.lock().capture_state = Some(state);
    }

    /// Current capture state (defaults to `Idle` until first set).
    pub fn capture_state(&self) -> ReadingState {
        self.lock().capture_state.unwrap_or(ReadingState::Idle)
    }

    /// Record a reading under the current capture state. Called by the
    /// transport reader tasks for every parsed inbound value.
    pub fn record(&self, device: DeviceRole, channel: u8, value: i32) {
        let mut inner = self.lock();
        let state = inner.capture_state.unwrap_or(ReadingState::Idle);
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner
            .series
            .entry((device, state, channel))
            .or_default()
            .push(ChannelReading {
                device,
                channel,
                state,
                value,
                sequence,
            });
    }

    /// Record a reading under an explicit state (tests and replays).
    pub fn record_with_state(
        &self,
        device: DeviceRole,
        state: ReadingState,
        channel: u8,
        value: i32,
    ) {
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner
            .series
            .entry((device, state, channel))
            .or_default()
            .push(ChannelReading {
                device,
                channel,
                state,
                value,
                sequence,
            });
    }

    /// Earliest reading for the tuple: the untainted baseline. Later
    /// diagnostic re-reads never change this.
    pub fn first(&self, device: DeviceRole, state: ReadingState, channel: u8) -> Option<i32> {
        self.lock()
            .series
            .get(&(device, state, channel))
            .and_then(|s| s.first())
            .map(|r| r.value)
    }

    /// Most recent reading for the tuple.
    pub fn latest(&self, device: DeviceRole, state: ReadingState, channel: u8) -> Option<i32> {
        self.lock()
            .series
            .get(&(device, state, channel))
            .and_then(|s| s.last())
            .map(|r| r.value)
    }

    /// Number of readings recorded for the tuple. The batch reader
    /// snapshots this before a send and polls for it to advance.
    pub fn count(&self, device: DeviceRole, state: ReadingState, channel: u8) -> usize {
        self.lock()
            .series
            .get(&(device, state, channel))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Full history for the tuple, oldest first.
    pub fn history(
        &self,
        device: DeviceRole,
        state: ReadingState,
        channel: u8,
    ) -> Vec<ChannelReading> {
        self.lock()
            .series
            .get(&(device, state, channel))
            .cloned()
            .unwrap_or_default()
    }

    /// Reset for a new session. Device reconnects do not clear history;
    /// only an explicit new run does, via this call.
    pub fn clear_all(&self) {
        let mut inner = self.lock();
        inner.series.clear();
        inner.capture_state = None;
        inner.next_sequence = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned store means a panic mid-append; the data is still
        // structurally sound (appends are single push operations).
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_is_idempotent_under_repeated_writes() {
        let store = ReadingStore::new();
        for value in [798, 640, 512, 30] {
            store.record_with_state(DeviceRole::Arduino, ReadingState::Idle, 4, value);
        }
        assert_eq!(store.first(DeviceRole::Arduino, ReadingState::Idle, 4), Some(798));
        assert_eq!(store.latest(DeviceRole::Arduino, ReadingState::Idle, 4), Some(30));
        assert_eq!(store.count(DeviceRole::Arduino, ReadingState::Idle, 4), 4);
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let store = ReadingStore::new();
        store.record(DeviceRole::Arduino, 0, 1);
        store.record(DeviceRole::Stm32, 0, 2);
        store.record(DeviceRole::Arduino, 0, 3);
        let a = store.history(DeviceRole::Arduino, ReadingState::Idle, 0);
        assert_eq!(a.len(), 2);
        assert!(a[0].sequence < a[1].sequence);
    }

    #[test]
    fn test_capture_state_stamps_transport_records() {
        let store = ReadingStore::new();
        store.record(DeviceRole::Stm32, 7, 10);
        store.set_capture_state(ReadingState::Running);
        store.record(DeviceRole::Stm32, 7, 345);
        store.set_capture_state(ReadingState::Idle);
        store.record(DeviceRole::Stm32, 7, 12);

        assert_eq!(store.count(DeviceRole::Stm32, ReadingState::Idle, 7), 2);
        assert_eq!(store.count(DeviceRole::Stm32, ReadingState::Running, 7), 1);
        assert_eq!(store.first(DeviceRole::Stm32, ReadingState::Idle, 7), Some(10));
        assert_eq!(store.latest(DeviceRole::Stm32, ReadingState::Running, 7), Some(345));
    }

    #[test]
    fn test_streams_are_independent_per_device_and_state() {
        let store = ReadingStore::new();
        store.record_with_state(DeviceRole::Arduino, ReadingState::Idle, 1, 700);
        store.record_with_state(DeviceRole::Stm32, ReadingState::Idle, 1, 20);
        store.record_with_state(DeviceRole::Arduino, ReadingState::Running, 1, 40);

        assert_eq!(store.first(DeviceRole::Arduino, ReadingState::Idle, 1), Some(700));
        assert_eq!(store.first(DeviceRole::Stm32, ReadingState::Idle, 1), Some(20));
        assert_eq!(store.first(DeviceRole::Arduino, ReadingState::Running, 1), Some(40));
        assert_eq!(store.first(DeviceRole::Stm32, ReadingState::Running, 1), None);
    }

    #[test]
    fn test_clear_all_resets_everything() {
        let store = ReadingStore::new();
        store.set_capture_state(ReadingState::Running);
        store.record(DeviceRole::Arduino, 0, 5);
        store.clear_all();
        assert_eq!(store.count(DeviceRole::Arduino, ReadingState::Running, 0), 0);
        assert_eq!(store.capture_state(), ReadingState::Idle);
    }
}
