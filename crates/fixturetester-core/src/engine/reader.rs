//! Paired batch reader
//!
//! Issues read commands to both devices for a range of channels and waits
//! for the store to advance past its pre-send counts: event-driven
//! polling, not fixed sleeps. Channels whose data never arrives get a
//! bounded retry pass; what is still missing afterwards is reported, not
//! fatal. The whole operation is cancellable between channels and its
//! worst-case duration is `channels × (1 + max_retries) × per-attempt
//! timeout`.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::TestLimits;
use crate::engine::{CancelToken, Presenter};
use crate::link::transport::{BinaryLink, LinkError, TextLink};
use crate::profile::{DeviceRole, ReadingState};
use crate::store::ReadingStore;

/// Why a batch read stopped early.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("cancelled")]
    Cancelled,
}

/// Channels that still had no data from one or both devices when the
/// retry budget ran out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub missing: Vec<u8>,
}

/// Borrowed view over everything a batch read needs.
pub struct BatchReader<'a> {
    pub arduino: &'a TextLink,
    pub stm32: &'a BinaryLink,
    pub store: &'a ReadingStore,
    pub limits: &'a TestLimits,
    pub cancel: &'a CancelToken,
    pub presenter: &'a dyn Presenter,
}

impl BatchReader<'_> {
    /// Read every channel in `channels` from both devices for the given
    /// state: one paired attempt each (phase 1), then up to
    /// `read_max_retries` passes over whatever is still missing (phase 2).
    pub async fn read_channels(
        &self,
        channels: &[u8],
        state: ReadingState,
    ) -> Result<BatchOutcome, BatchError> {
        let mut missing = Vec::new();
        for &channel in channels {
            if self.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            self.presenter.on_channel_active(channel);
            if !self.paired_attempt(channel, state, self.limits.hardware_wait_ms).await? {
                missing.push(channel);
            }
        }

        for pass in 1..=self.limits.read_max_retries {
            if missing.is_empty() {
                break;
            }
            debug!(pass, missing = ?missing, "retrying channels without data");
            let mut still_missing = Vec::new();
            for &channel in &missing {
                if self.cancel.is_cancelled() {
                    return Err(BatchError::Cancelled);
                }
                self.presenter.on_channel_active(channel);
                if !self.paired_attempt(channel, state, self.limits.hardware_wait_ms).await? {
                    still_missing.push(channel);
                }
            }
            missing = still_missing;
        }

        if !missing.is_empty() {
            debug!(missing = ?missing, "channels never answered");
        }
        Ok(BatchOutcome { missing })
    }

    /// One paired read of a single channel with a custom wait cap; used
    /// for the stimulated channel's running capture.
    pub async fn paired_attempt(
        &self,
        channel: u8,
        state: ReadingState,
        timeout_ms: u64,
    ) -> Result<bool, BatchError> {
        let arduino_before = self.store.count(DeviceRole::Arduino, state, channel);
        let stm32_before = self.store.count(DeviceRole::Stm32, state, channel);

        self.arduino.send_read(channel).await?;
        self.stm32.send_read(channel).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let arduino_ok = self.store.count(DeviceRole::Arduino, state, channel) > arduino_before;
            let stm32_ok = self.store.count(DeviceRole::Stm32, state, channel) > stm32_before;
            if arduino_ok && stm32_ok {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                trace!(channel, %state, "paired read timed out");
                return Ok(false);
            }
            let poll = Duration::from_millis(self.limits.read_poll_interval_ms)
                .min(deadline - now);
            tokio::time::sleep(poll).await;
        }
    }

    /// Neighbor probe: re-read one idle channel from both devices with up
    /// to `probe_max_resends` sends inside a single cumulative deadline.
    /// Partial results are fine (the two devices are compared
    /// independently), so each side reports its fresh value only if one
    /// actually arrived.
    pub async fn probe_neighbor(
        &self,
        channel: u8,
    ) -> Result<(Option<i32>, Option<i32>), BatchError> {
        let state = ReadingState::Idle;
        let arduino_before = self.store.count(DeviceRole::Arduino, state, channel);
        let stm32_before = self.store.count(DeviceRole::Stm32, state, channel);

        let resends = self.limits.probe_max_resends.max(1);
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.limits.probe_total_wait_ms);
        let slice = Duration::from_millis(self.limits.probe_total_wait_ms / u64::from(resends));

        'attempts: for _ in 0..resends {
            if self.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            self.arduino.send_read(channel).await?;
            self.stm32.send_read(channel).await?;

            let attempt_deadline = (tokio::time::Instant::now() + slice).min(deadline);
            loop {
                let arduino_ok =
                    self.store.count(DeviceRole::Arduino, state, channel) > arduino_before;
                let stm32_ok = self.store.count(DeviceRole::Stm32, state, channel) > stm32_before;
                if arduino_ok && stm32_ok {
                    break 'attempts;
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break 'attempts;
                }
                if now >= attempt_deadline {
                    break;
                }
                let poll = Duration::from_millis(self.limits.read_poll_interval_ms)
                    .min(attempt_deadline - now);
                tokio::time::sleep(poll).await;
            }
        }

        let fresh_arduino = (self.store.count(DeviceRole::Arduino, state, channel)
            > arduino_before)
            .then(|| self.store.latest(DeviceRole::Arduino, state, channel))
            .flatten();
        let fresh_stm32 = (self.store.count(DeviceRole::Stm32, state, channel) > stm32_before)
            .then(|| self.store.latest(DeviceRole::Stm32, state, channel))
            .flatten();
        Ok((fresh_arduino, fresh_stm32))
    }

    /// Arduino-only read with the standard retry budget; used for the
    /// sensor sweep where the STM32 has no matching channel.
    pub async fn read_arduino(&self, channel: u8) -> Result<Option<i32>, BatchError> {
        let state = ReadingState::Idle;
        for _ in 0..=self.limits.read_max_retries {
            if self.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            let before = self.store.count(DeviceRole::Arduino, state, channel);
            self.arduino.send_read(channel).await?;

            let deadline =
                tokio::time::Instant::now() + Duration::from_millis(self.limits.hardware_wait_ms);
            loop {
                if self.store.count(DeviceRole::Arduino, state, channel) > before {
                    return Ok(self.store.latest(DeviceRole::Arduino, state, channel));
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                let poll = Duration::from_millis(self.limits.read_poll_interval_ms)
                    .min(deadline - now);
                tokio::time::sleep(poll).await;
            }
        }
        Ok(None)
    }
}
