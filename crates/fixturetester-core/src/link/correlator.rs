//! GPIO command confirmation correlator
//!
//! GPIO state changes must never be assumed to have taken effect without
//! device acknowledgment; a missed confirmation would corrupt every
//! downstream idle/running comparison. Confirmable commands are strictly
//! serialized, so the table holds exactly one slot: the currently pending
//! `(opcode, mask)` expectation. The transport's inbound parser completes
//! it via [`Correlator::confirm`]; non-matching or late confirmations are
//! dropped.

use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::protocol::frame::ChannelMask;

#[derive(Debug)]
struct Pending {
    opcode: u8,
    mask: ChannelMask,
    tx: oneshot::Sender<()>,
}

/// Single-slot request/confirmation correlation table.
#[derive(Debug, Default)]
pub struct Correlator {
    slot: Mutex<Option<Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the expectation for an outgoing confirmable command.
    ///
    /// Returns the receiver the sender loop awaits. Registering while a
    /// command is already pending is a programming error (confirmable
    /// commands are serialized); the stale expectation is replaced so
    /// release builds degrade to dropping the older wait.
    pub fn register(&self, opcode: u8, mask: ChannelMask) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slot_lock();
        debug_assert!(
            slot.is_none(),
            "confirmable command registered while another is pending"
        );
        *slot = Some(Pending { opcode, mask, tx });
        rx
    }

    /// Deliver an inbound confirmation. Completes the pending wait iff
    /// `(opcode, mask)` matches the registered expectation; anything else
    /// is dropped.
    pub fn confirm(&self, opcode: u8, mask: ChannelMask) {
        let mut slot = self.slot_lock();
        let matches = slot
            .as_ref()
            .map(|p| p.opcode == opcode && p.mask == mask)
            .unwrap_or(false);
        if matches {
            if let Some(pending) = slot.take() {
                // Receiver may have timed out and been dropped; that is a
                // late confirmation and is equally ignorable.
                let _ = pending.tx.send(());
            }
        } else {
            trace!(
                opcode,
                mask = format_args!("{:#08x}", mask.key()),
                "dropped unmatched confirmation"
            );
        }
    }

    /// Drop the pending expectation, if any, waking its waiter with a
    /// closed-channel error. Called when the command times out for good or
    /// the device disconnects; in-flight waits must fail immediately
    /// rather than hang.
    pub fn abort(&self) {
        if let Some(pending) = self.slot_lock().take() {
            debug!(
                opcode = pending.opcode,
                mask = format_args!("{:#08x}", pending.mask.key()),
                "aborted pending confirmation"
            );
            // Dropping the sender completes the receiver with an error.
        }
    }

    /// Whether an expectation is currently registered.
    pub fn has_pending(&self) -> bool {
        self.slot_lock().is_some()
    }

    fn slot_lock(&self) -> std::sync::MutexGuard<'_, Option<Pending>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::opcode;

    #[tokio::test]
    async fn test_matching_confirmation_completes_wait() {
        let correlator = Correlator::new();
        let mask = ChannelMask::single(3);
        let rx = correlator.register(opcode::GPIO_ON, mask);
        correlator.confirm(opcode::GPIO_ON, mask);
        assert!(rx.await.is_ok());
        assert!(!correlator.has_pending());
    }

    #[tokio::test]
    async fn test_mismatched_confirmation_is_dropped() {
        let correlator = Correlator::new();
        let rx = correlator.register(opcode::GPIO_ON, ChannelMask::single(3));

        // Wrong mask, then wrong opcode: neither completes the wait.
        correlator.confirm(opcode::GPIO_ON, ChannelMask::single(4));
        correlator.confirm(opcode::GPIO_OFF, ChannelMask::single(3));
        assert!(correlator.has_pending());

        correlator.confirm(opcode::GPIO_ON, ChannelMask::single(3));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_fails_the_wait() {
        let correlator = Correlator::new();
        let rx = correlator.register(opcode::GPIO_OFF, ChannelMask::all(18));
        correlator.abort();
        assert!(rx.await.is_err());
        assert!(!correlator.has_pending());
    }

    #[test]
    fn test_late_confirmation_without_pending_is_ignored() {
        let correlator = Correlator::new();
        // Must not panic or register anything.
        correlator.confirm(opcode::GPIO_ON, ChannelMask::single(0));
        assert!(!correlator.has_pending());
    }
}
