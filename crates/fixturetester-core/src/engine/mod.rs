//! Test orchestration engine
//!
//! - [`workflow`]: the phase state machine driving a run
//! - [`reader`]: paired batch reads with bounded retry
//! - [`adjacency`]: neighbor short-circuit probing
//! - [`classifier`]: the pure fault rule chain
//! - [`session`]: run-scoped state and the final report

pub mod adjacency;
pub mod classifier;
pub mod reader;
pub mod session;
pub mod workflow;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::engine::session::{StepSnapshot, TestReport};

/// Cooperative cancellation handle, checked at the top of every loop the
/// workflow runs and selected against during settle waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Reset for a new run.
    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Completes once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Progress/result sink a shell implements. The engine never renders
/// anything itself.
pub trait Presenter: Send + Sync {
    /// Workflow progress: status text plus a 0.0..=1.0 fraction.
    fn on_status(&self, _status: &str, _progress: f32) {}

    /// The channel currently being read, for live highlighting.
    fn on_channel_active(&self, _channel: u8) {}

    /// A step-mode pause is showing this snapshot.
    fn on_step(&self, _snapshot: &StepSnapshot) {}

    /// The run finished (or was cancelled) with this report.
    fn on_report(&self, _report: &TestReport) {}
}

/// Presenter that discards everything; useful headless and in tests.
#[derive(Debug, Default)]
pub struct NullPresenter;

impl Presenter for NullPresenter {}
