//! Fixturetester Core - Test orchestration and fault diagnosis engine
//!
//! Drives automated electrical testing of multi-channel hardware fixtures
//! over two independent serial links: a line-oriented text protocol
//! (Arduino role) and a binary checksum-framed protocol (STM32 role).
//! A run captures idle baselines and stimulated readings for every
//! channel, probes physically adjacent pins for cross-talk, classifies
//! electrical faults from numeric thresholds, and emits an aggregate
//! pass/fail report.
//!
//! Shells supply the externals: a [`link::ports::PortProvider`] for port
//! enumeration, a [`engine::Presenter`] for progress/result rendering,
//! and a persisted [`config::TestLimits`] snapshot. The engine itself
//! never enumerates hardware, renders output, or touches the filesystem.

pub mod config;
pub mod engine;
pub mod link;
pub mod profile;
pub mod protocol;
pub mod store;

pub use config::{TestLimits, ThresholdRange};
pub use engine::classifier::FaultCategory;
pub use engine::session::{TestReport, TestSession};
pub use engine::workflow::{StepCommand, TestRunner, WorkflowError};
pub use engine::{CancelToken, NullPresenter, Presenter};
pub use profile::{DeviceProfile, DeviceRole, ReadingState};
pub use store::ReadingStore;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
