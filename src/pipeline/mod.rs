//! Presentation scheduling and pipeline statistics

pub mod jit;
pub mod stats;
pub mod vblank;

pub use jit::{CycleOutcome, JitScheduler, RunReport};
pub use stats::{PipelineEvent, PipelineStats, StatsHandle, StatsRecorder};
pub use vblank::{RefreshClock, VblankClock};
