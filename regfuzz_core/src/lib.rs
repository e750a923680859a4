pub mod arena;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod findings;
pub mod guard;
pub mod harness;
pub mod limits;
pub mod progress;
pub mod signals;
pub mod target;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use arena::{Arena, ArenaNode, MemoryCounters};
pub use cancel::{CancelReason, CancellationHook, InterruptKind, InterruptState, StackDepthProbe};
pub use classify::{Category, ErrorRecord, SqlState, classify};
pub use config::HarnessConfig;
pub use driver::{DriverOptions, FindingLog, FuzzEngine, FuzzTarget, RandomDriver, drive};
pub use engine::{EngineError, IsolationError, QueryEngine};
pub use error::HarnessError;
pub use executor::{
    ExecutionCounters, HarnessContext, ProcessTerminator, Terminator, TrialExecutor, TrialOutcome,
};
pub use findings::{FindingReporter, FindingSink, SessionFlag};
pub use guard::{RepeatGuard, RepeatState, Verdict};
pub use harness::{Harness, MAX_RUNS};
pub use limits::ResourceLimiter;
pub use progress::ProgressReporter;
pub use target::PatternQueryEngine;
pub use watchdog::{MemoryBudget, REGEX_MEMORY_FINDING};
