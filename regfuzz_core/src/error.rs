use crate::engine::EngineError;
use thiserror::Error;

/// Errors surfaced by the host-invoked setup and run operations.
///
/// Trial-level engine errors never show up here; they are classified and
/// absorbed by the trial executor.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("pattern engine arena does not exist")]
    MissingPatternArena,

    #[error("unreasonable number of runs: {requested} (maximum {max})")]
    UnreasonableRunCount { requested: u64, max: u64 },

    #[error("failed to set {resource}: {source}")]
    ResourceLimit {
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to plan query: {0}")]
    Prepare(#[source] EngineError),

    #[error("query to fuzz must take precisely {expected} parameter, found {found}")]
    ParameterCount { expected: usize, found: usize },

    #[error("failed to write statistics: {0}")]
    Stats(String),
}

impl HarnessError {
    /// Errors the host aborts on instead of returning.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarnessError::ResourceLimit { .. })
    }
}
