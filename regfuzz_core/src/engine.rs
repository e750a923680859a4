//! Boundary to the query engine under test.
//!
//! The harness never looks inside the engine. It needs a way to prepare the fuzzed
//! statement once, to run it inside nested rollback-capable scopes, and a handful
//! of knobs (statement timeout, cancellation hook, arenas). Everything else belongs
//! to the engine.

use crate::arena::Arena;
use crate::cancel::{CancellationHook, InterruptState};
use crate::classify::SqlState;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// An error raised by the engine while preparing or executing a statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (SQLSTATE {code})")]
pub struct EngineError {
    pub code: SqlState,
    pub message: String,
}

impl EngineError {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The nested execution machinery itself failed. The harness cannot continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("could not connect to the executor: {0}")]
    Connect(String),
    #[error("could not begin nested scope: {0}")]
    Begin(String),
    #[error("could not release nested scope: {0}")]
    Release(String),
    #[error("could not roll back nested scope: {0}")]
    Rollback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    Text(String),
}

/// Result of a statement that completed without raising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Select { rows: usize },
    Utility { tag: String },
}

/// Opaque identity of the allocation and ownership scopes current at some point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken {
    pub allocation: u64,
    pub ownership: u64,
}

/// A query engine the harness can drive one trial at a time.
pub trait QueryEngine {
    type Plan;

    /// Enters the engine's statement execution context for a fuzz run.
    fn connect(&mut self) -> Result<(), IsolationError>;
    /// Leaves the execution context entered by [`QueryEngine::connect`].
    fn finish(&mut self);

    fn prepare(&mut self, query: &str, param_types: &[ParamType])
    -> Result<Self::Plan, EngineError>;
    fn plan_arg_count(&self, plan: &Self::Plan) -> usize;
    /// Runs the plan. Rows produced are discarded by the engine when `max_rows` is 0.
    fn execute_plan(
        &mut self,
        plan: &Self::Plan,
        params: &[Datum],
        read_only: bool,
        max_rows: usize,
    ) -> Result<ExecOutcome, EngineError>;

    fn current_scope(&self) -> ScopeToken;
    fn restore_allocation_scope(&mut self, token: ScopeToken);
    fn restore_ownership_scope(&mut self, token: ScopeToken);
    fn begin_nested(&mut self) -> Result<(), IsolationError>;
    fn release_nested(&mut self) -> Result<(), IsolationError>;
    fn rollback_nested(&mut self) -> Result<(), IsolationError>;

    /// Cooperative interrupt checkpoint. Consumes a pending interrupt and raises it.
    fn check_for_interrupts(&mut self) -> Result<(), EngineError>;
    fn interrupts(&self) -> Arc<InterruptState>;
    fn set_statement_timeout(&mut self, timeout: Duration);
    fn install_cancel_hook(&mut self, hook: CancellationHook);

    /// Root of the engine's arena tree.
    fn top_arena(&self) -> Arena;
    /// Arena the pattern matcher allocates from, if the engine has one.
    fn pattern_arena(&self) -> Option<Arena>;
}
