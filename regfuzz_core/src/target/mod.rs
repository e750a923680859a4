//! Reference fuzz target: a tiny query engine whose only interesting feature is
//! regular expression matching.
//!
//! It keeps the shape the harness expects from a real engine: a long-lived
//! `RegexpContext` arena holding a cache of compiled patterns, nested savepoints
//! with their own arenas, a statement deadline, and a cancellation hook polled
//! from the matcher's inner loop.

pub mod query;
pub mod regex;

use crate::arena::Arena;
use crate::cancel::{CancelReason, CancellationHook, InterruptState};
use crate::classify::SqlState;
use crate::engine::{
    Datum, EngineError, ExecOutcome, IsolationError, ParamType, QueryEngine, ScopeToken,
};
use self::query::{Expr, MatchOp, Operand, Statement};
use self::regex::{Program, RegexError, RegexLimits};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Compiled patterns kept across statements.
pub const MAX_CACHED_PATTERNS: usize = 32;

const ROOT_SCOPE: u64 = 0;

#[derive(Debug)]
pub struct PreparedQuery {
    statement: Statement,
    param_types: Vec<ParamType>,
}

#[derive(Debug)]
struct CachedPattern {
    pattern: String,
    case_insensitive: bool,
    program: Arc<Program>,
    arena: Arena,
}

#[derive(Debug)]
struct Savepoint {
    arena: Arena,
}

#[derive(Debug)]
pub struct PatternQueryEngine {
    top: Arena,
    pattern: Arena,
    limits: RegexLimits,
    cache: VecDeque<CachedPattern>,
    savepoints: Vec<Savepoint>,
    current: ScopeToken,
    next_scope: u64,
    interrupts: Arc<InterruptState>,
    hook: Option<CancellationHook>,
    statement_timeout: Duration,
    connected: bool,
}

impl Default for PatternQueryEngine {
    fn default() -> Self {
        Self::new(RegexLimits::default())
    }
}

impl PatternQueryEngine {
    pub fn new(limits: RegexLimits) -> Self {
        let top = Arena::new("TopMemoryContext");
        let pattern = top.child("RegexpContext");
        Self {
            top,
            pattern,
            limits,
            cache: VecDeque::new(),
            savepoints: Vec::new(),
            current: ScopeToken {
                allocation: ROOT_SCOPE,
                ownership: ROOT_SCOPE,
            },
            next_scope: ROOT_SCOPE + 1,
            interrupts: Arc::new(InterruptState::new()),
            hook: None,
            statement_timeout: Duration::ZERO,
            connected: false,
        }
    }

    pub fn cached_patterns(&self) -> usize {
        self.cache.len()
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    fn working_arena(&self) -> &Arena {
        self.savepoints.last().map_or(&self.top, |s| &s.arena)
    }

    fn resolve<'p>(&self, operand: &'p Operand, params: &'p [Datum]) -> Result<&'p str, EngineError> {
        match operand {
            Operand::Literal(text) => Ok(text.as_str()),
            Operand::Param(n) => match params.get(n - 1) {
                Some(Datum::Text(text)) => Ok(text.as_str()),
                None => Err(EngineError::new(
                    SqlState::UNDEFINED_PARAMETER,
                    format!("there is no parameter ${n}"),
                )),
            },
        }
    }

    /// Looks up or compiles `pattern`, keeping the most recently used entry first.
    fn compiled(&mut self, pattern: &str, case_insensitive: bool) -> Result<Arc<Program>, RegexError> {
        if let Some(i) = self
            .cache
            .iter()
            .position(|c| c.case_insensitive == case_insensitive && c.pattern == pattern)
        {
            if let Some(entry) = self.cache.remove(i) {
                let program = entry.program.clone();
                self.cache.push_front(entry);
                return Ok(program);
            }
        }

        let program = Arc::new(Program::compile(pattern, case_insensitive, &self.limits)?);
        if self.cache.len() >= MAX_CACHED_PATTERNS {
            if let Some(evicted) = self.cache.pop_back() {
                self.pattern.remove_child(&evicted.arena);
            }
        }
        let arena = self.pattern.child("RegexpCacheEntry");
        arena.allocate(program.footprint() + pattern.len());
        self.cache.push_front(CachedPattern {
            pattern: pattern.to_string(),
            case_insensitive,
            program: program.clone(),
            arena,
        });
        Ok(program)
    }

    fn regex_match(
        &mut self,
        subject: &str,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<bool, EngineError> {
        let program = self
            .compiled(pattern, case_insensitive)
            .map_err(|e| self.regex_error(e))?;

        let scratch = self.pattern.child("RegexpMatch");
        let hook = &mut self.hook;
        let interrupts = &self.interrupts;
        let mut cancel = || match hook.as_mut() {
            Some(hook) => hook.request_cancel(),
            None => interrupts.pending(),
        };
        let result = program.is_match(subject, &scratch, &self.limits, &mut cancel);
        self.pattern.remove_child(&scratch);
        result.map_err(|e| self.regex_error(e))
    }

    fn regex_error(&self, error: RegexError) -> EngineError {
        if error != RegexError::Cancelled {
            return EngineError::new(
                SqlState::INVALID_REGULAR_EXPRESSION,
                format!("invalid regular expression: {error}"),
            );
        }
        match self.hook.as_ref().and_then(CancellationHook::last_reason) {
            Some(CancelReason::StackDepth) => EngineError::new(
                SqlState::STATEMENT_TOO_COMPLEX,
                "stack depth limit exceeded",
            ),
            Some(CancelReason::MemoryBudget) => EngineError::new(
                SqlState::INVALID_REGULAR_EXPRESSION,
                format!("invalid regular expression: {error}"),
            ),
            Some(CancelReason::Interrupt) | None => match self.interrupts.take() {
                Some(kind) => kind.to_error(),
                None => EngineError::new(
                    SqlState::QUERY_CANCELED,
                    "canceling statement due to user request",
                ),
            },
        }
    }

    fn evaluate(&mut self, statement: &Statement, params: &[Datum]) -> Result<(), EngineError> {
        match &statement.expr {
            Expr::Value(operand) => {
                let value = self.resolve(operand, params)?;
                self.working_arena().allocate(value.len());
            }
            Expr::Compare { left, op, right } => {
                let subject = self.resolve(left, params)?.to_string();
                let other = self.resolve(right, params)?.to_string();
                self.working_arena().allocate(subject.len() + other.len());
                let result = match *op {
                    MatchOp::Equal => subject == other,
                    MatchOp::Regex {
                        case_insensitive,
                        negated,
                    } => self.regex_match(&subject, &other, case_insensitive)? != negated,
                };
                debug!("{subject:?} {op:?} {other:?} = {result}");
            }
        }
        Ok(())
    }
}

impl QueryEngine for PatternQueryEngine {
    type Plan = PreparedQuery;

    fn connect(&mut self) -> Result<(), IsolationError> {
        if self.connected {
            return Err(IsolationError::Connect("already connected".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn finish(&mut self) {
        self.connected = false;
    }

    fn prepare(
        &mut self,
        query: &str,
        param_types: &[ParamType],
    ) -> Result<PreparedQuery, EngineError> {
        let statement = query::parse_statement(query)?;
        if statement.param_count() > param_types.len() {
            return Err(EngineError::new(
                SqlState::UNDEFINED_PARAMETER,
                format!("there is no parameter ${}", statement.param_count()),
            ));
        }
        Ok(PreparedQuery {
            statement,
            param_types: param_types.to_vec(),
        })
    }

    fn plan_arg_count(&self, plan: &PreparedQuery) -> usize {
        plan.statement.param_count()
    }

    fn execute_plan(
        &mut self,
        plan: &PreparedQuery,
        params: &[Datum],
        _read_only: bool,
        _max_rows: usize,
    ) -> Result<ExecOutcome, EngineError> {
        if params.len() < plan.param_types.len().min(plan.statement.param_count()) {
            return Err(EngineError::new(
                SqlState::UNDEFINED_PARAMETER,
                format!("there is no parameter ${}", params.len() + 1),
            ));
        }
        self.check_for_interrupts()?;
        if !self.statement_timeout.is_zero() {
            self.interrupts.arm_deadline(self.statement_timeout);
        }
        let result = self.evaluate(&plan.statement, params);
        self.interrupts.disarm_deadline();
        result.map(|()| ExecOutcome::Select { rows: 1 })
    }

    fn current_scope(&self) -> ScopeToken {
        self.current
    }

    fn restore_allocation_scope(&mut self, token: ScopeToken) {
        self.current.allocation = token.allocation;
    }

    fn restore_ownership_scope(&mut self, token: ScopeToken) {
        self.current.ownership = token.ownership;
    }

    fn begin_nested(&mut self) -> Result<(), IsolationError> {
        if !self.connected {
            return Err(IsolationError::Begin("not connected".to_string()));
        }
        let id = self.next_scope;
        self.next_scope += 1;
        self.savepoints.push(Savepoint {
            arena: self.top.child(format!("SubTransaction {id}")),
        });
        self.current = ScopeToken {
            allocation: id,
            ownership: id,
        };
        Ok(())
    }

    fn release_nested(&mut self) -> Result<(), IsolationError> {
        let savepoint = self
            .savepoints
            .pop()
            .ok_or_else(|| IsolationError::Release("no savepoint is active".to_string()))?;
        self.top.remove_child(&savepoint.arena);
        Ok(())
    }

    fn rollback_nested(&mut self) -> Result<(), IsolationError> {
        let savepoint = self
            .savepoints
            .pop()
            .ok_or_else(|| IsolationError::Rollback("no savepoint is active".to_string()))?;
        self.top.remove_child(&savepoint.arena);
        Ok(())
    }

    fn check_for_interrupts(&mut self) -> Result<(), EngineError> {
        match self.interrupts.take() {
            Some(kind) => Err(kind.to_error()),
            None => Ok(()),
        }
    }

    fn interrupts(&self) -> Arc<InterruptState> {
        self.interrupts.clone()
    }

    fn set_statement_timeout(&mut self, timeout: Duration) {
        self.statement_timeout = timeout;
    }

    fn install_cancel_hook(&mut self, hook: CancellationHook) {
        self.hook = Some(hook);
    }

    fn top_arena(&self) -> Arena {
        self.top.clone()
    }

    fn pattern_arena(&self) -> Option<Arena> {
        Some(self.pattern.clone())
    }
}
