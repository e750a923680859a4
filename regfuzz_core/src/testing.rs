//! Fakes shared by the unit tests.

use crate::arena::Arena;
use crate::cancel::{CancelReason, CancellationHook, InterruptState};
use crate::engine::{
    Datum, EngineError, ExecOutcome, IsolationError, ParamType, QueryEngine, ScopeToken,
};
use crate::executor::{AbortReason, Terminator};
use crate::findings::FindingSink;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RecordingSink {
    names: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<String> {
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl FindingSink for RecordingSink {
    fn report_error(&self, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(name.to_string());
    }
}

/// Turns an abort into a panic carrying the reason.
pub struct PanickingTerminator;

impl Terminator for PanickingTerminator {
    fn abort(&self, reason: &AbortReason) -> ! {
        panic!("aborted: {reason}")
    }
}

/// Runs `f`, which must abort through [`PanickingTerminator`], and returns the reason.
pub fn expect_abort(f: impl FnOnce()) -> String {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("expected the harness to abort"),
        Err(payload) => payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_default(),
    }
}

pub struct ScriptedPlan {
    pub args: usize,
}

type Script = Box<dyn FnMut(&str) -> Result<ExecOutcome, EngineError>>;

/// A query engine whose statement results come from a closure over the input.
pub struct ScriptedEngine {
    script: Script,
    pub seen_inputs: Vec<String>,
    pub connected: bool,
    pub begun: usize,
    pub released: usize,
    pub rolled_back: usize,
    pub depth: usize,
    pub max_depth: usize,
    pub fail_begin: bool,
    pub allocation_restored_before_rollback: bool,
    pub statement_timeout: Option<Duration>,
    pub hook: Option<CancellationHook>,
    pub poll_hook_per_trial: bool,
    pub cancel_reasons: Vec<Option<CancelReason>>,
    pub pattern: Option<Arena>,
    top: Arena,
    interrupts: Arc<InterruptState>,
    current: ScopeToken,
    callers: Vec<ScopeToken>,
    next_scope: u64,
}

impl ScriptedEngine {
    pub fn with_script(
        script: impl FnMut(&str) -> Result<ExecOutcome, EngineError> + 'static,
    ) -> Self {
        let top = Arena::new("TopMemoryContext");
        let pattern = top.child("RegexpContext");
        Self {
            script: Box::new(script),
            seen_inputs: Vec::new(),
            connected: false,
            begun: 0,
            released: 0,
            rolled_back: 0,
            depth: 0,
            max_depth: 0,
            fail_begin: false,
            allocation_restored_before_rollback: false,
            statement_timeout: None,
            hook: None,
            poll_hook_per_trial: false,
            cancel_reasons: Vec::new(),
            pattern: Some(pattern),
            top,
            interrupts: Arc::new(InterruptState::new()),
            current: Self::ROOT,
            callers: Vec::new(),
            next_scope: 1,
        }
    }

    pub fn always_ok() -> Self {
        Self::with_script(|_| Ok(ExecOutcome::Select { rows: 1 }))
    }

    const ROOT: ScopeToken = ScopeToken {
        allocation: 0,
        ownership: 0,
    };

    pub fn root_scope(&self) -> ScopeToken {
        Self::ROOT
    }

    pub fn single_param_plan(&self) -> ScriptedPlan {
        ScriptedPlan { args: 1 }
    }
}

/// Highest `$n` placeholder in `query`.
fn highest_placeholder(query: &str) -> usize {
    query
        .split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

impl QueryEngine for ScriptedEngine {
    type Plan = ScriptedPlan;

    fn connect(&mut self) -> Result<(), IsolationError> {
        self.connected = true;
        Ok(())
    }

    fn finish(&mut self) {
        self.connected = false;
    }

    fn prepare(
        &mut self,
        query: &str,
        _param_types: &[ParamType],
    ) -> Result<ScriptedPlan, EngineError> {
        Ok(ScriptedPlan {
            args: highest_placeholder(query),
        })
    }

    fn plan_arg_count(&self, plan: &ScriptedPlan) -> usize {
        plan.args
    }

    fn execute_plan(
        &mut self,
        _plan: &ScriptedPlan,
        params: &[Datum],
        _read_only: bool,
        _max_rows: usize,
    ) -> Result<ExecOutcome, EngineError> {
        let Some(Datum::Text(text)) = params.first() else {
            return Ok(ExecOutcome::Select { rows: 0 });
        };
        self.seen_inputs.push(text.clone());
        if self.poll_hook_per_trial {
            if let Some(hook) = self.hook.as_mut() {
                hook.request_cancel();
                self.cancel_reasons.push(hook.last_reason());
            }
        }
        (self.script)(text)
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
        if self.fail_begin {
            return Err(IsolationError::Begin("scripted failure".to_string()));
        }
        self.begun += 1;
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
        self.callers.push(self.current);
        self.current = ScopeToken {
            allocation: self.next_scope,
            ownership: self.next_scope,
        };
        self.next_scope += 1;
        Ok(())
    }

    fn release_nested(&mut self) -> Result<(), IsolationError> {
        self.callers
            .pop()
            .ok_or_else(|| IsolationError::Release("no open scope".to_string()))?;
        self.released += 1;
        self.depth -= 1;
        Ok(())
    }

    fn rollback_nested(&mut self) -> Result<(), IsolationError> {
        let caller = self
            .callers
            .pop()
            .ok_or_else(|| IsolationError::Rollback("no open scope".to_string()))?;
        self.allocation_restored_before_rollback = self.current.allocation == caller.allocation;
        self.rolled_back += 1;
        self.depth -= 1;
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
        self.statement_timeout = Some(timeout);
    }

    fn install_cancel_hook(&mut self, hook: CancellationHook) {
        self.hook = Some(hook);
    }

    fn top_arena(&self) -> Arena {
        self.top.clone()
    }

    fn pattern_arena(&self) -> Option<Arena> {
        self.pattern.clone()
    }
}

#[test]
fn placeholders_are_counted_by_highest_index() {
    assert_eq!(highest_placeholder("SELECT 'a' ~ 'b'"), 0);
    assert_eq!(highest_placeholder("SELECT $1 ~ $1"), 1);
    assert_eq!(highest_placeholder("SELECT $1 ~ $2"), 2);
}
