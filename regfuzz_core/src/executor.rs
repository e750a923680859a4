use crate::classify::{ErrorRecord, SqlState};
use crate::config::HarnessConfig;
use crate::driver::FuzzTarget;
use crate::engine::{Datum, EngineError, ExecOutcome, IsolationError, QueryEngine, ScopeToken};
use crate::error::HarnessError;
use crate::findings::{FindingReporter, SessionFlag};
use crate::guard::{RepeatGuard, RepeatState, Verdict};
use crate::progress::{self, ProgressReport, ProgressReporter};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounters {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
}

impl ExecutionCounters {
    /// Every execution ends as exactly one of success, failure or skip.
    pub fn is_balanced(&self) -> bool {
        self.executions == self.successes + self.failures + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Success,
    Classified(ErrorRecord),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    GuardTripped { code: SqlState, count: u32 },
    Isolation(IsolationError),
    EnginePanic(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::GuardTripped { code, count } => {
                write!(f, "error {code} repeated {count} times in a row")
            }
            AbortReason::Isolation(e) => write!(f, "{e}"),
            AbortReason::EnginePanic(message) => write!(f, "engine panicked: {message}"),
        }
    }
}

/// Ends the process. The fuzz engine only minimizes inputs that kill it.
pub trait Terminator {
    fn abort(&self, reason: &AbortReason) -> !;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn abort(&self, reason: &AbortReason) -> ! {
        error!("aborting: {reason}");
        std::process::abort()
    }
}

/// Final statistics flushed by the death callback.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessStats {
    pub counters: ExecutionCounters,
    pub findings_reported: u64,
    pub last_error: Option<SqlState>,
    pub repeat_count: u32,
    pub elapsed_ms: u128,
}

impl HarnessStats {
    pub fn write_json(&self, path: &Path) -> Result<(), HarnessError> {
        let file = std::fs::File::create(path)
            .map_err(|e| HarnessError::Stats(format!("{}: {e}", path.display())))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)
            .map_err(|e| HarnessError::Stats(format!("{}: {e}", path.display())))
    }
}

/// Process-lifetime harness state, passed explicitly to every trial.
#[derive(Debug)]
pub struct HarnessContext {
    counters: ExecutionCounters,
    guard: RepeatGuard,
    progress: ProgressReporter,
    last_progress: Option<ProgressReport>,
    in_flight: Arc<AtomicBool>,
    session: SessionFlag,
    findings_reported: u64,
    started: Instant,
}

impl HarnessContext {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            counters: ExecutionCounters::default(),
            guard: RepeatGuard::new(config.guard.repeat_threshold),
            progress: ProgressReporter::new(config.progress.clone()),
            last_progress: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            session: SessionFlag::new(),
            findings_reported: 0,
            started: Instant::now(),
        }
    }

    pub fn counters(&self) -> ExecutionCounters {
        self.counters
    }

    pub fn repeat_state(&self) -> RepeatState {
        self.guard.state()
    }

    /// The most recent periodic progress report, if one has been due yet.
    pub fn last_progress(&self) -> Option<&ProgressReport> {
        self.last_progress.as_ref()
    }

    pub fn findings_reported(&self) -> u64 {
        self.findings_reported
    }

    /// Set only while a trial is executing.
    pub fn in_flight(&self) -> &Arc<AtomicBool> {
        &self.in_flight
    }

    pub fn session(&self) -> &SessionFlag {
        &self.session
    }

    pub fn stats(&self) -> HarnessStats {
        let repeat = self.guard.state();
        HarnessStats {
            counters: self.counters,
            findings_reported: self.findings_reported,
            last_error: repeat.last_code,
            repeat_count: repeat.count,
            elapsed_ms: self.started.elapsed().as_millis(),
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A nested savepoint plus the caller's allocation and ownership scopes. Dropping
/// an open unit rolls it back, so no exit path can leak it.
pub struct IsolationUnit<'e, E: QueryEngine> {
    engine: &'e mut E,
    caller: ScopeToken,
    open: bool,
}

impl<'e, E: QueryEngine> IsolationUnit<'e, E> {
    pub fn open(engine: &'e mut E) -> Result<Self, IsolationError> {
        let caller = engine.current_scope();
        engine.begin_nested()?;
        Ok(Self {
            engine,
            caller,
            open: true,
        })
    }

    pub fn engine(&mut self) -> &mut E {
        self.engine
    }

    pub fn restore_allocation_scope(&mut self) {
        self.engine.restore_allocation_scope(self.caller);
    }

    pub fn commit(mut self) -> Result<(), IsolationError> {
        self.open = false;
        let released = self.engine.release_nested();
        self.restore_caller();
        released
    }

    pub fn rollback(mut self) -> Result<(), IsolationError> {
        self.open = false;
        let rolled_back = self.engine.rollback_nested();
        self.restore_caller();
        rolled_back
    }

    fn restore_caller(&mut self) {
        self.engine.restore_allocation_scope(self.caller);
        self.engine.restore_ownership_scope(self.caller);
    }
}

impl<E: QueryEngine> Drop for IsolationUnit<'_, E> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.engine.rollback_nested() {
                error!("rollback of abandoned isolation unit failed: {e}");
            }
            self.restore_caller();
        }
    }
}

/// Runs fuzz inputs against a prepared plan, one isolated trial at a time.
pub struct TrialExecutor<'a, E: QueryEngine> {
    engine: &'a mut E,
    plan: &'a E::Plan,
    context: &'a mut HarnessContext,
    reporter: FindingReporter,
    terminator: &'a dyn Terminator,
    stats_path: Option<&'a Path>,
}

impl<'a, E: QueryEngine> TrialExecutor<'a, E> {
    pub fn new(
        engine: &'a mut E,
        plan: &'a E::Plan,
        context: &'a mut HarnessContext,
        reporter: FindingReporter,
        terminator: &'a dyn Terminator,
    ) -> Self {
        Self {
            engine,
            plan,
            context,
            reporter,
            terminator,
            stats_path: None,
        }
    }

    pub fn with_stats_path(mut self, path: Option<&'a Path>) -> Self {
        self.stats_path = path;
        self
    }

    pub fn run_trial(&mut self, input: Option<&[u8]>) -> TrialOutcome {
        self.context.counters.executions += 1;

        // The driver occasionally hands over no buffer at all; nothing to run.
        let Some(bytes) = input else {
            self.context.counters.skipped += 1;
            return TrialOutcome::Skipped;
        };

        let in_flight = Arc::clone(&self.context.in_flight);
        let outcome = {
            let _in_flight = InFlightGuard::enter(&in_flight);
            match self.engine.check_for_interrupts() {
                Err(interrupt) => self.handle_failure(interrupt),
                Ok(()) => self.execute(bytes),
            }
        };

        debug_assert!(self.context.counters.is_balanced());
        let executions = self.context.counters.executions;
        if progress::is_due(executions) {
            let top = self.engine.top_arena();
            let report = self.context.progress.report(&self.context.counters, &top);
            self.context.last_progress = Some(report);
        }
        outcome
    }

    fn execute(&mut self, bytes: &[u8]) -> TrialOutcome {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text.to_owned(),
            Err(e) => return self.handle_failure(invalid_encoding(bytes, e.valid_up_to())),
        };
        let params = [Datum::Text(text)];

        let mut unit = match IsolationUnit::open(&mut *self.engine) {
            Ok(unit) => unit,
            Err(e) => self.terminator.abort(&AbortReason::Isolation(e)),
        };

        let plan = self.plan;
        let executed = catch_unwind(AssertUnwindSafe(|| {
            unit.engine().execute_plan(plan, &params, true, 0)
        }));
        let executed = match executed {
            Ok(executed) => executed,
            // The unit is still open; dropping it on the way out rolls it back.
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.terminator.abort(&AbortReason::EnginePanic(message))
            }
        };

        match executed {
            Ok(outcome) => {
                if let ExecOutcome::Utility { tag } = &outcome {
                    warn!("engine reports non-select result {tag}");
                }
                if let Err(e) = unit.commit() {
                    self.terminator.abort(&AbortReason::Isolation(e));
                }
                self.context.guard.reset();
                self.context.counters.successes += 1;
                TrialOutcome::Success
            }
            Err(raised) => {
                unit.restore_allocation_scope();
                let captured = raised.clone();
                if let Err(e) = unit.rollback() {
                    self.terminator.abort(&AbortReason::Isolation(e));
                }
                self.handle_failure(captured)
            }
        }
    }

    fn handle_failure(&mut self, raised: EngineError) -> TrialOutcome {
        let record = ErrorRecord::new(raised.code, raised.message);
        match self.context.guard.observe(record.category, record.code) {
            Verdict::Absorb => {
                debug!(code = %record.code, "benign failure: {}", record.message);
            }
            Verdict::Report(name) => {
                if self.reporter.report(&name, &record.message) {
                    self.context.findings_reported += 1;
                }
                if let Some(arena) = self.engine.pattern_arena() {
                    debug!("{}", crate::arena::render_tree(&arena));
                }
            }
            Verdict::AbortProcess => {
                let count = self.context.guard.state().count;
                error!(
                    code = %record.code,
                    "same error repeated {count} times, last message: {}",
                    record.message
                );
                self.terminator.abort(&AbortReason::GuardTripped {
                    code: record.code,
                    count,
                });
            }
        }
        self.context.counters.failures += 1;
        TrialOutcome::Classified(record)
    }

    pub fn context(&self) -> &HarnessContext {
        &*self.context
    }
}

/// Text parameters must be valid UTF-8; anything else is rejected the way the
/// engine's own input routines reject it.
fn invalid_encoding(bytes: &[u8], valid_up_to: usize) -> EngineError {
    let byte = bytes.get(valid_up_to).copied().unwrap_or_default();
    EngineError::new(
        SqlState::CHARACTER_NOT_IN_REPERTOIRE,
        format!("invalid byte sequence for encoding \"UTF8\": 0x{byte:02x}"),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<E: QueryEngine> FuzzTarget for TrialExecutor<'_, E> {
    fn execute_one(&mut self, data: Option<&[u8]>) {
        self.run_trial(data);
    }

    fn on_death(&mut self) {
        let stats = self.context.stats();
        let c = stats.counters;
        info!(
            "final n={}  success={}  fail={}  null={}  findings={}",
            c.executions, c.successes, c.failures, c.skipped, stats.findings_reported
        );
        if let Some(path) = self.stats_path {
            match stats.write_json(path) {
                Ok(()) => info!("statistics written to {}", path.display()),
                Err(e) => warn!("{e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Category;
    use crate::testing::{PanickingTerminator, RecordingSink, ScriptedEngine, expect_abort};

    struct Fixture {
        engine: ScriptedEngine,
        context: HarnessContext,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new(engine: ScriptedEngine) -> Self {
            let context = HarnessContext::new(&HarnessConfig::default());
            context.session().set(true);
            Self {
                engine,
                context,
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn run(&mut self, inputs: &[Option<&[u8]>]) -> Vec<TrialOutcome> {
            let plan = self.engine.single_param_plan();
            let reporter = FindingReporter::new(self.sink.clone(), self.context.session().clone());
            let terminator = PanickingTerminator;
            let mut executor =
                TrialExecutor::new(&mut self.engine, &plan, &mut self.context, reporter, &terminator);
            inputs.iter().map(|input| executor.run_trial(*input)).collect()
        }
    }

    fn input(text: &'static str) -> Option<&'static [u8]> {
        Some(text.as_bytes())
    }

    fn failing_with(code: SqlState, message: &'static str) -> ScriptedEngine {
        ScriptedEngine::with_script(move |_| Err(EngineError::new(code, message)))
    }

    #[test]
    fn success_commits_and_counts() {
        let mut fx = Fixture::new(ScriptedEngine::always_ok());
        let outcomes = fx.run(&[input("abc"), input("def")]);
        assert_eq!(outcomes, vec![TrialOutcome::Success, TrialOutcome::Success]);
        assert_eq!(fx.engine.released, 2);
        assert_eq!(fx.engine.rolled_back, 0);
        assert_eq!(fx.engine.max_depth, 1);
        assert_eq!(fx.engine.depth, 0);
        assert_eq!(fx.engine.current_scope(), fx.engine.root_scope());
        assert_eq!(fx.engine.seen_inputs, vec!["abc".to_string(), "def".to_string()]);
        assert!(!fx.context.in_flight().load(Ordering::SeqCst));
    }

    #[test]
    fn non_select_result_still_counts_as_success() {
        let mut fx = Fixture::new(ScriptedEngine::with_script(|_| {
            Ok(ExecOutcome::Utility {
                tag: "SET".to_string(),
            })
        }));
        assert_eq!(fx.run(&[input("x")]), vec![TrialOutcome::Success]);
        assert_eq!(fx.context.counters().successes, 1);
        assert_eq!(fx.engine.released, 1);
    }

    #[test]
    fn null_input_is_skipped_without_touching_repeat_state() {
        let mut fx = Fixture::new(failing_with(SqlState::INTERNAL_ERROR, "bug"));
        fx.run(&[input("x")]);
        let before = fx.context.repeat_state();
        let outcomes = fx.run(&[None]);
        assert_eq!(outcomes, vec![TrialOutcome::Skipped]);
        assert_eq!(fx.context.repeat_state(), before);
        assert_eq!(fx.context.counters().skipped, 1);
        assert_eq!(fx.engine.begun, 1);
    }

    #[test]
    fn counters_stay_balanced() {
        let mut fx = Fixture::new(ScriptedEngine::with_script(|input| {
            if input.starts_with('(') {
                Err(EngineError::new(
                    SqlState::INVALID_REGULAR_EXPRESSION,
                    "invalid regular expression: parentheses () not balanced",
                ))
            } else {
                Ok(ExecOutcome::Select { rows: 1 })
            }
        }));
        let inputs: Vec<Option<&[u8]>> =
            vec![input("a"), None, input("(b"), input("c"), None, input("(")];
        for input in inputs {
            fx.run(&[input]);
            assert!(fx.context.counters().is_balanced());
        }
        assert_eq!(
            fx.context.counters(),
            ExecutionCounters {
                executions: 6,
                successes: 2,
                failures: 2,
                skipped: 2
            }
        );
    }

    #[test]
    fn failure_rolls_back_and_restores_scope() {
        let mut fx = Fixture::new(failing_with(SqlState::SYNTAX_ERROR, "syntax error"));
        fx.run(&[input("x")]);
        assert_eq!(fx.engine.rolled_back, 1);
        assert_eq!(fx.engine.released, 0);
        assert_eq!(fx.engine.current_scope(), fx.engine.root_scope());
        assert!(fx.engine.allocation_restored_before_rollback);
    }

    #[test]
    fn benign_failure_is_not_reported() {
        let mut fx = Fixture::new(failing_with(SqlState::SYNTAX_ERROR, "syntax error"));
        let outcomes = fx.run(&[input("x")]);
        match &outcomes[0] {
            TrialOutcome::Classified(record) => assert_eq!(record.category, Category::Benign),
            other => panic!("expected classified failure, got {other:?}"),
        }
        assert_eq!(fx.context.repeat_state(), RepeatState::default());
        assert!(fx.sink.names().is_empty());
    }

    #[test]
    fn repeat_state_counts_and_resets() {
        let mut fx = Fixture::new(ScriptedEngine::with_script(|input| match input {
            "ok" => Ok(ExecOutcome::Select { rows: 1 }),
            "timeout" => Err(EngineError::new(
                SqlState::QUERY_CANCELED,
                "canceling statement due to statement timeout",
            )),
            _ => Err(EngineError::new(SqlState::INTERNAL_ERROR, "bug")),
        }));
        fx.run(&[input("bug"), input("bug")]);
        assert_eq!(fx.context.repeat_state().count, 2);
        fx.run(&[input("timeout")]);
        assert_eq!(
            fx.context.repeat_state(),
            RepeatState {
                last_code: Some(SqlState::QUERY_CANCELED),
                count: 1
            }
        );
        fx.run(&[input("ok")]);
        assert_eq!(fx.context.repeat_state(), RepeatState::default());
        assert_eq!(
            fx.sink.names(),
            vec!["error-XX000", "error-XX000", "error-57014"]
        );
        assert_eq!(fx.context.findings_reported(), 3);
    }

    #[test]
    fn ten_identical_failures_do_not_abort() {
        let mut fx = Fixture::new(failing_with(SqlState::INTERNAL_ERROR, "bug"));
        let inputs = vec![Some(&b"x"[..]); 10];
        fx.run(&inputs);
        assert_eq!(fx.context.counters().failures, 10);
    }

    #[test]
    fn eleven_identical_failures_abort() {
        let mut fx = Fixture::new(failing_with(SqlState::INTERNAL_ERROR, "bug"));
        let inputs = vec![Some(&b"x"[..]); 11];
        let reason = expect_abort(|| {
            fx.run(&inputs);
        });
        assert!(reason.contains("XX000"), "unexpected abort reason {reason}");
        assert!(!fx.context.in_flight().load(Ordering::SeqCst));
        assert_eq!(fx.engine.depth, 0);
    }

    #[test]
    fn isolation_failure_aborts_without_classifying() {
        let mut engine = ScriptedEngine::always_ok();
        engine.fail_begin = true;
        let mut fx = Fixture::new(engine);
        let reason = expect_abort(|| {
            fx.run(&[input("x")]);
        });
        assert!(reason.contains("could not begin nested scope"));
        assert_eq!(fx.context.repeat_state(), RepeatState::default());
        assert!(fx.sink.names().is_empty());
    }

    #[test]
    fn engine_panic_aborts_and_rolls_back() {
        let mut fx = Fixture::new(ScriptedEngine::with_script(|_| panic!("engine bug")));
        let reason = expect_abort(|| {
            fx.run(&[input("x")]);
        });
        assert_eq!(reason, "aborted: engine panicked: engine bug");
        assert_eq!(fx.engine.rolled_back, 1);
        assert_eq!(fx.engine.released, 0);
        assert_eq!(fx.engine.depth, 0);
        assert_eq!(fx.engine.current_scope(), fx.engine.root_scope());
        assert_eq!(fx.context.repeat_state(), RepeatState::default());
        assert!(fx.sink.names().is_empty());
    }

    #[test]
    fn invalid_utf8_is_rejected_before_the_engine_sees_it() {
        let mut fx = Fixture::new(ScriptedEngine::always_ok());
        let outcomes = fx.run(&[Some(&b"ab\xffc"[..]), input("abc")]);
        match &outcomes[0] {
            TrialOutcome::Classified(record) => {
                assert_eq!(record.code, SqlState::CHARACTER_NOT_IN_REPERTOIRE);
                assert_eq!(record.category, Category::Benign);
                assert!(record.message.ends_with("0xff"), "{}", record.message);
            }
            other => panic!("expected classified failure, got {other:?}"),
        }
        assert_eq!(outcomes[1], TrialOutcome::Success);
        assert_eq!(fx.engine.seen_inputs, vec!["abc".to_string()]);
        assert_eq!(fx.engine.begun, 1);
        assert!(fx.sink.names().is_empty());
        assert!(fx.context.counters().is_balanced());
    }

    #[test]
    fn progress_fires_at_powers_of_two_and_never_for_null_input() {
        let mut fx = Fixture::new(ScriptedEngine::always_ok());
        let mut reported_at = Vec::new();
        for _ in 0..15 {
            fx.run(&[input("x")]);
            let last = fx.context.last_progress().map(|r| r.counters.executions);
            if last == Some(fx.context.counters().executions) {
                reported_at.push(fx.context.counters().executions);
            }
        }
        assert_eq!(reported_at, vec![1, 2, 4, 8]);

        fx.run(&[None]);
        assert_eq!(fx.context.counters().executions, 16);
        let last = fx.context.last_progress().map(|r| r.counters.executions);
        assert_eq!(last, Some(8));

        for _ in 17..=32 {
            fx.run(&[input("x")]);
        }
        let last = fx.context.last_progress().map(|r| (r.counters.executions, r.trials_since_last));
        assert_eq!(last, Some((32, 24)));
    }

    #[test]
    fn pending_interrupt_fails_trial_at_checkpoint() {
        let mut fx = Fixture::new(ScriptedEngine::always_ok());
        fx.engine.interrupts().request_cancel();
        let outcomes = fx.run(&[input("x")]);
        match &outcomes[0] {
            TrialOutcome::Classified(record) => {
                assert_eq!(record.category, Category::OperatorIntervention)
            }
            other => panic!("expected classified failure, got {other:?}"),
        }
        assert_eq!(fx.engine.begun, 0);
        assert!(fx.context.counters().is_balanced());
        assert_eq!(fx.run(&[input("x")]), vec![TrialOutcome::Success]);
    }

    #[test]
    fn findings_need_an_active_session() {
        let mut fx = Fixture::new(failing_with(SqlState::INTERNAL_ERROR, "bug"));
        fx.context.session().set(false);
        fx.run(&[input("x")]);
        assert!(fx.sink.names().is_empty());
        assert_eq!(fx.context.findings_reported(), 0);
    }

    #[test]
    fn death_callback_writes_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let mut fx = Fixture::new(ScriptedEngine::always_ok());
        let plan = fx.engine.single_param_plan();
        let reporter = FindingReporter::new(fx.sink.clone(), fx.context.session().clone());
        let terminator = PanickingTerminator;
        let mut executor =
            TrialExecutor::new(&mut fx.engine, &plan, &mut fx.context, reporter, &terminator)
                .with_stats_path(Some(path.as_path()));
        executor.execute_one(input("a"));
        executor.execute_one(None);
        executor.on_death();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["counters"]["executions"], 2);
        assert_eq!(written["counters"]["successes"], 1);
        assert_eq!(written["counters"]["skipped"], 1);
    }
}
