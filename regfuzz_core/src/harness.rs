use crate::cancel::{CancellationHook, StackDepthProbe};
use crate::config::HarnessConfig;
use crate::driver::{self, DriverOptions, FuzzEngine};
use crate::engine::{ParamType, QueryEngine};
use crate::error::HarnessError;
use crate::executor::{
    AbortReason, HarnessContext, ProcessTerminator, Terminator, TrialExecutor,
};
use crate::findings::{FindingReporter, FindingSink, SessionFlag};
use crate::limits::ResourceLimiter;
use crate::signals;
use crate::watchdog::MemoryBudget;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Hard ceiling on the run count; larger values are almost certainly a typo.
pub const MAX_RUNS: u64 = 400_000_000;

/// Number of parameters the fuzzed query must take.
const FUZZED_PARAMS: usize = 1;

struct ActiveSession<'a>(&'a SessionFlag);

impl<'a> ActiveSession<'a> {
    fn start(flag: &'a SessionFlag) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Host-facing entry points. One per process.
pub struct Harness {
    config: HarnessConfig,
    context: HarnessContext,
    terminator: Box<dyn Terminator>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_terminator(config, Box::new(ProcessTerminator))
    }

    pub fn with_terminator(config: HarnessConfig, terminator: Box<dyn Terminator>) -> Self {
        let context = HarnessContext::new(&config);
        Self {
            config,
            context,
            terminator,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    /// Prepares the process for fuzzing: resource ceilings, the cancellation hook,
    /// and a short statement timeout.
    pub fn setup_environment<E: QueryEngine>(
        &mut self,
        engine: &mut E,
        sink: Arc<dyn FindingSink>,
    ) -> Result<(), HarnessError> {
        self.prepare_process(engine, sink)?;
        let timeout = Duration::from_millis(self.config.timeouts.setup_statement_timeout_ms);
        engine.set_statement_timeout(timeout);
        info!("statement timeout set to {timeout:?}");
        Ok(())
    }

    /// Fuzzes `query` for `run_count` inputs and returns the fuzz engine's exit code.
    pub fn run<E: QueryEngine, D: FuzzEngine>(
        &mut self,
        engine: &mut E,
        driver: &mut D,
        run_count: u64,
        query: &str,
    ) -> Result<i32, HarnessError> {
        if run_count > MAX_RUNS {
            return Err(HarnessError::UnreasonableRunCount {
                requested: run_count,
                max: MAX_RUNS,
            });
        }

        let sink = driver.finding_sink();
        self.prepare_process(engine, sink.clone())?;
        signals::arm_exit_guard(self.context.in_flight());

        let session = self.context.session().clone();
        let _active = ActiveSession::start(&session);

        if let Err(e) = engine.connect() {
            self.terminator.abort(&AbortReason::Isolation(e));
        }
        let result = self.fuzz_connected(engine, driver, sink, run_count, query);
        engine.finish();
        result
    }

    fn fuzz_connected<E: QueryEngine, D: FuzzEngine>(
        &mut self,
        engine: &mut E,
        driver: &mut D,
        sink: Arc<dyn FindingSink>,
        run_count: u64,
        query: &str,
    ) -> Result<i32, HarnessError> {
        engine.set_statement_timeout(Duration::from_millis(
            self.config.timeouts.run_statement_timeout_ms,
        ));

        let plan = engine
            .prepare(query, &[ParamType::Text])
            .map_err(HarnessError::Prepare)?;
        let found = engine.plan_arg_count(&plan);
        if found != FUZZED_PARAMS {
            return Err(HarnessError::ParameterCount {
                expected: FUZZED_PARAMS,
                found,
            });
        }

        let options = DriverOptions::from_settings(&self.config.driver, run_count);
        let reporter = FindingReporter::new(sink, self.context.session().clone());
        let mut executor = TrialExecutor::new(
            engine,
            &plan,
            &mut self.context,
            reporter,
            self.terminator.as_ref(),
        )
        .with_stats_path(self.config.stats_path.as_deref());

        info!("fuzzing {query:?} for {run_count} runs");
        Ok(driver::drive(driver, &options, &mut executor))
    }

    fn prepare_process<E: QueryEngine>(
        &self,
        engine: &mut E,
        sink: Arc<dyn FindingSink>,
    ) -> Result<(), HarnessError> {
        let pattern_arena = engine
            .pattern_arena()
            .ok_or(HarnessError::MissingPatternArena)?;

        ResourceLimiter::from_settings(&self.config.limits).apply()?;

        let budget = &self.config.budget;
        let reporter = FindingReporter::new(sink, self.context.session().clone());
        let hook = CancellationHook::new(
            MemoryBudget::new(pattern_arena, budget.ceiling_bytes(), reporter),
            engine.interrupts(),
            StackDepthProbe::here(budget.max_stack_depth_kb.saturating_mul(1024)),
            budget.sample_interval,
        );
        engine.install_cancel_hook(hook);
        info!(
            "cancellation hook installed (work_mem={} kB, sampled every {} calls)",
            budget.work_mem_kb, budget.sample_interval
        );
        Ok(())
    }
}
