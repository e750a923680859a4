use crate::classify::SqlState;
use crate::engine::EngineError;
use crate::watchdog::MemoryBudget;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default number of hook calls between two pattern-arena budget checks.
pub const DEFAULT_BUDGET_SAMPLE_INTERVAL: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    StatementTimeout,
    UserRequest,
    Die,
}

impl InterruptKind {
    pub fn to_error(self) -> EngineError {
        match self {
            InterruptKind::StatementTimeout => EngineError::new(
                SqlState::QUERY_CANCELED,
                "canceling statement due to statement timeout",
            ),
            InterruptKind::UserRequest => EngineError::new(
                SqlState::QUERY_CANCELED,
                "canceling statement due to user request",
            ),
            InterruptKind::Die => EngineError::new(
                SqlState::ADMIN_SHUTDOWN,
                "terminating connection due to administrator command",
            ),
        }
    }
}

/// External cancellation requests for the running statement.
#[derive(Debug, Default)]
pub struct InterruptState {
    cancel: AtomicBool,
    die: AtomicBool,
    timed_out: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn request_die(&self) {
        self.die.store(true, Ordering::SeqCst);
    }

    pub fn arm_deadline(&self, timeout: Duration) {
        *self.deadline_slot() = Instant::now().checked_add(timeout);
    }

    pub fn disarm_deadline(&self) {
        *self.deadline_slot() = None;
    }

    fn deadline_slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a cancel or die request is outstanding. A passed deadline becomes a
    /// cancel request here.
    pub fn pending(&self) -> bool {
        let expired = matches!(*self.deadline_slot(), Some(deadline) if Instant::now() >= deadline);
        if expired {
            self.disarm_deadline();
            self.timed_out.store(true, Ordering::SeqCst);
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.cancel.load(Ordering::SeqCst) || self.die.load(Ordering::SeqCst)
    }

    /// Consumes the pending interrupt, if any. Die requests are sticky.
    pub fn take(&self) -> Option<InterruptKind> {
        if !self.pending() {
            return None;
        }
        if self.die.load(Ordering::SeqCst) {
            return Some(InterruptKind::Die);
        }
        self.cancel.store(false, Ordering::SeqCst);
        if self.timed_out.swap(false, Ordering::SeqCst) {
            Some(InterruptKind::StatementTimeout)
        } else {
            Some(InterruptKind::UserRequest)
        }
    }
}

#[inline(never)]
fn stack_address() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Measures how far the stack has grown since the probe was created.
#[derive(Debug, Clone, Copy)]
pub struct StackDepthProbe {
    base: usize,
    limit: usize,
}

impl StackDepthProbe {
    /// Anchors the probe at the caller's stack frame.
    pub fn here(limit_bytes: usize) -> Self {
        Self {
            base: stack_address(),
            limit: limit_bytes,
        }
    }

    pub fn depth(&self) -> usize {
        self.base.abs_diff(stack_address())
    }

    pub fn exceeded(&self) -> bool {
        self.depth() > self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    StackDepth,
    MemoryBudget,
    Interrupt,
}

/// Predicate the pattern engine polls from its inner loops.
#[derive(Debug)]
pub struct CancellationHook {
    calls: u64,
    sample_interval: u64,
    budget: MemoryBudget,
    interrupts: Arc<InterruptState>,
    stack: StackDepthProbe,
    reason: Option<CancelReason>,
}

impl CancellationHook {
    pub fn new(
        budget: MemoryBudget,
        interrupts: Arc<InterruptState>,
        stack: StackDepthProbe,
        sample_interval: u64,
    ) -> Self {
        Self {
            calls: 0,
            sample_interval: sample_interval.max(1),
            budget,
            interrupts,
            stack,
            reason: None,
        }
    }

    pub fn request_cancel(&mut self) -> bool {
        self.reason = if self.stack.exceeded() {
            Some(CancelReason::StackDepth)
        } else if self.sample_due() && self.budget.check() {
            Some(CancelReason::MemoryBudget)
        } else if self.interrupts.pending() {
            Some(CancelReason::Interrupt)
        } else {
            None
        };
        self.reason.is_some()
    }

    fn sample_due(&mut self) -> bool {
        let due = self.calls % self.sample_interval == 0;
        self.calls = self.calls.wrapping_add(1);
        due
    }

    /// Why the last call to [`CancellationHook::request_cancel`] returned `true`.
    pub fn last_reason(&self) -> Option<CancelReason> {
        self.reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::findings::{FindingReporter, SessionFlag};
    use crate::testing::RecordingSink;

    fn hook_over(
        arena: &Arena,
        ceiling: usize,
        interval: u64,
    ) -> (CancellationHook, Arc<RecordingSink>, Arc<InterruptState>) {
        let sink = Arc::new(RecordingSink::default());
        let session = SessionFlag::new();
        session.set(true);
        let reporter = FindingReporter::new(sink.clone(), session);
        let interrupts = Arc::new(InterruptState::new());
        let hook = CancellationHook::new(
            MemoryBudget::new(arena.clone(), ceiling, reporter),
            interrupts.clone(),
            StackDepthProbe::here(1024 * 1024),
            interval,
        );
        (hook, sink, interrupts)
    }

    #[test]
    fn budget_is_sampled_on_first_call_then_every_interval() {
        let arena = Arena::new("RegexpContext");
        arena.allocate(4096);
        let (mut hook, sink, _) = hook_over(&arena, 1024, 3);

        assert!(hook.request_cancel());
        assert_eq!(hook.last_reason(), Some(CancelReason::MemoryBudget));
        assert!(!hook.request_cancel());
        assert!(!hook.request_cancel());
        assert!(hook.request_cancel());
        assert_eq!(sink.names().len(), 2);
    }

    #[test]
    fn pending_interrupt_cancels() {
        let arena = Arena::new("RegexpContext");
        let (mut hook, _, interrupts) = hook_over(&arena, 1024, 20_000);
        assert!(!hook.request_cancel());
        interrupts.request_cancel();
        assert!(hook.request_cancel());
        assert_eq!(hook.last_reason(), Some(CancelReason::Interrupt));
    }

    #[test]
    fn expired_deadline_is_a_statement_timeout() {
        let interrupts = InterruptState::new();
        interrupts.arm_deadline(Duration::ZERO);
        assert!(interrupts.pending());
        assert_eq!(interrupts.take(), Some(InterruptKind::StatementTimeout));
        assert_eq!(interrupts.take(), None);
    }

    #[test]
    fn die_requests_are_sticky() {
        let interrupts = InterruptState::new();
        interrupts.request_die();
        assert_eq!(interrupts.take(), Some(InterruptKind::Die));
        assert_eq!(interrupts.take(), Some(InterruptKind::Die));
    }

    #[test]
    fn user_cancel_maps_to_query_canceled() {
        let interrupts = InterruptState::new();
        interrupts.request_cancel();
        let kind = interrupts.take().unwrap();
        assert_eq!(kind, InterruptKind::UserRequest);
        assert_eq!(kind.to_error().code, SqlState::QUERY_CANCELED);
    }

    #[test]
    fn stack_probe_reports_depth() {
        fn recurse(probe: &StackDepthProbe, levels: usize) -> usize {
            let pad = std::hint::black_box([0u8; 256]);
            if levels == 0 {
                probe.depth() + pad[0] as usize
            } else {
                recurse(probe, levels - 1) + pad[1] as usize
            }
        }
        let probe = StackDepthProbe::here(usize::MAX);
        assert!(recurse(&probe, 16) >= 16 * 256);
        assert!(!probe.exceeded());
    }
}
