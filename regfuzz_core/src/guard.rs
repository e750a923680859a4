use crate::classify::{Category, SqlState, error_name};

/// Default number of identical consecutive classified failures tolerated before aborting.
pub const DEFAULT_REPEAT_THRESHOLD: u32 = 10;

/// Last classified error code and how many times in a row it has been seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepeatState {
    pub last_code: Option<SqlState>,
    pub count: u32,
}

impl RepeatState {
    pub fn reset(&mut self) {
        *self = RepeatState::default();
    }
}

/// What the executor should do after a failure has been observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Benign failure; nothing to report.
    Absorb,
    /// Report the named finding to the fuzz engine and keep going.
    Report(String),
    /// The same finding repeated past the threshold; the process must die.
    AbortProcess,
}

/// Turns an endless run of identical classified failures into a hard crash, which
/// is the only outcome the fuzz engine will minimize.
#[derive(Debug, Clone)]
pub struct RepeatGuard {
    threshold: u32,
    state: RepeatState,
}

impl RepeatGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            state: RepeatState::default(),
        }
    }

    pub fn state(&self) -> RepeatState {
        self.state
    }

    /// Called after a successful trial.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn observe(&mut self, category: Category, code: SqlState) -> Verdict {
        if category.is_benign() {
            self.state.reset();
            return Verdict::Absorb;
        }

        if self.state.last_code == Some(code) {
            self.state.count = self.state.count.saturating_add(1);
        } else {
            self.state = RepeatState {
                last_code: Some(code),
                count: 1,
            };
        }

        if self.state.count > self.threshold {
            Verdict::AbortProcess
        } else {
            Verdict::Report(error_name(code))
        }
    }
}

impl Default for RepeatGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPEAT_THRESHOLD)
    }
}
