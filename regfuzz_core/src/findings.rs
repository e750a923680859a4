use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Receives named findings: inputs that are interesting to the fuzz engine even
/// though the process survived them.
pub trait FindingSink: Send + Sync {
    fn report_error(&self, name: &str);
}

/// Shared "a fuzz session is running" flag. Findings are only forwarded while it
/// is set, so setup-time errors never reach the fuzz engine.
#[derive(Debug, Clone, Default)]
pub struct SessionFlag(Arc<AtomicBool>);

impl SessionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Forwards findings from the harness (repeat guard, memory watchdog) to the sink.
#[derive(Clone)]
pub struct FindingReporter {
    sink: Arc<dyn FindingSink>,
    session: SessionFlag,
}

impl FindingReporter {
    pub fn new(sink: Arc<dyn FindingSink>, session: SessionFlag) -> Self {
        Self { sink, session }
    }

    pub fn session(&self) -> &SessionFlag {
        &self.session
    }

    /// Returns whether the finding was forwarded.
    pub fn report(&self, name: &str, detail: &str) -> bool {
        if !self.session.is_active() {
            return false;
        }
        info!(finding = name, "calling error callback for {name} ({detail})");
        self.sink.report_error(name);
        true
    }
}

impl std::fmt::Debug for FindingReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindingReporter")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn findings_are_dropped_outside_a_session() {
        let sink = Arc::new(RecordingSink::default());
        let session = SessionFlag::new();
        let reporter = FindingReporter::new(sink.clone(), session.clone());

        assert!(!reporter.report("error-2201B", "outside"));
        assert!(sink.names().is_empty());

        session.set(true);
        assert!(reporter.report("error-2201B", "inside"));
        assert_eq!(sink.names(), vec!["error-2201B".to_string()]);
    }
}
