use crate::arena::{ArenaNode, render_tree};
use crate::config::ProgressSettings;
use crate::executor::ExecutionCounters;
use crate::watchdog::{MemorySnapshot, SnapshotLineage};
use tracing::{info, warn};

/// Progress is reported when the execution count is a power of two.
pub fn is_due(executions: u64) -> bool {
    executions.is_power_of_two()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub counters: ExecutionCounters,
    pub snapshot: MemorySnapshot,
    pub trials_since_last: u64,
    pub dumped_tree: bool,
}

/// Whether process memory grew in a way worth a full arena dump.
pub fn looks_like_leak(delta: i64, executions: u64, settings: &ProgressSettings) -> bool {
    delta > 0
        && (executions >= settings.leak_min_trials
            || (delta > settings.leak_burst_bytes
                && executions >= settings.leak_burst_min_trials))
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    lineage: SnapshotLineage,
    last_report_at: u64,
    settings: ProgressSettings,
}

impl ProgressReporter {
    pub fn new(settings: ProgressSettings) -> Self {
        Self {
            lineage: SnapshotLineage::new("process"),
            last_report_at: 0,
            settings,
        }
    }

    pub fn report(&mut self, counters: &ExecutionCounters, top: &dyn ArenaNode) -> ProgressReport {
        info!(
            "trial n={}  success={}  fail={}  null={}",
            counters.executions, counters.successes, counters.failures, counters.skipped
        );

        let snapshot = self.lineage.sample(top);
        let totals = snapshot.counters;
        if snapshot.delta > 0 {
            info!(
                "memory use summary: {} bytes in {} blocks; {} free ({} chunks); {} used",
                totals.total_space,
                totals.blocks,
                totals.free_space,
                totals.free_chunks,
                totals.used()
            );
        }

        let trials_since_last = counters.executions.saturating_sub(self.last_report_at);
        if trials_since_last > 0 && snapshot.delta > 0 {
            info!(
                "memory used: {} bytes in {} calls ({} bytes/call)",
                snapshot.delta,
                trials_since_last,
                snapshot.delta / trials_since_last as i64
            );
        }

        let dumped_tree = looks_like_leak(snapshot.delta, counters.executions, &self.settings);
        if dumped_tree {
            warn!("process memory keeps growing\n{}", render_tree(top));
        }

        self.last_report_at = counters.executions;
        ProgressReport {
            counters: *counters,
            snapshot,
            trials_since_last,
            dumped_tree,
        }
    }
}
