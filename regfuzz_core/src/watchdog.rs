use crate::arena::{Arena, ArenaNode, MemoryCounters, collect_totals};
use crate::findings::FindingReporter;
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Finding reported when the pattern arena outgrows its ceiling.
pub const REGEX_MEMORY_FINDING: &str = "regexmem";

/// Arena statistics at one point in time plus the change in total space since the
/// previous sample of the same lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub counters: MemoryCounters,
    pub delta: i64,
}

/// A chain of snapshots of one arena tree. Deltas are only meaningful within a
/// lineage; two lineages never share their previous sample.
#[derive(Debug, Clone)]
pub struct SnapshotLineage {
    label: &'static str,
    previous: MemoryCounters,
}

impl SnapshotLineage {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            previous: MemoryCounters::default(),
        }
    }

    pub fn sample(&mut self, root: &dyn ArenaNode) -> MemorySnapshot {
        let counters = collect_totals(root);
        let delta = counters.total_space as i64 - self.previous.total_space as i64;
        self.previous = counters;
        trace!(lineage = self.label, total = counters.total_space, delta, "arena sampled");
        MemorySnapshot { counters, delta }
    }
}

/// Memory ceiling for the pattern arena. Checked from the cancellation hook.
#[derive(Debug)]
pub struct MemoryBudget {
    arena: Arena,
    ceiling: usize,
    lineage: SnapshotLineage,
    reporter: FindingReporter,
}

impl MemoryBudget {
    pub fn new(arena: Arena, ceiling: usize, reporter: FindingReporter) -> Self {
        Self {
            arena,
            ceiling,
            lineage: SnapshotLineage::new("pattern"),
            reporter,
        }
    }

    /// Returns `true` when the arena tree uses more than the ceiling.
    pub fn check(&mut self) -> bool {
        let snapshot = self.lineage.sample(&self.arena);
        let used = snapshot.counters.used();
        debug!(
            arena = self.arena.name(),
            used,
            delta = snapshot.delta,
            "pattern arena sampled"
        );
        if used <= self.ceiling {
            return false;
        }
        warn!(
            "too much memory used in {} (total={} MB > work_mem={} MB)",
            self.arena.name(),
            used / 1024 / 1024,
            self.ceiling / 1024 / 1024
        );
        self.reporter.report(
            REGEX_MEMORY_FINDING,
            &format!("{used} bytes used, ceiling {}", self.ceiling),
        );
        true
    }
}
