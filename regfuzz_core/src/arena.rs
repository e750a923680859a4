//! Hierarchical allocation accounting.
//!
//! An [`Arena`] does not hand out memory itself; code running under the harness
//! records its allocations against one so the watchdog and the progress reporter
//! can observe growth. Statistics are gathered through the [`ArenaNode`] trait so
//! the tree walk does not depend on how any particular arena stores its counters.

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

/// Granularity at which an arena grows when its free space runs out.
pub const BLOCK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryCounters {
    pub total_space: usize,
    pub free_space: usize,
    pub blocks: usize,
    pub free_chunks: usize,
}

impl MemoryCounters {
    pub fn used(&self) -> usize {
        self.total_space.saturating_sub(self.free_space)
    }

    pub fn add(&mut self, other: &MemoryCounters) {
        self.total_space += other.total_space;
        self.free_space += other.free_space;
        self.blocks += other.blocks;
        self.free_chunks += other.free_chunks;
    }
}

/// One node of an introspectable arena tree.
pub trait ArenaNode {
    fn name(&self) -> String;
    /// Adds this node's own counters (children excluded) to `totals`.
    fn accumulate(&self, totals: &mut MemoryCounters);
    fn for_each_child(&self, visit: &mut dyn FnMut(&dyn ArenaNode));
}

/// Depth-first visit of `node` and all of its descendants.
pub fn walk(node: &dyn ArenaNode, depth: usize, visit: &mut dyn FnMut(&dyn ArenaNode, usize)) {
    visit(node, depth);
    node.for_each_child(&mut |child| walk(child, depth + 1, visit));
}

/// Sum of the counters of `root` and every arena below it.
pub fn collect_totals(root: &dyn ArenaNode) -> MemoryCounters {
    let mut totals = MemoryCounters::default();
    walk(root, 0, &mut |node, _| node.accumulate(&mut totals));
    totals
}

/// Human-readable dump of the whole tree, one indented line per arena.
pub fn render_tree(root: &dyn ArenaNode) -> String {
    let mut out = String::new();
    let mut grand = MemoryCounters::default();
    walk(root, 0, &mut |node, depth| {
        let mut own = MemoryCounters::default();
        node.accumulate(&mut own);
        grand.add(&own);
        let _ = writeln!(
            out,
            "{:indent$}{}: {} total in {} blocks; {} free ({} chunks); {} used",
            "",
            node.name(),
            own.total_space,
            own.blocks,
            own.free_space,
            own.free_chunks,
            own.used(),
            indent = depth * 2
        );
    });
    let _ = writeln!(
        out,
        "Grand total: {} bytes in {} blocks; {} free ({} chunks); {} used",
        grand.total_space,
        grand.blocks,
        grand.free_space,
        grand.free_chunks,
        grand.used()
    );
    out
}

#[derive(Debug)]
struct ArenaInner {
    name: String,
    counters: Mutex<MemoryCounters>,
    children: Mutex<Vec<Arena>>,
}

/// Shared handle to a named accounting arena. Cloning yields another handle to the
/// same arena.
#[derive(Debug, Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Arena {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                name: name.into(),
                counters: Mutex::new(MemoryCounters::default()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Creates a new arena registered as a child of this one.
    pub fn child(&self, name: impl Into<String>) -> Arena {
        let child = Arena::new(name);
        lock(&self.inner.children).push(child.clone());
        child
    }

    pub fn remove_child(&self, child: &Arena) {
        lock(&self.inner.children).retain(|c| !Arc::ptr_eq(&c.inner, &child.inner));
    }

    pub fn allocate(&self, bytes: usize) {
        let mut counters = lock(&self.inner.counters);
        if bytes > counters.free_space {
            let block = bytes.max(BLOCK_SIZE);
            counters.total_space += block;
            counters.free_space += block;
            counters.blocks += 1;
        } else if counters.free_chunks > 0 {
            counters.free_chunks -= 1;
        }
        counters.free_space -= bytes;
    }

    pub fn free(&self, bytes: usize) {
        let mut counters = lock(&self.inner.counters);
        counters.free_space = (counters.free_space + bytes).min(counters.total_space);
        counters.free_chunks += 1;
    }

    /// Releases every block of this arena and deletes all of its children.
    pub fn reset(&self) {
        *lock(&self.inner.counters) = MemoryCounters::default();
        lock(&self.inner.children).clear();
    }

    pub fn counters(&self) -> MemoryCounters {
        *lock(&self.inner.counters)
    }

    pub fn totals(&self) -> MemoryCounters {
        collect_totals(self)
    }

    pub fn child_count(&self) -> usize {
        lock(&self.inner.children).len()
    }
}

impl ArenaNode for Arena {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn accumulate(&self, totals: &mut MemoryCounters) {
        totals.add(&self.counters());
    }

    fn for_each_child(&self, visit: &mut dyn FnMut(&dyn ArenaNode)) {
        // Snapshot the list so visitors may touch the tree.
        let children: Vec<Arena> = lock(&self.inner.children).clone();
        for child in &children {
            visit(child);
        }
    }
}
