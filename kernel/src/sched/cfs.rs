//! Completely-Fair-style scheduler keyed on accumulated virtual runtime.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};

use super::Scheduler;
use crate::process::pcb::{Pid, Process};
use crate::process::table::ProcessTable;

/// Tree key: vruntime first, pid as the deterministic tie-break. Two tasks
/// may legitimately share a vruntime, so the pid component is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CfsKey {
    vruntime: u32,
    pid: u32,
}

/// Ordered-tree CFS: leftmost key is the next task.
pub struct CfsScheduler {
    tree: BTreeSet<CfsKey>,
    /// Key each enqueued task was inserted under, for O(log n) erase.
    keys: BTreeMap<u32, CfsKey>,
}

impl CfsScheduler {
    pub fn new() -> Self {
        Self {
            tree: BTreeSet::new(),
            keys: BTreeMap::new(),
        }
    }
}

impl Default for CfsScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for CfsScheduler {
    fn name(&self) -> &'static str {
        "cfs_scheduler"
    }

    fn init(&mut self) {
        self.tree.clear();
        self.keys.clear();
    }

    fn enqueue(&mut self, max_time_slice: u32, proc: &mut Process) {
        let key = CfsKey {
            vruntime: proc.vruntime,
            pid: proc.pid.0,
        };
        let inserted = self.tree.insert(key);
        debug_assert!(inserted, "task {} enqueued twice", proc.pid);
        self.keys.insert(proc.pid.0, key);
        if proc.time_slice == 0 || proc.time_slice > max_time_slice {
            proc.time_slice = max_time_slice;
        }
    }

    fn dequeue(&mut self, proc: &mut Process) {
        if let Some(key) = self.keys.remove(&proc.pid.0) {
            self.tree.remove(&key);
        }
    }

    fn pick_next(&mut self, _table: &mut ProcessTable) -> Option<Pid> {
        self.tree.iter().next().map(|k| Pid(k.pid))
    }

    fn tick(&mut self, proc: &mut Process) {
        assert!(proc.cfs_prior != 0, "cfs priority must be non-zero");
        // A higher prior advances virtual time faster, i.e. lowers the
        // task's effective priority.
        proc.vruntime = proc.vruntime.wrapping_add(proc.cfs_prior);
        if proc.time_slice > 0 {
            proc.time_slice -= 1;
        }
        if proc.time_slice == 0 {
            proc.need_resched = true;
        }
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}
