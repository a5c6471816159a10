//! Stride scheduler keyed on an accumulated 32-bit stride.
//!
//! Strides wrap, so keys compare by the sign of their difference. That
//! ordering is consistent while all live strides stay within half the
//! 32-bit range of each other, which `BIG_STRIDE` guarantees.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use core::cmp::Ordering;

use super::Scheduler;
use crate::process::pcb::{Pid, Process};
use crate::process::table::ProcessTable;

/// Largest stride gap between two runnable tasks.
pub const BIG_STRIDE: u32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideKey {
    stride: u32,
    pid: u32,
}

impl Ord for StrideKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let diff = self.stride.wrapping_sub(other.stride) as i32;
        match diff.cmp(&0) {
            Ordering::Equal => self.pid.cmp(&other.pid),
            ord => ord,
        }
    }
}

impl PartialOrd for StrideKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered-tree stride scheduler.
pub struct StrideScheduler {
    tree: BTreeSet<StrideKey>,
    keys: BTreeMap<u32, StrideKey>,
}

impl StrideScheduler {
    pub fn new() -> Self {
        Self {
            tree: BTreeSet::new(),
            keys: BTreeMap::new(),
        }
    }
}

impl Default for StrideScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for StrideScheduler {
    fn name(&self) -> &'static str {
        "stride_scheduler"
    }

    fn init(&mut self) {
        self.tree.clear();
        self.keys.clear();
    }

    fn enqueue(&mut self, max_time_slice: u32, proc: &mut Process) {
        let key = StrideKey {
            stride: proc.stride,
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

    fn pick_next(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        let pid = self.tree.iter().next().map(|k| Pid(k.pid))?;
        // Advance the winner by a step inversely proportional to its
        // priority. The tree entry keeps its insertion key; the caller
        // dequeues before the task runs.
        if let Some(proc) = table.get_mut(pid) {
            assert!(
                (1..=19).contains(&proc.stride_prior),
                "stride priority out of range"
            );
            proc.stride = proc.stride.wrapping_add(BIG_STRIDE / (20 - proc.stride_prior));
        }
        Some(pid)
    }

    fn tick(&mut self, proc: &mut Process) {
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

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::pcb::Process;

    fn insert_task(table: &mut ProcessTable, pid: u32, stride: u32, prior: u32) {
        let mut p = Process::new_kernel(Pid(pid), "t");
        p.stride = stride;
        p.stride_prior = prior;
        table.insert(alloc::boxed::Box::new(p));
    }

    #[test]
    fn smallest_stride_wins_and_advances() {
        let mut sched = StrideScheduler::new();
        let mut table = ProcessTable::new();
        insert_task(&mut table, 1, 0, 10);
        insert_task(&mut table, 2, 5, 15);
        sched.enqueue(5, table.get_mut(Pid(1)).unwrap());
        sched.enqueue(5, table.get_mut(Pid(2)).unwrap());

        assert_eq!(sched.pick_next(&mut table), Some(Pid(1)));
        assert_eq!(table.get(Pid(1)).unwrap().stride, BIG_STRIDE / 10);

        // Re-key the winner and pick again: now B leads.
        let a = table.get_mut(Pid(1)).unwrap();
        sched.dequeue(a);
        let a = table.get_mut(Pid(1)).unwrap();
        sched.enqueue(5, a);
        assert_eq!(sched.pick_next(&mut table), Some(Pid(2)));
        assert_eq!(
            table.get(Pid(2)).unwrap().stride,
            5 + BIG_STRIDE / 5
        );
    }

    #[test]
    fn comparison_survives_wraparound() {
        let near_max = u32::MAX - 10;
        let a = StrideKey { stride: near_max, pid: 1 };
        // b's stride has wrapped past zero but is logically ahead of a.
        let b = StrideKey { stride: near_max.wrapping_add(40), pid: 2 };
        assert!(a < b);
        assert!(b > a);

        let mut sched = StrideScheduler::new();
        let mut table = ProcessTable::new();
        insert_task(&mut table, 1, near_max, 10);
        insert_task(&mut table, 2, near_max.wrapping_add(40), 10);
        sched.enqueue(5, table.get_mut(Pid(1)).unwrap());
        sched.enqueue(5, table.get_mut(Pid(2)).unwrap());
        assert_eq!(sched.pick_next(&mut table), Some(Pid(1)));
    }

    #[test]
    fn equal_strides_tie_break_on_pid() {
        let mut sched = StrideScheduler::new();
        let mut table = ProcessTable::new();
        insert_task(&mut table, 9, 100, 10);
        insert_task(&mut table, 4, 100, 10);
        sched.enqueue(5, table.get_mut(Pid(9)).unwrap());
        sched.enqueue(5, table.get_mut(Pid(4)).unwrap());
        assert_eq!(sched.pick_next(&mut table), Some(Pid(4)));
    }

    #[test]
    fn tick_only_burns_the_slice() {
        let mut sched = StrideScheduler::new();
        let mut p = Process::new_kernel(Pid(1), "t");
        p.stride = 7;
        p.time_slice = 1;
        sched.tick(&mut p);
        assert_eq!(p.stride, 7, "stride moves on pick, not on tick");
        assert!(p.need_resched);
    }
}
