//! Pluggable CPU scheduling.
//!
//! The scheduler vocabulary is fixed: init, enqueue, dequeue, pick_next,
//! tick. Both shipped implementations keep the runnable set in a balanced
//! ordered tree keyed on a composite `(metric, pid)` so that insert, erase,
//! and minimum lookup are logarithmic and ties are broken deterministically.

extern crate alloc;

pub mod cfs;
pub mod stride;

pub use cfs::CfsScheduler;
pub use stride::StrideScheduler;

use crate::process::pcb::{Pid, Process};
use crate::process::table::ProcessTable;

/// Default time-slice budget handed to a task on (re-)enqueue.
pub const MAX_TIME_SLICE: u32 = 5;

/// A scheduling policy over the runnable set.
pub trait Scheduler: Send {
    fn name(&self) -> &'static str;

    /// Reset to an empty runnable set.
    fn init(&mut self);

    /// Add a runnable task. A task arriving with an exhausted or oversized
    /// slice gets a fresh `max_time_slice`.
    fn enqueue(&mut self, max_time_slice: u32, proc: &mut Process);

    /// Remove a task, if enqueued.
    fn dequeue(&mut self, proc: &mut Process);

    /// The next task to run, without removing it. Stride advances the
    /// winner's accumulator here, which is why the table is passed in.
    fn pick_next(&mut self, table: &mut ProcessTable) -> Option<Pid>;

    /// Per-tick accounting on the running (dequeued) task.
    fn tick(&mut self, proc: &mut Process);

    /// Number of enqueued tasks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The run queue: one scheduler plus its slice budget.
pub struct RunQueue {
    pub max_time_slice: u32,
    sched: alloc::boxed::Box<dyn Scheduler>,
}

impl RunQueue {
    pub fn new(sched: alloc::boxed::Box<dyn Scheduler>) -> Self {
        let mut rq = Self {
            max_time_slice: MAX_TIME_SLICE,
            sched,
        };
        rq.sched.init();
        rq
    }

    pub fn name(&self) -> &'static str {
        self.sched.name()
    }

    pub fn enqueue(&mut self, proc: &mut Process) {
        self.sched.enqueue(self.max_time_slice, proc);
    }

    pub fn dequeue(&mut self, proc: &mut Process) {
        self.sched.dequeue(proc);
    }

    pub fn pick_next(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        self.sched.pick_next(table)
    }

    pub fn tick(&mut self, proc: &mut Process) {
        self.sched.tick(proc);
    }

    pub fn len(&self) -> usize {
        self.sched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sched.is_empty()
    }
}
