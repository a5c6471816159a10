//! Kernel-side synchronization: the counting semaphore.
//!
//! `up` transfers the decrement to the woken task instead of bumping the
//! counter, so a task resumed from `down` holds its slot without re-checking.
//! Short critical sections rely on interrupt masking (uniprocessor).

extern crate alloc;

use alloc::collections::VecDeque;

use super::lifecycle::ProcManager;
use super::pcb::{Pid, ProcState};
use super::WaitState;
use crate::arch::IntrGuard;

/// Counting semaphore with a FIFO wait queue of blocked tasks.
pub struct Semaphore {
    value: i32,
    queue: VecDeque<Pid>,
}

/// Outcome of a `down` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownResult {
    /// Counter was positive; the caller holds a slot.
    Acquired,
    /// Caller was queued and put to sleep; the slot arrives via `up`.
    Blocked,
}

impl Semaphore {
    pub fn new(value: i32) -> Self {
        assert!(value >= 0, "semaphore initialized negative");
        Self {
            value,
            queue: VecDeque::new(),
        }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn waiters(&self) -> usize {
        self.queue.len()
    }

    /// Decrement if positive, otherwise queue the caller, mark it sleeping
    /// on `WT_KSEM`, and yield.
    pub fn down(&mut self, pm: &mut ProcManager) -> DownResult {
        let _guard = IntrGuard::new();
        if self.value > 0 {
            self.value -= 1;
            return DownResult::Acquired;
        }
        let pid = pm.current;
        self.queue.push_back(pid);
        let proc = pm.table.get_mut(pid).expect("current task in table");
        proc.state = ProcState::Sleeping;
        proc.wait_state = WaitState::KSEM;
        pm.schedule();
        DownResult::Blocked
    }

    /// Wake the longest waiter, handing it the decrement; with no waiters,
    /// increment the counter.
    pub fn up(&mut self, pm: &mut ProcManager) {
        let _guard = IntrGuard::new();
        loop {
            match self.queue.pop_front() {
                None => {
                    self.value += 1;
                    return;
                }
                Some(pid) if pm.table.contains(pid) => {
                    pm.wakeup(pid);
                    return;
                }
                // Waiter died while queued; skip it.
                Some(_) => continue,
            }
        }
    }
}
