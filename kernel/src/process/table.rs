//! Pid allocation and the chained-hash process table.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use super::pcb::{Pid, Process};
use super::MAX_PID;

const HASH_SHIFT: u32 = 10;
const HASH_BUCKETS: usize = 1 << HASH_SHIFT;
const GOLDEN_RATIO_PRIME_32: u32 = 0x9e37_0001;

#[inline]
fn pid_hashfn(pid: u32) -> usize {
    (pid.wrapping_mul(GOLDEN_RATIO_PRIME_32) >> (32 - HASH_SHIFT)) as usize
}

/// Bitmap allocator over `[1, MAX_PID)`.
pub struct PidAllocator {
    bits: Vec<u64>,
    /// Scan hint: one past the last pid handed out.
    next: u32,
}

impl PidAllocator {
    pub fn new() -> Self {
        let words = (MAX_PID as usize).div_ceil(64);
        let mut a = Self {
            bits: vec![0u64; words],
            next: 1,
        };
        a.set(0); // pid 0 is the idle task, never allocatable
        a
    }

    fn set(&mut self, pid: u32) {
        self.bits[(pid / 64) as usize] |= 1 << (pid % 64);
    }

    fn clear(&mut self, pid: u32) {
        self.bits[(pid / 64) as usize] &= !(1 << (pid % 64));
    }

    fn taken(&self, pid: u32) -> bool {
        self.bits[(pid / 64) as usize] & (1 << (pid % 64)) != 0
    }

    /// Hand out the next free pid, scanning circularly from the hint.
    pub fn alloc(&mut self) -> Option<Pid> {
        let mut pid = self.next;
        for _ in 1..MAX_PID {
            if pid >= MAX_PID {
                pid = 1;
            }
            if !self.taken(pid) {
                self.set(pid);
                self.next = pid + 1;
                return Some(Pid(pid));
            }
            pid += 1;
        }
        None
    }

    pub fn free(&mut self, pid: Pid) {
        assert!(pid.0 > 0 && pid.0 < MAX_PID);
        assert!(self.taken(pid.0), "freeing unallocated pid {}", pid);
        self.clear(pid.0);
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Chained hash table over live tasks, keyed by pid. A side list preserves
/// creation order for whole-table snapshots.
pub struct ProcessTable {
    buckets: Vec<Vec<Box<Process>>>,
    order: Vec<Pid>,
    count: usize,
}

impl ProcessTable {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(HASH_BUCKETS);
        buckets.resize_with(HASH_BUCKETS, Vec::new);
        Self {
            buckets,
            order: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn insert(&mut self, proc: Box<Process>) {
        let pid = proc.pid;
        let bucket = &mut self.buckets[pid_hashfn(pid.0)];
        assert!(
            bucket.iter().all(|p| p.pid != pid),
            "pid {} already in table",
            pid
        );
        bucket.push(proc);
        self.order.push(pid);
        self.count += 1;
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        let bucket = &mut self.buckets[pid_hashfn(pid.0)];
        let i = bucket.iter().position(|p| p.pid == pid)?;
        let proc = bucket.swap_remove(i);
        self.order.retain(|&p| p != pid);
        self.count -= 1;
        Some(proc)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.buckets[pid_hashfn(pid.0)]
            .iter()
            .find(|p| p.pid == pid)
            .map(|b| &**b)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.buckets[pid_hashfn(pid.0)]
            .iter_mut()
            .find(|p| p.pid == pid)
            .map(|b| &mut **b)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    /// Pids in creation order.
    pub fn pids(&self) -> Vec<Pid> {
        self.order.clone()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pids_are_unique_and_recyclable() {
        let mut pids = PidAllocator::new();
        let a = pids.alloc().unwrap();
        let b = pids.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, Pid(1));
        pids.free(a);
        // The hint moves forward; pid 1 comes back only after a wrap or
        // when everything else is taken, but it must come back.
        let mut seen_a = false;
        for _ in 0..MAX_PID {
            let p = pids.alloc().unwrap();
            if p == a {
                seen_a = true;
                break;
            }
        }
        assert!(seen_a);
    }

    #[test]
    #[should_panic(expected = "freeing unallocated pid")]
    fn double_pid_free_is_fatal() {
        let mut pids = PidAllocator::new();
        let a = pids.alloc().unwrap();
        pids.free(a);
        pids.free(a);
    }

    #[test]
    fn table_insert_lookup_remove() {
        let mut table = ProcessTable::new();
        for pid in [3u32, 1500, 7777] {
            table.insert(Box::new(Process::new_kernel(Pid(pid), "t")));
        }
        assert_eq!(table.len(), 3);
        assert!(table.get(Pid(1500)).is_some());
        assert!(table.get(Pid(4)).is_none());
        table.get_mut(Pid(3)).unwrap().runs = 9;
        assert_eq!(table.get(Pid(3)).unwrap().runs, 9);
        let gone = table.remove(Pid(1500)).unwrap();
        assert_eq!(gone.pid, Pid(1500));
        assert_eq!(table.len(), 2);
        assert_eq!(table.pids(), alloc::vec![Pid(3), Pid(7777)]);
    }
}
