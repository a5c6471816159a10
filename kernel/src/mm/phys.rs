//! Physical page allocator.
//!
//! Frames are tracked by a descriptor table; free memory is a set of maximal
//! contiguous runs whose heads sit in a single address-sorted list. Allocation
//! walks the runs under the configured fit policy and splits; free coalesces
//! with both neighbors. The payload region backs every frame with its 4 KiB
//! of storage, which is also where page tables themselves live.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::PAGE_SIZE;
use crate::error::MemError;

bitflags! {
    /// Frame descriptor status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Kernel-owned; never enters the free list.
        const RESERVED = 1 << 0;
        /// This frame heads a free run; `run_length` is meaningful.
        const FREE_HEAD = 1 << 1;
    }
}

/// Physical frame number (physical address divided by the page size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Physical byte address of the frame's first byte.
    pub const fn addr(&self) -> usize {
        self.0 * PAGE_SIZE
    }

    pub const fn from_addr(addr: usize) -> Self {
        Self(addr / PAGE_SIZE)
    }
}

/// Per-frame descriptor.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: FrameFlags,
    /// Mappings (or kernel objects) holding this frame alive.
    pub ref_count: u32,
    /// Length of the free run headed here; only meaningful on a FREE_HEAD.
    pub run_length: usize,
    /// Virtual address this frame backs, recorded for the replacement engine.
    pub back_vaddr: usize,
}

impl Frame {
    const fn empty() -> Self {
        Self {
            flags: FrameFlags::empty(),
            ref_count: 0,
            run_length: 0,
            back_vaddr: 0,
        }
    }
}

/// Free-run selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPolicy {
    /// First run long enough, in address order.
    First,
    /// Smallest satisfying run; ties broken by lowest address.
    Best,
    /// Largest satisfying run; ties broken by lowest address.
    Worst,
}

/// The machine's physical memory: descriptors, payload, and the free list.
pub struct PhysMemory {
    base: FrameNumber,
    policy: FitPolicy,
    frames: Vec<Frame>,
    payload: Vec<u8>,
    /// Run head frame number -> run length, naturally address-sorted.
    free_runs: BTreeMap<usize, usize>,
    nr_free: usize,
}

impl PhysMemory {
    /// Build a region of `n` non-reserved frames starting at `base`, handed
    /// over as one free run.
    pub fn new(base: FrameNumber, n: usize, policy: FitPolicy) -> Self {
        assert!(n > 0, "empty physical region");
        let mut mem = Self {
            base,
            policy,
            frames: vec![Frame::empty(); n],
            payload: vec![0u8; n * PAGE_SIZE],
            free_runs: BTreeMap::new(),
            nr_free: 0,
        };
        mem.frames[0].flags = FrameFlags::FREE_HEAD;
        mem.frames[0].run_length = n;
        mem.free_runs.insert(base.0, n);
        mem.nr_free = n;
        mem
    }

    pub fn base(&self) -> FrameNumber {
        self.base
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn nr_free(&self) -> usize {
        self.nr_free
    }

    pub fn fit_policy(&self) -> FitPolicy {
        self.policy
    }

    fn idx(&self, frame: FrameNumber) -> usize {
        let i = frame
            .0
            .checked_sub(self.base.0)
            .expect("frame below managed region");
        assert!(i < self.frames.len(), "frame beyond managed region");
        i
    }

    pub fn frame(&self, frame: FrameNumber) -> &Frame {
        &self.frames[self.idx(frame)]
    }

    pub fn frame_mut(&mut self, frame: FrameNumber) -> &mut Frame {
        let i = self.idx(frame);
        &mut self.frames[i]
    }

    /// Bump a frame's reference count, returning the new value.
    pub fn ref_inc(&mut self, frame: FrameNumber) -> u32 {
        let f = self.frame_mut(frame);
        f.ref_count += 1;
        f.ref_count
    }

    /// Drop a reference, returning the new count. Underflow is corruption.
    pub fn ref_dec(&mut self, frame: FrameNumber) -> u32 {
        let f = self.frame_mut(frame);
        assert!(f.ref_count > 0, "refcount underflow on frame {:#x}", frame.0);
        f.ref_count -= 1;
        f.ref_count
    }

    /// Read access to a frame's 4 KiB payload.
    pub fn page(&self, frame: FrameNumber) -> &[u8] {
        let i = self.idx(frame);
        &self.payload[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
    }

    /// Write access to a frame's 4 KiB payload.
    pub fn page_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        let i = self.idx(frame);
        &mut self.payload[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
    }

    pub fn zero_page(&mut self, frame: FrameNumber) {
        self.page_mut(frame).fill(0);
    }

    /// Copy one frame's payload into another.
    pub fn copy_page(&mut self, from: FrameNumber, to: FrameNumber) {
        let src = self.idx(from) * PAGE_SIZE;
        let dst = self.idx(to) * PAGE_SIZE;
        self.payload.copy_within(src..src + PAGE_SIZE, dst);
    }

    /// Allocate `n` contiguous frames under the fit policy.
    pub fn alloc(&mut self, n: usize) -> Result<FrameNumber, MemError> {
        assert!(n > 0, "zero-length allocation");
        if n > self.nr_free {
            return Err(MemError::OutOfMemory);
        }

        let chosen = match self.policy {
            FitPolicy::First => self
                .free_runs
                .iter()
                .find(|&(_, &len)| len >= n)
                .map(|(&head, &len)| (head, len)),
            FitPolicy::Best => {
                let mut best: Option<(usize, usize)> = None;
                for (&head, &len) in self.free_runs.iter() {
                    if len >= n && best.map_or(true, |(_, bl)| len < bl) {
                        best = Some((head, len));
                    }
                }
                best
            }
            FitPolicy::Worst => {
                let mut worst: Option<(usize, usize)> = None;
                for (&head, &len) in self.free_runs.iter() {
                    if len >= n && worst.map_or(true, |(_, wl)| len > wl) {
                        worst = Some((head, len));
                    }
                }
                worst
            }
        };

        let (head, len) = chosen.ok_or(MemError::OutOfMemory)?;
        self.free_runs.remove(&head);
        {
            let f = self.frame_mut(FrameNumber(head));
            f.flags.remove(FrameFlags::FREE_HEAD);
            f.run_length = 0;
        }
        if len > n {
            let rest = head + n;
            let f = self.frame_mut(FrameNumber(rest));
            f.flags.insert(FrameFlags::FREE_HEAD);
            f.run_length = len - n;
            self.free_runs.insert(rest, len - n);
        }
        self.nr_free -= n;
        Ok(FrameNumber(head))
    }

    /// Return `n` frames starting at `base` to the free list, merging with
    /// adjacent runs.
    pub fn free(&mut self, base: FrameNumber, n: usize) {
        assert!(n > 0, "zero-length free");
        for i in 0..n {
            let f = self.frame_mut(FrameNumber(base.0 + i));
            assert!(
                !f.flags.contains(FrameFlags::RESERVED)
                    && !f.flags.contains(FrameFlags::FREE_HEAD),
                "freeing reserved or already-free frame {:#x}",
                base.0 + i
            );
            f.flags = FrameFlags::empty();
            f.ref_count = 0;
            f.run_length = 0;
            f.back_vaddr = 0;
        }

        let mut head = base.0;
        let mut len = n;

        // Absorb the run that starts where this one ends.
        if let Some((&next, &next_len)) = self.free_runs.range(head + len..).next() {
            if head + len == next {
                self.free_runs.remove(&next);
                let f = self.frame_mut(FrameNumber(next));
                f.flags.remove(FrameFlags::FREE_HEAD);
                f.run_length = 0;
                len += next_len;
            }
        }
        // Absorb into the run that ends where this one starts.
        if let Some((&prev, &prev_len)) = self.free_runs.range(..head).next_back() {
            assert!(prev + prev_len <= head, "free list overlap at {:#x}", head);
            if prev + prev_len == head {
                self.free_runs.remove(&prev);
                let f = self.frame_mut(FrameNumber(head));
                f.flags.remove(FrameFlags::FREE_HEAD);
                head = prev;
                len += prev_len;
            }
        }

        {
            let f = self.frame_mut(FrameNumber(head));
            f.flags.insert(FrameFlags::FREE_HEAD);
            f.run_length = len;
        }
        self.free_runs.insert(head, len);
        self.nr_free += n;

        #[cfg(feature = "paranoid-checks")]
        self.check_free_list();
    }

    /// Number of distinct free runs (test and diagnostics hook).
    pub fn free_run_count(&self) -> usize {
        self.free_runs.len()
    }

    /// Head and length of the run containing the lowest free address.
    pub fn first_free_run(&self) -> Option<(FrameNumber, usize)> {
        self.free_runs
            .iter()
            .next()
            .map(|(&h, &l)| (FrameNumber(h), l))
    }

    /// Verify the free-list invariants: sorted, non-adjacent, lengths
    /// consistent with descriptors and with `nr_free`.
    pub fn check_free_list(&self) {
        let mut total = 0;
        let mut prev_end: Option<usize> = None;
        for (&head, &len) in self.free_runs.iter() {
            let f = self.frame(FrameNumber(head));
            assert!(f.flags.contains(FrameFlags::FREE_HEAD));
            assert_eq!(f.run_length, len);
            if let Some(end) = prev_end {
                assert!(end < head, "adjacent or overlapping free runs");
            }
            prev_end = Some(head + len);
            total += len;
        }
        assert_eq!(total, self.nr_free, "nr_free out of sync with run lengths");
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn region(policy: FitPolicy) -> PhysMemory {
        // 8 frames starting at physical 0x1000.
        PhysMemory::new(FrameNumber::from_addr(0x1000), 8, policy)
    }

    #[test]
    fn first_fit_splits_at_the_front() {
        let mut mem = region(FitPolicy::First);
        let got = mem.alloc(3).expect("3 of 8 frames");
        assert_eq!(got.addr(), 0x1000);
        let (head, len) = mem.first_free_run().unwrap();
        assert_eq!(head.addr(), 0x4000);
        assert_eq!(len, 5);
        assert_eq!(mem.nr_free(), 5);
    }

    #[test]
    fn free_coalesces_back_to_one_run() {
        let mut mem = region(FitPolicy::First);
        let got = mem.alloc(3).unwrap();
        mem.free(got, 3);
        assert_eq!(mem.nr_free(), 8);
        assert_eq!(mem.free_run_count(), 1);
        let (head, len) = mem.first_free_run().unwrap();
        assert_eq!(head.addr(), 0x1000);
        assert_eq!(len, 8);
        mem.check_free_list();
    }

    #[test]
    fn coalesces_with_both_neighbors() {
        let mut mem = region(FitPolicy::First);
        let a = mem.alloc(2).unwrap();
        let b = mem.alloc(2).unwrap();
        let c = mem.alloc(2).unwrap();
        mem.free(a, 2);
        mem.free(c, 2);
        assert_eq!(mem.free_run_count(), 3);
        // Freeing the middle block must merge everything into one run.
        mem.free(b, 2);
        assert_eq!(mem.free_run_count(), 1);
        assert_eq!(mem.nr_free(), 8);
        mem.check_free_list();
    }

    #[test]
    fn frame_conservation_over_interleavings() {
        let mut mem = region(FitPolicy::First);
        let total = mem.total_frames();
        let mut held = alloc::vec::Vec::new();
        for &n in &[1usize, 3, 2, 1] {
            held.push((mem.alloc(n).unwrap(), n));
        }
        let in_use: usize = held.iter().map(|&(_, n)| n).sum();
        assert_eq!(mem.nr_free() + in_use, total);
        // Free in a scrambled order; conservation must hold throughout.
        held.swap(0, 2);
        for (f, n) in held {
            mem.free(f, n);
            mem.check_free_list();
        }
        assert_eq!(mem.nr_free(), total);
    }

    #[test]
    fn exhaustion_fails_without_disturbing_state() {
        let mut mem = region(FitPolicy::First);
        assert_eq!(mem.alloc(9), Err(MemError::OutOfMemory));
        let all = mem.alloc(8).unwrap();
        assert_eq!(mem.alloc(1), Err(MemError::OutOfMemory));
        assert_eq!(mem.nr_free(), 0);
        mem.free(all, 8);
        assert_eq!(mem.nr_free(), 8);
    }

    #[test]
    fn best_fit_prefers_smallest_satisfying_run() {
        let mut mem = PhysMemory::new(FrameNumber(0), 32, FitPolicy::Best);
        // Carve holes of lengths 5, 2, and 3 separated by held singles.
        let a = mem.alloc(5).unwrap();
        let _g1 = mem.alloc(1).unwrap();
        let b = mem.alloc(2).unwrap();
        let _g2 = mem.alloc(1).unwrap();
        let c = mem.alloc(3).unwrap();
        let _g3 = mem.alloc(1).unwrap();
        mem.free(a, 5);
        mem.free(b, 2);
        mem.free(c, 3);
        // Runs now: [0;5], [6;2], [9;3], tail. A request for 2 takes the
        // 2-run, not the earlier 5-run.
        assert_eq!(mem.alloc(2).unwrap(), b);
        // A request for 3 takes the 3-run.
        assert_eq!(mem.alloc(3).unwrap(), c);
    }

    #[test]
    fn best_fit_ties_break_to_lowest_address() {
        let mut mem = PhysMemory::new(FrameNumber(0), 16, FitPolicy::Best);
        let a = mem.alloc(2).unwrap();
        let _g1 = mem.alloc(1).unwrap();
        let b = mem.alloc(2).unwrap();
        let _g2 = mem.alloc(1).unwrap();
        mem.free(a, 2);
        mem.free(b, 2);
        assert_eq!(mem.alloc(2).unwrap(), a);
    }

    #[test]
    fn worst_fit_prefers_largest_run() {
        let mut mem = PhysMemory::new(FrameNumber(0), 16, FitPolicy::Worst);
        let a = mem.alloc(3).unwrap();
        let _g = mem.alloc(1).unwrap();
        // Remaining tail run has 12 frames; the freed front run has 3.
        mem.free(a, 3);
        let got = mem.alloc(2).unwrap();
        assert_eq!(got.0, 4, "worst fit must carve from the 12-frame tail");
    }

    #[test]
    fn refcounts_round_trip() {
        let mut mem = region(FitPolicy::First);
        let f = mem.alloc(1).unwrap();
        assert_eq!(mem.frame(f).ref_count, 0);
        assert_eq!(mem.ref_inc(f), 1);
        assert_eq!(mem.ref_inc(f), 2);
        assert_eq!(mem.ref_dec(f), 1);
        assert_eq!(mem.ref_dec(f), 0);
        mem.free(f, 1);
    }

    #[test]
    fn payload_survives_round_trip() {
        let mut mem = region(FitPolicy::First);
        let f = mem.alloc(1).unwrap();
        mem.page_mut(f)[123] = 0x5a;
        let g = mem.alloc(1).unwrap();
        mem.copy_page(f, g);
        assert_eq!(mem.page(g)[123], 0x5a);
        mem.zero_page(g);
        assert_eq!(mem.page(g)[123], 0);
    }

    #[test]
    #[should_panic(expected = "already-free")]
    fn double_free_is_fatal() {
        let mut mem = region(FitPolicy::First);
        let f = mem.alloc(1).unwrap();
        mem.free(f, 1);
        mem.free(f, 1);
    }
}
