//! Address spaces: an ordered set of VMAs over one page directory.
//!
//! The VMA list is kept sorted by `start` and pairwise disjoint. A one-entry
//! cache short-circuits the common case of repeated faults in the same area.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::page_table;
use super::phys::{FrameNumber, PhysMemory};
use super::vma::{Vma, VmFlags};
use super::{page_round_down, page_round_up, user_range_ok, PAGE_SIZE};
use crate::error::MemError;

/// One user address space: root directory, VMA set, replacement-engine queue.
pub struct AddressSpace {
    vmas: Vec<Vma>,
    /// Index of the most recently hit VMA.
    cache: Option<usize>,
    pub pgdir: FrameNumber,
    map_count: usize,
    /// Tasks sharing this space; the last dropper tears it down.
    ref_count: u32,
    /// Replacement-engine private state: resident swappable frames, newest
    /// at the front.
    pub swap_queue: VecDeque<FrameNumber>,
    /// Current heap break, maintained by exec/brk.
    pub heap_start: usize,
    pub heap_end: usize,
}

impl AddressSpace {
    /// Create an empty space with a fresh page directory.
    pub fn new(mem: &mut PhysMemory) -> Result<Self, MemError> {
        let pgdir = page_table::create_directory(mem)?;
        Ok(Self {
            vmas: Vec::new(),
            cache: None,
            pgdir,
            map_count: 0,
            ref_count: 0,
            swap_queue: VecDeque::new(),
            heap_start: 0,
            heap_end: 0,
        })
    }

    pub fn map_count(&self) -> usize {
        self.map_count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn ref_inc(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    pub fn ref_dec(&mut self) -> u32 {
        assert!(self.ref_count > 0, "address-space refcount underflow");
        self.ref_count -= 1;
        self.ref_count
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    /// Index of the first VMA whose start is strictly above `addr`.
    fn upper_bound(&self, addr: usize) -> usize {
        self.vmas.partition_point(|v| v.start <= addr)
    }

    fn find_index(&self, addr: usize) -> Option<usize> {
        let ub = self.upper_bound(addr);
        if ub > 0 && self.vmas[ub - 1].contains(addr) {
            Some(ub - 1)
        } else {
            None
        }
    }

    /// The unique VMA containing `addr`, if any. Hits refresh the cache.
    pub fn find_vma(&mut self, addr: usize) -> Option<&Vma> {
        if let Some(i) = self.cache {
            if i < self.vmas.len() && self.vmas[i].contains(addr) {
                return Some(&self.vmas[i]);
            }
        }
        let i = self.find_index(addr)?;
        self.cache = Some(i);
        Some(&self.vmas[i])
    }

    /// The first VMA intersecting `[start, end)`, if any.
    pub fn find_intersection(&mut self, start: usize, end: usize) -> Option<&Vma> {
        let ub = self.upper_bound(start);
        let i = if ub > 0 && self.vmas[ub - 1].end > start {
            ub - 1
        } else if ub < self.vmas.len() && self.vmas[ub].start < end {
            ub
        } else {
            return None;
        };
        Some(&self.vmas[i])
    }

    /// Insert a VMA, keeping the list sorted and checking disjointness with
    /// its neighbors. Overlap is a caller bug and panics.
    pub fn insert_vma(&mut self, vma: Vma) {
        let pos = self.vmas.partition_point(|v| v.start <= vma.start);
        if pos > 0 {
            let prev = &self.vmas[pos - 1];
            assert!(prev.end <= vma.start, "vma overlaps predecessor");
        }
        if pos < self.vmas.len() {
            let next = &self.vmas[pos];
            assert!(vma.end <= next.start, "vma overlaps successor");
        }
        self.vmas.insert(pos, vma);
        self.map_count += 1;
        self.cache = None;
    }

    fn remove_index(&mut self, i: usize) -> Vma {
        self.map_count -= 1;
        self.cache = None;
        self.vmas.remove(i)
    }

    /// Map a fresh area. Rounds to page boundaries, requires the range to be
    /// user-accessible and free of existing mappings.
    pub fn map(&mut self, addr: usize, len: usize, flags: VmFlags) -> Result<(), MemError> {
        let start = page_round_down(addr);
        let end = page_round_up(addr + len);
        if !user_range_ok(start, end) {
            return Err(MemError::InvalidAddress { addr });
        }
        if self.find_intersection(start, end).is_some() {
            return Err(MemError::InvalidAddress { addr });
        }
        self.insert_vma(Vma::new(start, end, flags));
        Ok(())
    }

    /// Unmap `[addr, addr+len)`. Partial overlaps leave residual VMAs with
    /// the original flags; the corresponding leaf mappings are removed.
    pub fn unmap(&mut self, mem: &mut PhysMemory, addr: usize, len: usize) -> Result<(), MemError> {
        let start = page_round_down(addr);
        let end = page_round_up(addr + len);
        if !user_range_ok(start, end) {
            return Err(MemError::InvalidAddress { addr });
        }

        if self.find_intersection(start, end).is_none() {
            return Ok(());
        }

        // Interior split: one VMA strictly covers the hole.
        if let Some(i) = self.find_index(start) {
            let v = self.vmas[i].clone();
            if v.start < start && end < v.end {
                let flags = v.flags;
                self.vmas[i] = Vma::new(end, v.end, flags);
                self.insert_vma(Vma::new(v.start, start, flags));
                self.cache = None;
                page_table::unmap_range(mem, self.pgdir, start, end);
                return Ok(());
            }
        }

        // General case: trim or drop every VMA intersecting the range.
        let mut i = 0;
        while i < self.vmas.len() {
            if !self.vmas[i].overlaps(start, end) {
                if self.vmas[i].start >= end {
                    break;
                }
                i += 1;
                continue;
            }
            let v = self.remove_index(i);
            let (un_start, un_end);
            if v.start < start {
                // Keep the left piece.
                un_start = start;
                un_end = v.end.min(end);
                self.insert_vma(Vma::new(v.start, start, v.flags));
                i += 1;
            } else if end < v.end {
                // Keep the right piece.
                un_start = v.start;
                un_end = end;
                self.insert_vma(Vma::new(end, v.end, v.flags));
                i += 1;
            } else {
                un_start = v.start;
                un_end = v.end;
            }
            page_table::unmap_range(mem, self.pgdir, un_start, un_end);
        }
        Ok(())
    }

    /// Grow or carve the heap region: unmap the affected range, then merge
    /// with the immediately preceding read/write area when it abuts,
    /// otherwise create a new one.
    pub fn brk(&mut self, mem: &mut PhysMemory, addr: usize, len: usize) -> Result<(), MemError> {
        let start = page_round_down(addr);
        let end = page_round_up(addr + len);
        if !user_range_ok(start, end) {
            return Err(MemError::InvalidAddress { addr });
        }
        self.unmap(mem, start, end - start)?;

        let flags = VmFlags::READ | VmFlags::WRITE;
        if start > 0 {
            if let Some(i) = self.find_index(start - 1) {
                if self.vmas[i].end == start && self.vmas[i].flags == flags {
                    self.vmas[i].end = end;
                    self.cache = None;
                    return Ok(());
                }
            }
        }
        self.insert_vma(Vma::new(start, end, flags));
        Ok(())
    }

    /// Clone `from`'s layout into this (empty) space: twin VMAs in reverse
    /// insertion order, then an eager page copy per area.
    pub fn duplicate_from(
        &mut self,
        mem: &mut PhysMemory,
        from: &AddressSpace,
    ) -> Result<(), MemError> {
        for vma in from.vmas.iter().rev() {
            self.insert_vma(Vma::new(vma.start, vma.end, vma.flags));
            page_table::copy_range(mem, self.pgdir, from.pgdir, vma.start, vma.end)?;
        }
        self.heap_start = from.heap_start;
        self.heap_end = from.heap_end;
        Ok(())
    }

    /// Can `[addr, addr+len)` be accessed from user mode with the given
    /// intent? Stack areas refuse writes into their lowest guard page.
    pub fn user_mem_check(&mut self, addr: usize, len: usize, write: bool) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        if !user_range_ok(addr, end) {
            return false;
        }
        let mut start = addr;
        while start < end {
            let vma = match self.find_vma(start) {
                Some(v) => v.clone(),
                None => return false,
            };
            let need = if write { VmFlags::WRITE } else { VmFlags::READ };
            if !vma.flags.contains(need) {
                return false;
            }
            if write && vma.flags.contains(VmFlags::STACK) && start < vma.start + PAGE_SIZE {
                return false;
            }
            start = vma.end;
        }
        true
    }

    /// Drop every leaf mapping and intermediate table owned by this space.
    pub fn exit_mmap(&mut self, mem: &mut PhysMemory) {
        for vma in &self.vmas {
            page_table::unmap_range(mem, self.pgdir, vma.start, vma.end);
        }
        for vma in &self.vmas {
            page_table::exit_range(mem, self.pgdir, vma.start, vma.end);
        }
    }

    /// Full teardown: mappings, tables, and the directory itself. Only legal
    /// once no task references the space.
    pub fn teardown(&mut self, mem: &mut PhysMemory) {
        assert_eq!(self.ref_count, 0, "tearing down a shared address space");
        self.exit_mmap(mem);
        self.vmas.clear();
        self.map_count = 0;
        self.cache = None;
        self.swap_queue.clear();
        page_table::destroy_directory(mem, self.pgdir);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::FitPolicy;
    use crate::mm::{EntryFlags, USER_BASE};

    fn space() -> (PhysMemory, AddressSpace) {
        let mut mem = PhysMemory::new(FrameNumber(0), 128, FitPolicy::First);
        let space = AddressSpace::new(&mut mem).unwrap();
        (mem, space)
    }

    fn assert_sorted_disjoint(space: &AddressSpace) {
        for w in space.vmas().windows(2) {
            assert!(w[0].start < w[0].end);
            assert!(w[0].end <= w[1].start);
        }
    }

    #[test]
    fn interleaved_inserts_stay_sorted() {
        let (_mem, mut space) = space();
        // Descending then ascending insertion order, like the historical
        // vma self-check.
        let base = USER_BASE;
        for i in (1..=10).rev() {
            space.insert_vma(Vma::new(
                base + i * 5 * PAGE_SIZE,
                base + (i * 5 + 2) * PAGE_SIZE,
                VmFlags::READ,
            ));
        }
        for i in 11..=30 {
            space.insert_vma(Vma::new(
                base + i * 5 * PAGE_SIZE,
                base + (i * 5 + 2) * PAGE_SIZE,
                VmFlags::READ,
            ));
        }
        assert_eq!(space.map_count(), 30);
        assert_sorted_disjoint(&space);

        for i in 1..=30 {
            let s = base + i * 5 * PAGE_SIZE;
            assert!(space.find_vma(s).is_some());
            assert!(space.find_vma(s + PAGE_SIZE).is_some());
            assert!(space.find_vma(s + 2 * PAGE_SIZE).is_none());
            assert!(space.find_vma(s + 3 * PAGE_SIZE).is_none());
            assert!(space.find_vma(s + 4 * PAGE_SIZE).is_none());
        }
        assert!(space.find_vma(base - 1).is_none());
    }

    #[test]
    fn map_rejects_overlap_and_bad_ranges() {
        let (_mem, mut space) = space();
        space.map(USER_BASE, 4 * PAGE_SIZE, VmFlags::READ).unwrap();
        assert!(space.map(USER_BASE + PAGE_SIZE, PAGE_SIZE, VmFlags::READ).is_err());
        assert!(space.map(0x1000, PAGE_SIZE, VmFlags::READ).is_err());
        assert_eq!(space.map_count(), 1);
    }

    #[test]
    fn unmap_splits_interior_hole() {
        let (mut mem, mut space) = space();
        let flags = VmFlags::READ | VmFlags::WRITE;
        space.map(USER_BASE, 8 * PAGE_SIZE, flags).unwrap();
        space
            .unmap(&mut mem, USER_BASE + 2 * PAGE_SIZE, 2 * PAGE_SIZE)
            .unwrap();
        assert_eq!(space.map_count(), 2);
        assert_sorted_disjoint(&space);
        assert!(space.find_vma(USER_BASE + PAGE_SIZE).is_some());
        assert!(space.find_vma(USER_BASE + 2 * PAGE_SIZE).is_none());
        assert!(space.find_vma(USER_BASE + 3 * PAGE_SIZE).is_none());
        let right = space.find_vma(USER_BASE + 4 * PAGE_SIZE).unwrap();
        assert_eq!(right.flags, flags);
    }

    #[test]
    fn unmap_trims_edges_and_drops_covered() {
        let (mut mem, mut space) = space();
        let f = VmFlags::READ;
        space.map(USER_BASE, 2 * PAGE_SIZE, f).unwrap();
        space.map(USER_BASE + 3 * PAGE_SIZE, PAGE_SIZE, f).unwrap();
        space.map(USER_BASE + 5 * PAGE_SIZE, 3 * PAGE_SIZE, f).unwrap();
        // Range covers the tail of the first, all of the second, and the
        // head of the third.
        space
            .unmap(&mut mem, USER_BASE + PAGE_SIZE, 5 * PAGE_SIZE)
            .unwrap();
        assert_sorted_disjoint(&space);
        assert_eq!(space.map_count(), 2);
        assert!(space.find_vma(USER_BASE).is_some());
        assert!(space.find_vma(USER_BASE + 3 * PAGE_SIZE).is_none());
        assert!(space.find_vma(USER_BASE + 6 * PAGE_SIZE).is_some());
    }

    #[test]
    fn unmap_of_unmapped_range_is_ok() {
        let (mut mem, mut space) = space();
        space.unmap(&mut mem, USER_BASE, 4 * PAGE_SIZE).unwrap();
        assert!(space.unmap(&mut mem, 0x0, PAGE_SIZE).is_err());
    }

    #[test]
    fn brk_merges_with_abutting_heap() {
        let (mut mem, mut space) = space();
        let flags = VmFlags::READ | VmFlags::WRITE;
        space.map(USER_BASE, 2 * PAGE_SIZE, flags).unwrap();
        space
            .brk(&mut mem, USER_BASE + 2 * PAGE_SIZE, 3 * PAGE_SIZE)
            .unwrap();
        assert_eq!(space.map_count(), 1, "abutting rw areas must merge");
        let v = space.find_vma(USER_BASE).unwrap();
        assert_eq!(v.end, USER_BASE + 5 * PAGE_SIZE);
    }

    #[test]
    fn brk_creates_when_predecessor_differs() {
        let (mut mem, mut space) = space();
        space.map(USER_BASE, PAGE_SIZE, VmFlags::READ | VmFlags::EXEC).unwrap();
        space
            .brk(&mut mem, USER_BASE + PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        assert_eq!(space.map_count(), 2);
    }

    #[test]
    fn duplicate_copies_layout_and_pages() {
        let (mut mem, mut space) = space();
        let flags = VmFlags::READ | VmFlags::WRITE;
        space.map(USER_BASE, 2 * PAGE_SIZE, flags).unwrap();
        space.map(USER_BASE + 4 * PAGE_SIZE, PAGE_SIZE, VmFlags::READ).unwrap();
        let f = mem.alloc(1).unwrap();
        mem.page_mut(f)[0] = 0x77;
        page_table::install(
            &mut mem,
            space.pgdir,
            f,
            USER_BASE,
            EntryFlags::USER | EntryFlags::WRITABLE,
        )
        .unwrap();

        let mut twin = AddressSpace::new(&mut mem).unwrap();
        twin.duplicate_from(&mut mem, &space).unwrap();
        assert_eq!(twin.map_count(), 2);
        assert_sorted_disjoint(&twin);
        let slot = page_table::locate(&mut mem, twin.pgdir, USER_BASE, false)
            .unwrap()
            .unwrap();
        let copied = page_table::entry_frame(slot.read(&mem));
        assert_ne!(copied, f);
        assert_eq!(mem.page(copied)[0], 0x77);
    }

    #[test]
    fn user_mem_check_respects_flags_and_stack_guard() {
        let (_mem, mut space) = space();
        space.map(USER_BASE, 2 * PAGE_SIZE, VmFlags::READ).unwrap();
        space
            .map(
                USER_BASE + 8 * PAGE_SIZE,
                4 * PAGE_SIZE,
                VmFlags::READ | VmFlags::WRITE | VmFlags::STACK,
            )
            .unwrap();
        assert!(space.user_mem_check(USER_BASE, 16, false));
        assert!(!space.user_mem_check(USER_BASE, 16, true));
        // Write into the stack body is fine, the lowest page is the guard.
        assert!(space.user_mem_check(USER_BASE + 10 * PAGE_SIZE, 8, true));
        assert!(!space.user_mem_check(USER_BASE + 8 * PAGE_SIZE, 8, true));
        // Gap between the areas fails.
        assert!(!space.user_mem_check(USER_BASE, 9 * PAGE_SIZE, false));
    }

    #[test]
    fn teardown_returns_all_frames() {
        let (mut mem, mut space) = space();
        let before = mem.nr_free();
        space.map(USER_BASE, 2 * PAGE_SIZE, VmFlags::READ | VmFlags::WRITE).unwrap();
        let f = mem.alloc(1).unwrap();
        page_table::install(
            &mut mem,
            space.pgdir,
            f,
            USER_BASE,
            EntryFlags::USER | EntryFlags::WRITABLE,
        )
        .unwrap();
        space.teardown(&mut mem);
        assert_eq!(mem.nr_free(), before);
    }
}
