//! Page-replacement engine.
//!
//! Per-AS state is the ordered queue of resident swappable frames kept on the
//! address space itself (newest at the front). Policies differ only in how a
//! victim is chosen: FIFO takes the oldest; the clock variants consult the
//! accessed/dirty bits of the leaf entry for each frame's recorded back
//! address.

extern crate alloc;

use super::page_table::{self, EntryFlags};
use super::phys::{FrameNumber, PhysMemory};
use super::vas::AddressSpace;
use super::PAGE_SIZE;
use crate::error::MemError;

/// Non-present leaf value encoding the swap slot for `addr`.
#[inline]
pub fn swap_entry_for(addr: usize) -> u32 {
    (((addr / PAGE_SIZE) + 1) << 8) as u32
}

/// Backing-device slot index encoded in a non-present leaf value.
#[inline]
pub fn swap_offset(entry: u32) -> usize {
    (entry >> 8) as usize
}

/// A pluggable replacement policy.
///
/// `map_swappable` is called when a resident page becomes eligible for
/// eviction; `swap_out_victim` removes and returns the policy's choice.
pub trait SwapManager: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self) {}

    /// Reset the per-AS private state.
    fn init_space(&self, space: &mut AddressSpace) {
        space.swap_queue.clear();
    }

    /// Clock-tick hook; none of the shipped policies use it.
    fn tick(&mut self) {}

    /// Record `frame` (backing `addr`) as swappable in `space`.
    fn map_swappable(
        &mut self,
        _mem: &mut PhysMemory,
        space: &mut AddressSpace,
        _addr: usize,
        frame: FrameNumber,
        _swap_in: bool,
    ) {
        space.swap_queue.push_front(frame);
    }

    /// Exempt a page from replacement. The shipped policies keep everything
    /// swappable.
    fn set_unswappable(&mut self, _space: &mut AddressSpace, _addr: usize) {}

    /// Choose, remove, and return the next victim frame.
    fn swap_out_victim(
        &mut self,
        mem: &mut PhysMemory,
        space: &mut AddressSpace,
        in_tick: bool,
    ) -> Result<FrameNumber, MemError>;
}

/// Leaf entry for the back address of the queue element at `idx`.
fn entry_at(mem: &mut PhysMemory, space: &mut AddressSpace, idx: usize) -> Option<(u32, usize)> {
    let frame = space.swap_queue[idx];
    let vaddr = mem.frame(frame).back_vaddr;
    let slot = page_table::locate(mem, space.pgdir, vaddr, false)
        .ok()
        .flatten()?;
    Some((slot.read(mem), vaddr))
}

fn write_entry_at(mem: &mut PhysMemory, space: &AddressSpace, idx: usize, value: u32) {
    let frame = space.swap_queue[idx];
    let vaddr = mem.frame(frame).back_vaddr;
    if let Ok(Some(slot)) = page_table::locate(mem, space.pgdir, vaddr, false) {
        slot.write(mem, value);
    }
}

/// First-in first-out: evict the page resident longest.
pub struct FifoSwap;

impl SwapManager for FifoSwap {
    fn name(&self) -> &'static str {
        "fifo swap manager"
    }

    fn swap_out_victim(
        &mut self,
        _mem: &mut PhysMemory,
        space: &mut AddressSpace,
        in_tick: bool,
    ) -> Result<FrameNumber, MemError> {
        assert!(!in_tick);
        space.swap_queue.pop_back().ok_or(MemError::SwapFault)
    }
}

/// Enhanced clock: two reference bits, up to four passes per selection.
///
/// Pass order: (accessed=0, dirty=0); then (0,1) while aging accessed bits;
/// then dirty=0; then dirty=1. All passes scan oldest first.
pub struct EnhancedClockSwap;

impl SwapManager for EnhancedClockSwap {
    fn name(&self) -> &'static str {
        "clock swap manager"
    }

    fn swap_out_victim(
        &mut self,
        mem: &mut PhysMemory,
        space: &mut AddressSpace,
        in_tick: bool,
    ) -> Result<FrameNumber, MemError> {
        assert!(!in_tick);
        if space.swap_queue.is_empty() {
            return Err(MemError::SwapFault);
        }
        let accessed = EntryFlags::ACCESSED.bits();
        let dirty = EntryFlags::DIRTY.bits();

        // Pass 1: untouched and clean.
        for idx in (0..space.swap_queue.len()).rev() {
            if let Some((e, _)) = entry_at(mem, space, idx) {
                if e & accessed == 0 && e & dirty == 0 {
                    return Ok(space.swap_queue.remove(idx).unwrap());
                }
            }
        }
        // Pass 2: untouched but dirty; age the accessed bit as we go.
        for idx in (0..space.swap_queue.len()).rev() {
            if let Some((e, vaddr)) = entry_at(mem, space, idx) {
                if e & accessed == 0 && e & dirty != 0 {
                    return Ok(space.swap_queue.remove(idx).unwrap());
                }
                write_entry_at(mem, space, idx, e & !accessed);
                crate::arch::tlb_flush_page(vaddr);
            }
        }
        // Pass 3: everything was referenced; prefer clean.
        for idx in (0..space.swap_queue.len()).rev() {
            if let Some((e, _)) = entry_at(mem, space, idx) {
                if e & dirty == 0 {
                    return Ok(space.swap_queue.remove(idx).unwrap());
                }
            }
        }
        // Pass 4: take the first dirty one.
        for idx in (0..space.swap_queue.len()).rev() {
            if let Some((e, _)) = entry_at(mem, space, idx) {
                if e & dirty != 0 {
                    return Ok(space.swap_queue.remove(idx).unwrap());
                }
            }
        }
        Err(MemError::SwapFault)
    }
}

/// Extended clock: single pass preferring clean pages, clearing dirty bits
/// as it scans; falls back to the oldest page.
pub struct ExtendedClockSwap;

impl SwapManager for ExtendedClockSwap {
    fn name(&self) -> &'static str {
        "clock swap manager with dirty bit"
    }

    fn swap_out_victim(
        &mut self,
        mem: &mut PhysMemory,
        space: &mut AddressSpace,
        in_tick: bool,
    ) -> Result<FrameNumber, MemError> {
        assert!(!in_tick);
        if space.swap_queue.is_empty() {
            return Err(MemError::SwapFault);
        }
        let dirty = EntryFlags::DIRTY.bits();

        for idx in (0..space.swap_queue.len()).rev() {
            let (e, vaddr) = match entry_at(mem, space, idx) {
                Some(pair) => pair,
                None => break,
            };
            if e & EntryFlags::PRESENT.bits() == 0 {
                break;
            }
            if e & dirty == 0 {
                return Ok(space.swap_queue.remove(idx).unwrap());
            }
            write_entry_at(mem, space, idx, e & !dirty);
            crate::arch::tlb_flush_page(vaddr);
        }
        // Whole queue was dirty: take the oldest.
        space.swap_queue.pop_back().ok_or(MemError::SwapFault)
    }
}
