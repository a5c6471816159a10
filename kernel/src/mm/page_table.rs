//! Two-level page-table walker.
//!
//! A directory and its tables are ordinary frames whose payload holds 1024
//! little-endian 32-bit entries. An entry carries a frame number in its top
//! 20 bits and permission bits below. Walkers take the owning [`PhysMemory`]
//! explicitly; nothing here touches hardware beyond the TLB shim.

use core::fmt::Write as _;

use alloc::string::String;

use bitflags::bitflags;

use super::phys::{FrameNumber, PhysMemory};
use super::{user_range_ok, PAGE_SIZE, PT_ENTRIES, PT_SPAN};
use crate::arch;
use crate::error::MemError;

bitflags! {
    /// Page-table entry permission bits (x86 layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// Mask selecting the flag bits of an entry.
pub const FLAGS_MASK: u32 = 0xFFF;

#[inline]
fn pde_index(addr: usize) -> usize {
    (addr >> 22) & 0x3FF
}

#[inline]
fn pte_index(addr: usize) -> usize {
    (addr >> 12) & 0x3FF
}

/// Frame number stored in an entry.
#[inline]
pub fn entry_frame(entry: u32) -> FrameNumber {
    FrameNumber((entry >> 12) as usize)
}

/// Compose an entry from a frame and flags.
#[inline]
pub fn make_entry(frame: FrameNumber, flags: EntryFlags) -> u32 {
    ((frame.0 as u32) << 12) | flags.bits()
}

/// Location of one leaf entry: which table frame, which index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    pub table: FrameNumber,
    pub index: usize,
}

impl PteSlot {
    pub fn read(&self, mem: &PhysMemory) -> u32 {
        read_entry(mem, self.table, self.index)
    }

    pub fn write(&self, mem: &mut PhysMemory, value: u32) {
        write_entry(mem, self.table, self.index, value);
    }
}

fn read_entry(mem: &PhysMemory, table: FrameNumber, index: usize) -> u32 {
    debug_assert!(index < PT_ENTRIES);
    let off = index * 4;
    let page = mem.page(table);
    u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}

fn write_entry(mem: &mut PhysMemory, table: FrameNumber, index: usize, value: u32) {
    debug_assert!(index < PT_ENTRIES);
    let off = index * 4;
    mem.page_mut(table)[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Allocate and zero a fresh page directory.
pub fn create_directory(mem: &mut PhysMemory) -> Result<FrameNumber, MemError> {
    let root = mem.alloc(1)?;
    mem.zero_page(root);
    mem.ref_inc(root);
    Ok(root)
}

/// Release a page directory frame (tables must already be gone).
pub fn destroy_directory(mem: &mut PhysMemory, root: FrameNumber) {
    if mem.ref_dec(root) == 0 {
        mem.free(root, 1);
    }
}

/// Find the leaf slot for `addr`, creating the intermediate table on demand.
///
/// With `create` false an absent table yields `Ok(None)`. A freshly created
/// table frame starts zeroed with refcount 1 and is entered into the
/// directory as `present | writable | user`.
pub fn locate(
    mem: &mut PhysMemory,
    root: FrameNumber,
    addr: usize,
    create: bool,
) -> Result<Option<PteSlot>, MemError> {
    let di = pde_index(addr);
    let pde = read_entry(mem, root, di);
    let table = if pde & EntryFlags::PRESENT.bits() != 0 {
        entry_frame(pde)
    } else {
        if !create {
            return Ok(None);
        }
        let table = mem.alloc(1)?;
        mem.zero_page(table);
        mem.ref_inc(table);
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
        write_entry(mem, root, di, make_entry(table, flags));
        table
    };
    Ok(Some(PteSlot {
        table,
        index: pte_index(addr),
    }))
}

/// Map `frame` at `addr` with `perm` (PRESENT is implied), replacing any
/// previous mapping and keeping reference counts balanced.
pub fn install(
    mem: &mut PhysMemory,
    root: FrameNumber,
    frame: FrameNumber,
    addr: usize,
    perm: EntryFlags,
) -> Result<(), MemError> {
    let slot = locate(mem, root, addr, true)?.expect("create-mode locate");
    mem.ref_inc(frame);
    let old = slot.read(mem);
    if old & EntryFlags::PRESENT.bits() != 0 {
        if entry_frame(old) == frame {
            // Re-mapping the same frame; cancel the spurious bump.
            mem.ref_dec(frame);
        } else {
            clear_slot(mem, &slot, addr);
        }
    }
    slot.write(mem, make_entry(frame, perm | EntryFlags::PRESENT));
    arch::tlb_flush_page(addr);
    Ok(())
}

/// Drop the mapping at `addr`, releasing the target frame when its refcount
/// reaches zero.
pub fn remove(mem: &mut PhysMemory, root: FrameNumber, addr: usize) -> Result<(), MemError> {
    if let Some(slot) = locate(mem, root, addr, false)? {
        clear_slot(mem, &slot, addr);
    }
    Ok(())
}

fn clear_slot(mem: &mut PhysMemory, slot: &PteSlot, addr: usize) {
    let entry = slot.read(mem);
    if entry & EntryFlags::PRESENT.bits() != 0 {
        let target = entry_frame(entry);
        if mem.ref_dec(target) == 0 {
            mem.free(target, 1);
        }
        slot.write(mem, 0);
        arch::tlb_flush_page(addr);
    }
}

/// Remove every leaf mapping for pages inside the user range
/// `[start, end)`. Swap-slot entries are cleared as well.
pub fn unmap_range(mem: &mut PhysMemory, root: FrameNumber, start: usize, end: usize) {
    assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);
    assert!(user_range_ok(start, end));

    let mut addr = start;
    while addr < end {
        let slot = match locate(mem, root, addr, false).expect("no alloc in lookup mode") {
            Some(s) => s,
            None => {
                // Whole table absent; skip to the next 4 MiB boundary.
                addr = (addr + PT_SPAN) & !(PT_SPAN - 1);
                continue;
            }
        };
        let entry = slot.read(mem);
        if entry & EntryFlags::PRESENT.bits() != 0 {
            clear_slot(mem, &slot, addr);
        } else if entry != 0 {
            // Non-present but non-zero encodes a swap slot; just drop it.
            slot.write(mem, 0);
        }
        addr += PAGE_SIZE;
    }
}

/// Free every intermediate table spanned by `[start, end)` and clear the
/// directory entries. Call after [`unmap_range`].
pub fn exit_range(mem: &mut PhysMemory, root: FrameNumber, start: usize, end: usize) {
    assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);
    assert!(user_range_ok(start, end));

    let mut addr = start & !(PT_SPAN - 1);
    while addr < end {
        let di = pde_index(addr);
        let pde = read_entry(mem, root, di);
        if pde & EntryFlags::PRESENT.bits() != 0 {
            let table = entry_frame(pde);
            if mem.ref_dec(table) == 0 {
                mem.free(table, 1);
            }
            write_entry(mem, root, di, 0);
        }
        match addr.checked_add(PT_SPAN) {
            Some(next) => addr = next,
            None => break,
        }
    }
}

/// Copy every present leaf in `[start, end)` from one directory to another,
/// duplicating the payload into freshly allocated frames. The baseline is an
/// eager copy; sharing is an extension point.
pub fn copy_range(
    mem: &mut PhysMemory,
    to: FrameNumber,
    from: FrameNumber,
    start: usize,
    end: usize,
) -> Result<(), MemError> {
    assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);
    assert!(user_range_ok(start, end));

    let mut addr = start;
    while addr < end {
        let src = match locate(mem, from, addr, false)? {
            Some(s) => s,
            None => {
                addr = (addr + PT_SPAN) & !(PT_SPAN - 1);
                continue;
            }
        };
        let entry = src.read(mem);
        if entry & EntryFlags::PRESENT.bits() != 0 {
            let perm = EntryFlags::from_bits_truncate(entry)
                & (EntryFlags::USER | EntryFlags::WRITABLE);
            let src_frame = entry_frame(entry);
            let new_frame = mem.alloc(1)?;
            mem.copy_page(src_frame, new_frame);
            install(mem, to, new_frame, addr, perm)?;
        }
        addr += PAGE_SIZE;
    }
    Ok(())
}

/// Render the populated portions of a directory, one line per run of
/// identically-permissioned entries. Backs the `pgdir` syscall.
pub fn dump(mem: &PhysMemory, root: FrameNumber) -> String {
    let perm_str = |e: u32| {
        let mut s = String::new();
        s.push(if e & EntryFlags::USER.bits() != 0 { 'u' } else { '-' });
        s.push('r');
        s.push(if e & EntryFlags::WRITABLE.bits() != 0 { 'w' } else { '-' });
        s
    };

    let mut out = String::new();
    let _ = writeln!(out, "-------------------- BEGIN --------------------");
    let mut di = 0;
    while di < PT_ENTRIES {
        let pde = read_entry(mem, root, di);
        if pde & EntryFlags::PRESENT.bits() == 0 {
            di += 1;
            continue;
        }
        let _ = writeln!(
            out,
            "PDE({:03x}) {:08x}-{:08x} {}",
            di,
            di * PT_SPAN,
            (di + 1) * PT_SPAN,
            perm_str(pde)
        );
        let table = entry_frame(pde);
        let mut ti = 0;
        while ti < PT_ENTRIES {
            let pte = read_entry(mem, table, ti);
            if pte & EntryFlags::PRESENT.bits() == 0 {
                ti += 1;
                continue;
            }
            let perm = pte & (EntryFlags::USER | EntryFlags::WRITABLE).bits();
            let first = ti;
            while ti < PT_ENTRIES {
                let e = read_entry(mem, table, ti);
                if e & EntryFlags::PRESENT.bits() == 0
                    || e & (EntryFlags::USER | EntryFlags::WRITABLE).bits() != perm
                {
                    break;
                }
                ti += 1;
            }
            let base = di * PT_SPAN;
            let _ = writeln!(
                out,
                "  |-- PTE({:05x}) {:08x}-{:08x} {}",
                ti - first,
                base + first * PAGE_SIZE,
                base + ti * PAGE_SIZE,
                perm_str(pte)
            );
        }
        di += 1;
    }
    let _ = writeln!(out, "--------------------- END ---------------------");
    out
}
