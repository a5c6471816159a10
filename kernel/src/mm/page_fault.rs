//! Page-fault classification and resolution.

use log::warn;

use super::page_table::{self, EntryFlags};
use super::vas::AddressSpace;
use super::vma::VmFlags;
use super::vmm::MemoryManager;
use super::page_round_down;
use crate::error::MemError;

/// Hardware error-code bits relevant to resolution.
#[derive(Debug, Clone, Copy)]
pub struct FaultCode {
    /// Set when the access was a write.
    pub write: bool,
    /// Set when the leaf entry was present.
    pub present: bool,
}

/// Resolve a fault at `addr` against `space`.
///
/// Classification follows the hardware error code: writes require a
/// writable area; a read of a not-present page requires read or exec; a
/// read fault on a present page is a protection error. Resolution either
/// allocates a fresh frame (zero leaf) or drives swap-in (slot-encoded
/// leaf), then installs the mapping and registers the page as swappable.
pub fn resolve(
    mm: &mut MemoryManager,
    space: &mut AddressSpace,
    code: FaultCode,
    addr: usize,
) -> Result<(), MemError> {
    mm.pgfault_count += 1;

    let flags = match space.find_vma(addr) {
        Some(vma) => vma.flags,
        None => {
            warn!("fault at {:#x}: no vma", addr);
            return Err(MemError::InvalidAddress { addr });
        }
    };

    match (code.present, code.write) {
        // Write faults, present or not: the area must be writable. A write
        // fault on a present entry is the COW extension point; the baseline
        // treats it as default writable handling.
        (_, true) => {
            if !flags.contains(VmFlags::WRITE) {
                warn!("write fault at {:#x} in non-writable vma", addr);
                return Err(MemError::InvalidAddress { addr });
            }
        }
        // Read of a present page should never fault.
        (true, false) => {
            warn!("read fault at {:#x} on present entry", addr);
            return Err(MemError::InvalidAddress { addr });
        }
        (false, false) => {
            if !flags.intersects(VmFlags::READ | VmFlags::EXEC) {
                warn!("read fault at {:#x} in non-readable vma", addr);
                return Err(MemError::InvalidAddress { addr });
            }
        }
    }

    let mut perm = EntryFlags::USER;
    if flags.contains(VmFlags::WRITE) {
        perm |= EntryFlags::WRITABLE;
    }
    let page_addr = page_round_down(addr);

    let slot = page_table::locate(&mut mm.phys, space.pgdir, page_addr, true)?
        .expect("create-mode locate");
    let entry = slot.read(&mm.phys);

    if entry == 0 {
        mm.alloc_and_map(space, page_addr, perm)?;
    } else if entry & EntryFlags::PRESENT.bits() == 0 {
        // Non-present, non-zero: the entry encodes a swap slot.
        if !mm.swap_enabled() {
            warn!("swap entry {:#x} at {:#x} without a swap engine", entry, page_addr);
            return Err(MemError::SwapFault);
        }
        let frame = mm.swap_in(space, page_addr)?;
        page_table::install(&mut mm.phys, space.pgdir, frame, page_addr, perm)?;
        mm.map_swappable(space, page_addr, frame, true);
        mm.phys.frame_mut(frame).back_vaddr = page_addr;
    } else {
        // Present entry under a fault we already validated: the mapping is
        // inconsistent with the hardware state.
        panic!("fault at {:#x} on present entry {:#x}", addr, entry);
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::{FitPolicy, FrameNumber};
    use crate::mm::{PAGE_SIZE, USER_BASE};

    fn rig() -> (MemoryManager, AddressSpace) {
        let mut mm = MemoryManager::new(FrameNumber(0), 32, FitPolicy::First);
        let mut space = AddressSpace::new(&mut mm.phys).unwrap();
        space
            .map(USER_BASE, 4 * PAGE_SIZE, VmFlags::READ | VmFlags::WRITE)
            .unwrap();
        space
            .map(
                USER_BASE + 8 * PAGE_SIZE,
                PAGE_SIZE,
                VmFlags::READ | VmFlags::EXEC,
            )
            .unwrap();
        (mm, space)
    }

    #[test]
    fn write_to_fresh_page_allocates_and_installs_once() {
        let (mut mm, mut space) = rig();
        let free_before = mm.phys.nr_free();
        mm.page_fault(&mut space, true, false, USER_BASE + 0x40).unwrap();
        assert_eq!(mm.pgfault_count, 1);
        // One table + one data frame.
        assert_eq!(free_before - mm.phys.nr_free(), 2);
        let slot = page_table::locate(&mut mm.phys, space.pgdir, USER_BASE, false)
            .unwrap()
            .unwrap();
        let e = slot.read(&mm.phys);
        assert!(e & EntryFlags::PRESENT.bits() != 0);
        assert!(e & EntryFlags::WRITABLE.bits() != 0);
        assert!(e & EntryFlags::USER.bits() != 0);
    }

    #[test]
    fn fault_outside_any_vma_is_invalid() {
        let (mut mm, mut space) = rig();
        let err = mm
            .page_fault(&mut space, true, false, USER_BASE + 64 * PAGE_SIZE)
            .unwrap_err();
        assert!(matches!(err, MemError::InvalidAddress { .. }));
        assert_eq!(mm.pgfault_count, 1, "resolver entry still counts");
    }

    #[test]
    fn write_to_readonly_vma_is_refused() {
        let (mut mm, mut space) = rig();
        let err = mm
            .page_fault(&mut space, true, false, USER_BASE + 8 * PAGE_SIZE)
            .unwrap_err();
        assert!(matches!(err, MemError::InvalidAddress { .. }));
    }

    #[test]
    fn exec_area_satisfies_read_fault() {
        let (mut mm, mut space) = rig();
        mm.page_fault(&mut space, false, false, USER_BASE + 8 * PAGE_SIZE)
            .unwrap();
        let slot = page_table::locate(&mut mm.phys, space.pgdir, USER_BASE + 8 * PAGE_SIZE, false)
            .unwrap()
            .unwrap();
        let e = slot.read(&mm.phys);
        assert!(e & EntryFlags::PRESENT.bits() != 0);
        assert_eq!(e & EntryFlags::WRITABLE.bits(), 0);
    }
}
