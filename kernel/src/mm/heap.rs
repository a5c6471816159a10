//! Kernel heap: a small-object allocator over whole frames.
//!
//! On bare metal a `linked_list_allocator` heap is the global allocator and
//! is fed a contiguous frame run at boot. Hosted builds use the system
//! allocator installed in `lib.rs`, so this module is mostly a no-op there.

use super::phys::PhysMemory;
use super::PAGE_SIZE;
use crate::error::MemError;

/// Frames handed to the kernel heap at boot.
pub const KERNEL_HEAP_PAGES: usize = 512;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Carve `KERNEL_HEAP_PAGES` frames out of `mem` and hand them to the heap.
/// One-shot at boot; never torn down.
#[cfg(target_os = "none")]
pub fn init(mem: &mut PhysMemory) -> Result<(), MemError> {
    let base = mem.alloc(KERNEL_HEAP_PAGES)?;
    let start = mem.page_mut(base).as_mut_ptr();
    // SAFETY: the frame run was just allocated and stays owned by the heap
    // forever; payload storage for consecutive frames is contiguous.
    unsafe {
        KERNEL_HEAP
            .lock()
            .init(start, KERNEL_HEAP_PAGES * PAGE_SIZE);
    }
    log::info!("kernel heap: {} pages", KERNEL_HEAP_PAGES);
    Ok(())
}

/// Hosted builds allocate from the system allocator; nothing to set up.
#[cfg(not(target_os = "none"))]
pub fn init(_mem: &mut PhysMemory) -> Result<(), MemError> {
    Ok(())
}
