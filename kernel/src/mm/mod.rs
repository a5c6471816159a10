//! Memory management: physical frames, two-level page tables, address
//! spaces with demand paging, and the page-replacement engine.

pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod phys;
pub mod swap;
pub mod vas;
pub mod vma;
pub mod vmm;

pub use page_table::EntryFlags;
pub use phys::{FitPolicy, FrameFlags, FrameNumber, PhysMemory};
pub use swap::{EnhancedClockSwap, ExtendedClockSwap, FifoSwap, SwapManager};
pub use vas::AddressSpace;
pub use vma::{Vma, VmFlags};
pub use vmm::MemoryManager;

/// Size of a page and of a physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Entries per page table (and per directory).
pub const PT_ENTRIES: usize = 1024;

/// Virtual span covered by one second-level table (4 MiB).
pub const PT_SPAN: usize = PAGE_SIZE * PT_ENTRIES;

/// Lowest user-mappable address.
pub const USER_BASE: usize = 0x0020_0000;

/// One past the highest user-mappable address.
pub const USER_TOP: usize = 0xB000_0000;

/// Default load address for executable text.
pub const UTEXT: usize = 0x0080_0000;

/// Top of the main user stack; stacks grow down from here.
pub const USTACK_TOP: usize = USER_TOP;

/// Pages in one user stack.
pub const USTACK_PAGES: usize = 256;

/// Bytes in one user stack region (also the stride between thread slots).
pub const USTACK_SIZE: usize = USTACK_PAGES * PAGE_SIZE;

/// Pages in a kernel stack.
pub const KSTACK_PAGES: usize = 2;

/// Round `addr` down to a page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to a page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Is `[start, end)` a well-formed range inside the user region?
#[inline]
pub const fn user_range_ok(start: usize, end: usize) -> bool {
    USER_BASE <= start && start < end && end <= USER_TOP
}
