//! OxidOS kernel library.
//!
//! The three load-bearing subsystems live here: memory (physical allocator,
//! two-level page tables, demand paging, page replacement), the process
//! core (lifecycle, threads, semaphores), and the pluggable schedulers,
//! together with the simple filesystem and the syscall vector. Bootstrap,
//! descriptor tables, and interrupt controllers are external collaborators.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target (unit tests, coverage): link std and use the system
// allocator so the standard test harness works. Bare metal uses the
// frame-backed heap in mm::heap.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod arch;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;

// Re-exports for tests and integrators.
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use mm::{AddressSpace, FitPolicy, FrameNumber, MemoryManager, PAGE_SIZE};
pub use process::{Pid, ProcState, Process};
pub use sched::{CfsScheduler, Scheduler, StrideScheduler};

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
