//! Task entities, the process table, lifecycle operations, and kernel-side
//! synchronization.

extern crate alloc;

pub mod lifecycle;
pub mod pcb;
pub mod sync;
pub mod table;

pub use lifecycle::ProcManager;
pub use pcb::{Pid, ProcState, Process};
pub use sync::Semaphore;
pub use table::{PidAllocator, ProcessTable};

use bitflags::bitflags;

/// Longest process name kept in the control block.
pub const PROC_NAME_LEN: usize = 50;

/// Upper bound on live tasks.
pub const MAX_PROCESS: usize = 4096;

/// Pids are unique in `[1, MAX_PID)`.
pub const MAX_PID: u32 = (MAX_PROCESS * 2) as u32;

/// Stack slots per main thread, slot 0 included for the main thread itself.
pub const MAX_THREAD: usize = 16;

bitflags! {
    /// Process flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcFlags: u32 {
        /// Kill delivered; the task exits at its next return to user mode.
        const EXITING = 1 << 0;
    }
}

bitflags! {
    /// Why a sleeping task is asleep, and whether kill may interrupt it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitState: u32 {
        const INTERRUPTED = 0x8000_0000;
        const CHILD = 0x0000_0001 | Self::INTERRUPTED.bits();
        const TIMER = 0x0000_0002 | Self::INTERRUPTED.bits();
        const KBD = 0x0000_0004 | Self::INTERRUPTED.bits();
        const KSEM = 0x0000_0100;
    }
}
