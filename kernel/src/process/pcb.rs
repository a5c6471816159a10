//! The process control block.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use super::{ProcFlags, WaitState, MAX_THREAD, PROC_NAME_LEN};
use crate::fs::file::FilesStruct;
use crate::mm::phys::FrameNumber;
use crate::mm::AddressSpace;

/// Process identifier, unique in `[1, MAX_PID)`; pid 0 is the idle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task state over its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Allocated but not yet runnable.
    Uninit,
    /// Blocked; `wait_state` says why.
    Sleeping,
    /// On a run queue, or the running task itself.
    Runnable,
    /// Exited, awaiting reap by the parent.
    Zombie,
}

/// Saved callee context for kernel-side switches (mirrors switch.S layout).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub eip: u32,
    pub esp: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

/// User-mode register file captured at trap entry. Register A carries the
/// syscall number in and the return value out; D, C, B, DI, SI carry the
/// arguments.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
}

/// A kernel-visible task.
pub struct Process {
    pub pid: Pid,
    pub state: ProcState,
    /// Times this task has been given the CPU.
    pub runs: u32,
    /// Head frame of the kernel stack run.
    pub kstack: Option<FrameNumber>,
    pub need_resched: bool,
    pub parent: Option<Pid>,
    /// Eldest child.
    pub cptr: Option<Pid>,
    /// Younger sibling.
    pub yptr: Option<Pid>,
    /// Older sibling.
    pub optr: Option<Pid>,
    /// Address space; `None` for kernel threads.
    pub space: Option<Arc<Mutex<AddressSpace>>>,
    pub context: Context,
    pub tf: TrapFrame,
    /// Physical address of the page directory, kept for context switches.
    pub cr3: usize,
    pub flags: ProcFlags,
    pub name: String,
    pub exit_code: i32,
    pub wait_state: WaitState,
    /// Open-file state; shared among threads.
    pub files: Option<Arc<Mutex<FilesStruct>>>,
    // Scheduler-private accounting.
    pub time_slice: u32,
    pub vruntime: u32,
    pub cfs_prior: u32,
    pub stride: u32,
    pub stride_prior: u32,
    /// True for a cloned thread sharing its parent's space.
    pub is_thread: bool,
    /// Index into the parent's stack-slot array; 0 means main thread.
    pub stack_slot: usize,
    /// Per-main-thread stack slots: 0 free, otherwise the occupant's pid.
    /// Slot 0 is the main thread itself.
    pub thread_slots: [u32; MAX_THREAD],
}

impl Process {
    /// Fresh control block with neutral scheduling state. Name is truncated
    /// to the historical limit.
    pub fn new_kernel(pid: Pid, name: &str) -> Self {
        let mut slots = [0u32; MAX_THREAD];
        slots[0] = pid.0;
        Self {
            pid,
            state: ProcState::Uninit,
            runs: 0,
            kstack: None,
            need_resched: false,
            parent: None,
            cptr: None,
            yptr: None,
            optr: None,
            space: None,
            context: Context::default(),
            tf: TrapFrame::default(),
            cr3: 0,
            flags: ProcFlags::empty(),
            name: truncate_name(name),
            exit_code: 0,
            wait_state: WaitState::empty(),
            files: None,
            time_slice: 0,
            vruntime: 0,
            cfs_prior: 10,
            stride: 0,
            stride_prior: 10,
            is_thread: false,
            stack_slot: 0,
            thread_slots: slots,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = truncate_name(name);
    }

    /// A main thread with live thread children must outlive them.
    pub fn is_ancestral_thread(&self) -> bool {
        !self.is_thread && self.thread_slots[1..].iter().any(|&s| s != 0)
    }

    /// Lowest free thread stack slot, if any. Slot 0 is never handed out.
    pub fn free_thread_slot(&self) -> Option<usize> {
        (1..MAX_THREAD).find(|&i| self.thread_slots[i] == 0)
    }
}

fn truncate_name(name: &str) -> String {
    let mut s = String::from(name);
    if s.len() > PROC_NAME_LEN {
        s.truncate(PROC_NAME_LEN);
    }
    s
}
