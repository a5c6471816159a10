//! The kernel aggregate: memory, processes, filesystem, and the boot-time
//! global instance.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use log::info;
use spin::Mutex;

use crate::fs::Filesystem;
use crate::mm::phys::{FitPolicy, FrameNumber};
use crate::mm::{heap, MemoryManager};
use crate::process::{ProcManager, Semaphore};
use crate::sched::Scheduler;

/// Everything the kernel owns, wired together.
pub struct Kernel {
    pub mm: MemoryManager,
    pub pm: ProcManager,
    pub fs: Option<Box<dyn Filesystem>>,
    /// Bytes emitted through the `putc` service.
    pub console: Vec<u8>,
    /// Kernel semaphores backing the `sem` service, keyed by the
    /// semaphore's user-space address.
    pub user_sems: BTreeMap<usize, Semaphore>,
}

impl Kernel {
    /// Bring up a kernel instance over `frames` physical frames.
    pub fn new(frames: usize, policy: FitPolicy, sched: Box<dyn Scheduler>) -> Self {
        let mut mm = MemoryManager::new(FrameNumber(0), frames, policy);
        heap::init(&mut mm.phys).expect("kernel heap carve-out");
        let pm = ProcManager::bootstrap(sched);
        info!("kernel up: {} frames, {:?} fit", frames, policy);
        Self {
            mm,
            pm,
            fs: None,
            console: Vec::new(),
            user_sems: BTreeMap::new(),
        }
    }

    /// Mount the root filesystem and give the current task a file table
    /// rooted at `/`.
    pub fn mount(&mut self, mut fs: Box<dyn Filesystem>) {
        let root = fs.root();
        let _ = fs.load_inode(root);
        let files = crate::fs::FilesStruct::new(root);
        let cur = self.pm.current;
        self.pm.table.get_mut(cur).unwrap().files =
            Some(alloc::sync::Arc::new(Mutex::new(files)));
        self.fs = Some(fs);
    }

    /// Timer interrupt entry: scheduler accounting plus the replacement
    /// engine's tick hook.
    pub fn timer_tick(&mut self) {
        self.pm.tick();
        self.mm.swap_tick();
    }

    /// Issue a syscall as the current task: loads the trap frame registers
    /// and runs the full dispatch path, including the return-to-user exit
    /// and preemption checks.
    pub fn syscall(&mut self, num: usize, args: [usize; 5]) -> isize {
        let cur = self.pm.current;
        {
            let tf = &mut self.pm.table.get_mut(cur).unwrap().tf;
            tf.eax = num as u32;
            tf.edx = args[0] as u32;
            tf.ecx = args[1] as u32;
            tf.ebx = args[2] as u32;
            tf.edi = args[3] as u32;
            tf.esi = args[4] as u32;
        }
        crate::syscall::dispatch(self)
    }
}

lazy_static! {
    /// The boot-time kernel singleton. One-shot init, never torn down.
    static ref KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);
}

/// Install the global kernel instance.
pub fn init_global(kernel: Kernel) {
    let mut slot = KERNEL.lock();
    assert!(slot.is_none(), "kernel already initialized");
    *slot = Some(kernel);
}

/// Run `f` against the global kernel.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let mut slot = KERNEL.lock();
    f(slot.as_mut().expect("kernel not initialized"))
}
