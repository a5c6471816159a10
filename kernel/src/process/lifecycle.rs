//! Task lifecycle: the manager, scheduling driver, and the do_* operations
//! behind fork/clone/exec/exit/wait/kill and friends.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info};
use spin::Mutex;

use super::pcb::{Pid, ProcState, Process, TrapFrame};
use super::table::{PidAllocator, ProcessTable};
use super::{ProcFlags, WaitState, MAX_PROCESS};
use crate::arch::IntrGuard;
use crate::error::{KernelError, KernelResult, MemError, ProcError};
use crate::kernel::Kernel;
use crate::mm::{
    page_round_up, AddressSpace, VmFlags, KSTACK_PAGES, PAGE_SIZE, USTACK_SIZE, USTACK_TOP, UTEXT,
};
use crate::sched::{RunQueue, Scheduler};

/// Share the address space instead of duplicating it.
pub const CLONE_VM: u32 = 0x0000_0100;
/// The new task is a thread of the caller.
pub const CLONE_THREAD: u32 = 0x0000_0200;

struct Timer {
    expires: u64,
    pid: Pid,
}

/// Owner of the task table, run queue, and the current-task pointer.
pub struct ProcManager {
    pub table: ProcessTable,
    pub pids: PidAllocator,
    pub rq: RunQueue,
    pub current: Pid,
    pub idle: Pid,
    pub init: Pid,
    timers: Vec<Timer>,
    pub ticks: u64,
}

impl ProcManager {
    /// Boot-time setup: the idle task (pid 0) and the initial task (pid 1),
    /// both kernel threads. The caller becomes the idle task.
    pub fn bootstrap(sched: Box<dyn Scheduler>) -> Self {
        let mut pm = Self {
            table: ProcessTable::new(),
            pids: PidAllocator::new(),
            rq: RunQueue::new(sched),
            current: Pid(0),
            idle: Pid(0),
            init: Pid(1),
            timers: Vec::new(),
            ticks: 0,
        };

        let mut idle = Process::new_kernel(Pid(0), "idle");
        idle.state = ProcState::Runnable;
        idle.need_resched = true;
        pm.table.insert(Box::new(idle));

        let init_pid = pm.pids.alloc().expect("fresh pid space");
        assert_eq!(init_pid, Pid(1));
        let mut init = Process::new_kernel(init_pid, "init");
        init.state = ProcState::Runnable;
        pm.table.insert(Box::new(init));
        {
            let p = pm.table.get_mut(init_pid).unwrap();
            pm.rq.enqueue(p);
        }
        info!("scheduler: {}", pm.rq.name());
        pm
    }

    pub fn current_proc(&self) -> &Process {
        self.table.get(self.current).expect("current task in table")
    }

    pub fn current_mut(&mut self) -> &mut Process {
        let pid = self.current;
        self.table.get_mut(pid).expect("current task in table")
    }

    /// Make `pid` runnable and queue it (unless it is the running task).
    pub fn wakeup(&mut self, pid: Pid) {
        let _guard = IntrGuard::new();
        let cur = self.current;
        let Some(proc) = self.table.get_mut(pid) else {
            return;
        };
        assert!(proc.state != ProcState::Zombie, "waking a zombie");
        if proc.state == ProcState::Runnable {
            return;
        }
        proc.state = ProcState::Runnable;
        proc.wait_state = WaitState::empty();
        if pid != cur {
            self.rq.enqueue(self.table.get_mut(pid).unwrap());
        }
    }

    /// Pick and switch to the next task. The outgoing task re-queues only
    /// if it is still runnable.
    pub fn schedule(&mut self) {
        let _guard = IntrGuard::new();
        let cur = self.current;
        let idle = self.idle;
        {
            let proc = self.table.get_mut(cur).expect("current task in table");
            proc.need_resched = false;
            if proc.state == ProcState::Runnable && cur != idle {
                self.rq.enqueue(proc);
            }
        }
        let next = self.rq.pick_next(&mut self.table).unwrap_or(idle);
        if next != idle {
            let proc = self.table.get_mut(next).expect("picked task in table");
            self.rq.dequeue(proc);
        }
        self.run(next);
    }

    fn run(&mut self, pid: Pid) {
        if pid != self.current {
            // Context switch point; register state is swapped here on metal.
            self.current = pid;
        }
        if let Some(proc) = self.table.get_mut(pid) {
            proc.runs += 1;
        }
    }

    /// Timer interrupt: advance the clock, fire due sleeps, account the
    /// running task's slice.
    pub fn tick(&mut self) {
        self.ticks += 1;
        let now = self.ticks;
        let mut due = Vec::new();
        self.timers.retain(|t| {
            if t.expires <= now {
                due.push(t.pid);
                false
            } else {
                true
            }
        });
        for pid in due {
            if self
                .table
                .get(pid)
                .map(|p| p.state == ProcState::Sleeping)
                .unwrap_or(false)
            {
                self.wakeup(pid);
            }
        }
        let cur = self.current;
        if cur != self.idle {
            let proc = self.table.get_mut(cur).expect("current task in table");
            self.rq.tick(proc);
        }
    }

    fn add_timer(&mut self, pid: Pid, ticks_from_now: u64) {
        self.timers.push(Timer {
            expires: self.ticks + ticks_from_now,
            pid,
        });
    }

    /// Hook the new child into its parent's sibling list.
    fn set_links(&mut self, pid: Pid, parent: Pid) {
        let old_eldest = self.table.get(parent).and_then(|p| p.cptr);
        {
            let child = self.table.get_mut(pid).unwrap();
            child.parent = Some(parent);
            child.optr = old_eldest;
            child.yptr = None;
        }
        if let Some(o) = old_eldest {
            self.table.get_mut(o).unwrap().yptr = Some(pid);
        }
        self.table.get_mut(parent).unwrap().cptr = Some(pid);
    }

    /// Unhook a task from its parent's sibling list.
    fn remove_links(&mut self, pid: Pid) {
        let (parent, yptr, optr) = {
            let p = self.table.get(pid).unwrap();
            (p.parent, p.yptr, p.optr)
        };
        match yptr {
            Some(y) => self.table.get_mut(y).unwrap().optr = optr,
            None => {
                if let Some(par) = parent {
                    self.table.get_mut(par).unwrap().cptr = optr;
                }
            }
        }
        if let Some(o) = optr {
            self.table.get_mut(o).unwrap().yptr = yptr;
        }
    }

    /// Does the current task have any child?
    pub fn current_has_child(&self) -> bool {
        self.current_proc().cptr.is_some()
    }

    fn find_zombie_child(&self, parent: Pid, want: Option<Pid>) -> Result<Option<Pid>, ProcError> {
        let mut found_any = false;
        if let Some(want_pid) = want {
            let child = self.table.get(want_pid).ok_or(ProcError::NoChild)?;
            if child.parent != Some(parent) {
                return Err(ProcError::NoChild);
            }
            return Ok((child.state == ProcState::Zombie).then_some(want_pid));
        }
        let mut c = self.table.get(parent).and_then(|p| p.cptr);
        while let Some(pid) = c {
            found_any = true;
            let child = self.table.get(pid).expect("child list consistent");
            if child.state == ProcState::Zombie {
                return Ok(Some(pid));
            }
            c = child.optr;
        }
        if found_any {
            Ok(None)
        } else {
            Err(ProcError::NoChild)
        }
    }
}

/// Clone the calling task. The child shares or duplicates the address space
/// according to `clone_flags`, gets a copy of the trap frame with register A
/// zeroed, and is enqueued runnable.
pub fn do_fork(k: &mut Kernel, clone_flags: u32, stack: u32, tf: TrapFrame) -> KernelResult<Pid> {
    if k.pm.table.len() >= MAX_PROCESS {
        return Err(ProcError::NoFreeProcess.into());
    }
    let parent_pid = k.pm.current;
    let pid = k.pm.pids.alloc().ok_or(ProcError::NoFreeProcess)?;

    let kstack = match k.mm.alloc_pages(KSTACK_PAGES) {
        Ok(f) => f,
        Err(e) => {
            k.pm.pids.free(pid);
            return Err(e.into());
        }
    };

    let (parent_name, parent_space, parent_files, sched_state, parent_cr3) = {
        let p = k.pm.table.get(parent_pid).expect("caller in table");
        (
            p.name.clone(),
            p.space.clone(),
            p.files.clone(),
            (p.vruntime, p.cfs_prior, p.stride, p.stride_prior),
            p.cr3,
        )
    };

    let (space, cr3) = match parent_space {
        None => (None, parent_cr3),
        Some(parent_arc) => {
            if clone_flags & CLONE_VM != 0 {
                let mut guard = parent_arc.lock();
                guard.ref_inc();
                let cr3 = guard.pgdir.addr();
                drop(guard);
                (Some(parent_arc), cr3)
            } else {
                let built = (|| {
                    let mut space = AddressSpace::new(&mut k.mm.phys)?;
                    k.mm.swap_init_space(&mut space);
                    let src = parent_arc.lock();
                    let copied = space.duplicate_from(&mut k.mm.phys, &src);
                    drop(src);
                    if let Err(e) = copied {
                        space.teardown(&mut k.mm.phys);
                        return Err(e);
                    }
                    Ok(space)
                })();
                match built {
                    Ok(mut space) => {
                        space.ref_inc();
                        let cr3 = space.pgdir.addr();
                        (Some(Arc::new(Mutex::new(space))), cr3)
                    }
                    Err(e) => {
                        k.mm.free_pages(kstack, KSTACK_PAGES);
                        k.pm.pids.free(pid);
                        return Err(e.into());
                    }
                }
            }
        }
    };

    let files = match parent_files {
        None => None,
        Some(parent_arc) => {
            if clone_flags & CLONE_THREAD != 0 {
                parent_arc.lock().count_inc();
                Some(parent_arc)
            } else {
                let dup = {
                    let src = parent_arc.lock();
                    match k.fs.as_mut() {
                        Some(fs) => src.duplicate(fs.as_mut()),
                        None => src.duplicate_detached(),
                    }
                };
                Some(Arc::new(Mutex::new(dup)))
            }
        }
    };

    let mut child = Box::new(Process::new_kernel(pid, &parent_name));
    child.kstack = Some(kstack);
    child.space = space;
    child.cr3 = cr3;
    child.files = files;
    child.tf = tf;
    child.tf.eax = 0; // fork returns 0 in the child
    if stack != 0 {
        child.tf.esp = stack;
    }
    let (vruntime, cfs_prior, stride, stride_prior) = sched_state;
    child.vruntime = vruntime;
    child.cfs_prior = cfs_prior;
    child.stride = stride;
    child.stride_prior = stride_prior;

    k.pm.table.insert(child);
    k.pm.set_links(pid, parent_pid);
    k.pm.wakeup(pid);
    debug!("fork: {} -> {}", parent_pid, pid);
    Ok(pid)
}

/// Create a thread: share the caller's space and files, take the lowest free
/// stack slot, and arrange for entry at `func(arg)` with `exit_fn` as the
/// return address.
pub fn do_clone(k: &mut Kernel, func: u32, arg: u32, exit_fn: u32) -> KernelResult<Pid> {
    let parent_pid = k.pm.current;
    let (slot, space_arc) = {
        let p = k.pm.table.get(parent_pid).expect("caller in table");
        let space = p.space.clone().ok_or(KernelError::InvalidArgument)?;
        let slot = p.free_thread_slot().ok_or(ProcError::NoThreadSlot)?;
        (slot, space)
    };

    let stack_top = USTACK_TOP - slot * USTACK_SIZE;
    {
        let mut space = space_arc.lock();
        if space.find_vma(stack_top - 1).is_none() {
            space.map(
                stack_top - USTACK_SIZE,
                USTACK_SIZE,
                VmFlags::READ | VmFlags::WRITE | VmFlags::STACK,
            )?;
        }
        // Initial frame: return address (the exit trampoline) then the
        // argument, cdecl style.
        let mut frame = [0u8; 8];
        frame[0..4].copy_from_slice(&exit_fn.to_le_bytes());
        frame[4..8].copy_from_slice(&arg.to_le_bytes());
        k.mm.kernel_fill(&mut space, stack_top - 8, &frame)?;
    }

    let tf = TrapFrame {
        eip: func,
        esp: (stack_top - 8) as u32,
        ..TrapFrame::default()
    };
    let pid = fork_thread_body(k, parent_pid, space_arc, tf)?;

    {
        let child = k.pm.table.get_mut(pid).unwrap();
        child.is_thread = true;
        child.stack_slot = slot;
    }
    k.pm.table.get_mut(parent_pid).unwrap().thread_slots[slot] = pid.0;
    debug!("clone: {} spawned thread {} in slot {}", parent_pid, pid, slot);
    Ok(pid)
}

fn fork_thread_body(
    k: &mut Kernel,
    parent_pid: Pid,
    space_arc: Arc<Mutex<AddressSpace>>,
    tf: TrapFrame,
) -> KernelResult<Pid> {
    if k.pm.table.len() >= MAX_PROCESS {
        return Err(ProcError::NoFreeProcess.into());
    }
    let pid = k.pm.pids.alloc().ok_or(ProcError::NoFreeProcess)?;
    let kstack = match k.mm.alloc_pages(KSTACK_PAGES) {
        Ok(f) => f,
        Err(e) => {
            k.pm.pids.free(pid);
            return Err(e.into());
        }
    };

    let (name, files, sched_state) = {
        let p = k.pm.table.get(parent_pid).unwrap();
        (
            p.name.clone(),
            p.files.clone(),
            (p.vruntime, p.cfs_prior, p.stride, p.stride_prior),
        )
    };

    let cr3 = {
        let mut guard = space_arc.lock();
        guard.ref_inc();
        guard.pgdir.addr()
    };
    if let Some(f) = &files {
        f.lock().count_inc();
    }

    let mut child = Box::new(Process::new_kernel(pid, &name));
    child.kstack = Some(kstack);
    child.space = Some(space_arc);
    child.cr3 = cr3;
    child.files = files;
    child.tf = tf;
    child.tf.eax = 0;
    let (vruntime, cfs_prior, stride, stride_prior) = sched_state;
    child.vruntime = vruntime;
    child.cfs_prior = cfs_prior;
    child.stride = stride;
    child.stride_prior = stride_prior;

    k.pm.table.insert(child);
    k.pm.set_links(pid, parent_pid);
    k.pm.wakeup(pid);
    Ok(pid)
}

/// Replace the current task's program with `image`, loaded at `UTEXT`,
/// with a fresh heap and stack and `argv` copied onto the stack.
pub fn exec_image(k: &mut Kernel, name: &str, image: &[u8], argv: &[String]) -> KernelResult<()> {
    if image.is_empty() {
        return Err(crate::error::KernelError::InvalidArgument);
    }
    let cur = k.pm.current;

    // Detach the old space first; exec never returns to the old image.
    if let Some(old) = k.pm.table.get_mut(cur).unwrap().space.take() {
        let mut guard = old.lock();
        if guard.ref_dec() == 0 {
            guard.teardown(&mut k.mm.phys);
        }
    }
    k.pm.table.get_mut(cur).unwrap().cr3 = 0;

    let mut space = AddressSpace::new(&mut k.mm.phys).map_err(crate::error::KernelError::from)?;
    k.mm.swap_init_space(&mut space);

    let build = (|| -> Result<usize, MemError> {
        space.map(UTEXT, image.len(), VmFlags::READ | VmFlags::EXEC)?;
        let heap_start = page_round_up(UTEXT + image.len());
        space.map(heap_start, PAGE_SIZE, VmFlags::READ | VmFlags::WRITE)?;
        space.heap_start = heap_start;
        space.heap_end = heap_start + PAGE_SIZE;
        space.map(
            USTACK_TOP - USTACK_SIZE,
            USTACK_SIZE,
            VmFlags::READ | VmFlags::WRITE | VmFlags::STACK,
        )?;
        k.mm.kernel_fill(&mut space, UTEXT, image)?;

        // argv strings at the top of the stack, then the pointer vector,
        // then argv and argc for the entry shim.
        let mut sp = USTACK_TOP;
        let mut ptrs = Vec::with_capacity(argv.len());
        for arg in argv.iter().rev() {
            sp -= arg.len() + 1;
            k.mm.kernel_fill(&mut space, sp, arg.as_bytes())?;
            k.mm.kernel_fill(&mut space, sp + arg.len(), &[0u8])?;
            ptrs.push(sp as u32);
        }
        ptrs.reverse();
        sp &= !3;
        sp -= (ptrs.len() + 1) * 4;
        let argv_base = sp;
        let mut vector = Vec::with_capacity((ptrs.len() + 1) * 4);
        for p in &ptrs {
            vector.extend_from_slice(&p.to_le_bytes());
        }
        vector.extend_from_slice(&0u32.to_le_bytes());
        k.mm.kernel_fill(&mut space, argv_base, &vector)?;
        sp -= 4;
        k.mm.kernel_fill(&mut space, sp, &(argv_base as u32).to_le_bytes())?;
        sp -= 4;
        k.mm.kernel_fill(&mut space, sp, &(argv.len() as u32).to_le_bytes())?;
        Ok(sp)
    })();

    let sp = match build {
        Ok(sp) => sp,
        Err(e) => {
            space.teardown(&mut k.mm.phys);
            return Err(e.into());
        }
    };

    space.ref_inc();
    let cr3 = space.pgdir.addr();
    let arc = Arc::new(Mutex::new(space));
    let proc = k.pm.table.get_mut(cur).unwrap();
    proc.space = Some(arc);
    proc.cr3 = cr3;
    proc.set_name(name);
    proc.tf = TrapFrame {
        eip: UTEXT as u32,
        esp: sp as u32,
        ..TrapFrame::default()
    };
    info!("exec: pid {} -> {} ({} bytes)", cur, name, image.len());
    Ok(())
}

/// Locate `name` through the filesystem and exec it.
pub fn do_execve(k: &mut Kernel, name: &str, argv: &[String]) -> KernelResult<()> {
    let image = {
        let fs = k.fs.as_mut().ok_or(crate::error::KernelError::from(
            crate::error::FsError::NotFound,
        ))?;
        let cwd = {
            let cur = k.pm.current_proc();
            cur.files
                .as_ref()
                .map(|f| f.lock().cwd)
                .unwrap_or_else(|| fs.root())
        };
        let ino = fs.lookup(cwd, name)?;
        let stat = fs.stat(ino)?;
        let mut buf = alloc::vec![0u8; stat.size as usize];
        let got = fs.read(ino, 0, &mut buf)?;
        buf.truncate(got);
        fs.put_inode(ino)?;
        buf
    };
    exec_image(k, name, &image, argv)
}

/// Terminate the current task: release its space and files, reparent its
/// children to the initial task, become a zombie, and wake the parent.
pub fn do_exit(k: &mut Kernel, code: i32) -> KernelResult<()> {
    let pid = k.pm.current;
    assert!(pid != k.pm.idle, "idle task exiting");
    assert!(pid != k.pm.init, "initial task exiting");

    if let Some(space) = k.pm.table.get_mut(pid).unwrap().space.take() {
        let mut guard = space.lock();
        if guard.ref_dec() == 0 {
            guard.teardown(&mut k.mm.phys);
        }
    }
    if let Some(files) = k.pm.table.get_mut(pid).unwrap().files.take() {
        let mut guard = files.lock();
        if guard.count_dec() == 0 {
            if let Some(fs) = k.fs.as_mut() {
                guard.close_all(fs.as_mut());
            }
        }
    }

    {
        let proc = k.pm.table.get_mut(pid).unwrap();
        proc.state = ProcState::Zombie;
        proc.exit_code = code;
        proc.cr3 = 0;
    }

    // Hand children over to init.
    let init = k.pm.init;
    let mut moved_zombie = false;
    while let Some(child) = k.pm.table.get(pid).unwrap().cptr {
        k.pm.remove_links(child);
        if k.pm.table.get(child).unwrap().state == ProcState::Zombie {
            moved_zombie = true;
        }
        k.pm.set_links(child, init);
    }
    if moved_zombie && k.pm.table.get(init).unwrap().wait_state == WaitState::CHILD {
        k.pm.wakeup(init);
    }

    let parent = k.pm.table.get(pid).unwrap().parent;
    if let Some(par) = parent {
        if k.pm.table.get(par).map(|p| p.wait_state) == Some(WaitState::CHILD) {
            k.pm.wakeup(par);
        }
    }
    debug!("exit: pid {} code {}", pid, code);
    k.pm.schedule();
    Ok(())
}

/// Reap a zombie child. `pid` of 0 means any child. With no zombie yet the
/// caller is put to sleep on `WT_CHILD` and the trap return path retries.
pub fn do_wait(k: &mut Kernel, pid: u32, code_store: usize) -> KernelResult<Pid> {
    let parent = k.pm.current;
    let want = if pid == 0 { None } else { Some(Pid(pid)) };

    match k.pm.find_zombie_child(parent, want)? {
        Some(zombie) => {
            let exit_code = k.pm.table.get(zombie).unwrap().exit_code;
            if code_store != 0 {
                let space = k.pm.table.get(parent).unwrap().space.clone();
                if let Some(space) = space {
                    let mut guard = space.lock();
                    k.mm.user_write(&mut guard, code_store, &exit_code.to_le_bytes())?;
                }
            }
            k.pm.remove_links(zombie);
            let corpse = k.pm.table.remove(zombie).expect("zombie in table");
            if corpse.is_thread {
                let parent_proc = k.pm.table.get_mut(parent).unwrap();
                parent_proc.thread_slots[corpse.stack_slot] = 0;
            }
            if let Some(kstack) = corpse.kstack {
                k.mm.free_pages(kstack, KSTACK_PAGES);
            }
            k.pm.pids.free(zombie);
            debug!("wait: {} reaped {}", parent, zombie);
            Ok(zombie)
        }
        None => {
            let proc = k.pm.current_mut();
            if proc.flags.contains(ProcFlags::EXITING) {
                return Err(ProcError::Killed.into());
            }
            proc.state = ProcState::Sleeping;
            proc.wait_state = WaitState::CHILD;
            k.pm.schedule();
            Err(ProcError::WouldBlock.into())
        }
    }
}

/// Mark the current task as willing to give up the CPU; the switch happens
/// on the way back to user mode.
pub fn do_yield(k: &mut Kernel) {
    k.pm.current_mut().need_resched = true;
}

/// Deliver an exit hint; an interruptible sleeper is woken to observe it.
pub fn do_kill(k: &mut Kernel, pid: Pid) -> KernelResult<()> {
    let proc = k
        .pm
        .table
        .get_mut(pid)
        .ok_or(ProcError::NotFound { pid: pid.0 })?;
    proc.flags.insert(ProcFlags::EXITING);
    let interruptible =
        proc.state == ProcState::Sleeping && proc.wait_state.contains(WaitState::INTERRUPTED);
    if interruptible {
        k.pm.wakeup(pid);
    }
    Ok(())
}

/// Kill a main thread and every thread in its slot array (or the whole
/// group of the thread named by `pid`).
pub fn do_kill_all_thread(k: &mut Kernel, pid: Pid) -> KernelResult<()> {
    let main = {
        let proc = k
            .pm
            .table
            .get(pid)
            .ok_or(ProcError::NotFound { pid: pid.0 })?;
        if proc.is_thread {
            proc.parent.expect("thread has a parent")
        } else {
            pid
        }
    };
    let slots = k
        .pm
        .table
        .get(main)
        .ok_or(ProcError::NotFound { pid: main.0 })?
        .thread_slots;
    for &occupant in slots.iter().skip(1) {
        if occupant != 0 {
            let _ = do_kill(k, Pid(occupant));
        }
    }
    do_kill(k, main)
}

/// Sleep for `time` ticks (0 is a no-op). Wakeup comes from the tick
/// handler, or early from kill.
pub fn do_sleep(k: &mut Kernel, time: u64) -> KernelResult<()> {
    if time == 0 {
        return Ok(());
    }
    let pid = k.pm.current;
    k.pm.add_timer(pid, time);
    let proc = k.pm.current_mut();
    proc.state = ProcState::Sleeping;
    proc.wait_state = WaitState::TIMER;
    k.pm.schedule();
    Ok(())
}

/// Set both scheduler priorities; valid range `1..=19`.
pub fn do_nice(k: &mut Kernel, pid: Pid, prior: u32) -> KernelResult<()> {
    if !(1..=19).contains(&prior) {
        return Err(ProcError::InvalidPriority { prior }.into());
    }
    let proc = k
        .pm
        .table
        .get_mut(pid)
        .ok_or(ProcError::NotFound { pid: pid.0 })?;
    proc.cfs_prior = prior;
    proc.stride_prior = prior;
    Ok(())
}

/// Move the heap break to `new_end` (0 queries). Returns the resulting end.
pub fn do_brk(k: &mut Kernel, new_end: usize) -> KernelResult<usize> {
    let space = k
        .pm
        .current_proc()
        .space
        .clone()
        .ok_or(crate::error::KernelError::InvalidArgument)?;
    let mut guard = space.lock();
    if new_end == 0 {
        return Ok(guard.heap_end);
    }
    let end = page_round_up(new_end);
    if end < guard.heap_start {
        return Err(MemError::InvalidAddress { addr: new_end }.into());
    }
    let old_end = guard.heap_end;
    if end > old_end {
        guard.brk(&mut k.mm.phys, old_end, end - old_end)?;
    } else if end < old_end {
        guard.unmap(&mut k.mm.phys, end, old_end - end)?;
    }
    guard.heap_end = end;
    Ok(end)
}

/// One row of the process snapshot handed to `top` via `get_pdb`.
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    pub pid: u32,
    pub state: ProcState,
    pub runs: u32,
    pub parent: u32,
    pub name: String,
    pub wait_state: u32,
    pub prior: u32,
    pub is_thread: bool,
    pub total_pages: u32,
    pub free_pages: u32,
}

/// Snapshot the whole task table in creation order.
pub fn process_snapshot(k: &Kernel) -> Vec<ProcSnapshot> {
    let total = k.mm.phys.total_frames() as u32;
    let free = k.mm.phys.nr_free() as u32;
    k.pm
        .table
        .pids()
        .into_iter()
        .filter_map(|pid| k.pm.table.get(pid))
        .map(|p| ProcSnapshot {
            pid: p.pid.0,
            state: p.state,
            runs: p.runs,
            parent: p.parent.map(|q| q.0).unwrap_or(0),
            name: p.name.clone(),
            wait_state: p.wait_state.bits(),
            prior: p.cfs_prior,
            is_thread: p.is_thread,
            total_pages: total,
            free_pages: free,
        })
        .collect()
}
