//! Numbered syscall dispatch.
//!
//! Register A carries the number in and the result out; D, C, B, DI, SI
//! carry up to five arguments. Pointer arguments are user virtual addresses
//! and go through the user-copy helpers. An undefined number is fatal to
//! the kernel, mirroring the trap the original vector takes.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{codes, KernelError, KernelResult, ProcError};
use crate::fs::file::{self, FilesStruct};
use crate::kernel::Kernel;
use crate::mm::{page_table, AddressSpace};
use crate::process::lifecycle::{self, ProcSnapshot};
use crate::process::pcb::{Pid, TrapFrame};
use crate::process::{ProcFlags, Semaphore};

pub const SYS_EXIT: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_EXEC: usize = 4;
pub const SYS_CLONE: usize = 5;
pub const SYS_YIELD: usize = 10;
pub const SYS_SLEEP: usize = 11;
pub const SYS_KILL: usize = 12;
pub const SYS_GETTIME: usize = 17;
pub const SYS_GETPID: usize = 18;
pub const SYS_BRK: usize = 19;
pub const SYS_SHMEM: usize = 20;
pub const SYS_PUTC: usize = 30;
pub const SYS_PGDIR: usize = 31;
pub const SYS_SEM: usize = 40;
pub const SYS_NICE: usize = 41;
pub const SYS_GET_PDB: usize = 42;
pub const SYS_OPEN: usize = 100;
pub const SYS_CLOSE: usize = 101;
pub const SYS_READ: usize = 102;
pub const SYS_WRITE: usize = 103;
pub const SYS_SEEK: usize = 104;
pub const SYS_FSTAT: usize = 110;
pub const SYS_FSYNC: usize = 111;
pub const SYS_CHDIR: usize = 120;
pub const SYS_GETCWD: usize = 121;
pub const SYS_MKDIR: usize = 122;
pub const SYS_LINK: usize = 123;
pub const SYS_RENAME: usize = 124;
pub const SYS_UNLINK: usize = 125;
pub const SYS_GETDIRENTRY: usize = 128;
pub const SYS_DUP: usize = 130;

/// Longest path or argv string copied in from user space.
const MAX_STR: usize = 1024;
/// Largest single read/write shuttled through a kernel buffer.
const MAX_IO: usize = 1 << 16;

/// Trap entry: decode the current task's trap frame, run the service, and
/// store the result back in the caller's register A. The preemption and
/// exit checks of the return-to-user path run here too.
pub fn dispatch(k: &mut Kernel) -> isize {
    let caller = k.pm.current;
    let (num, args) = {
        let tf = &k.pm.current_proc().tf;
        (
            tf.eax as usize,
            [
                tf.edx as usize,
                tf.ecx as usize,
                tf.ebx as usize,
                tf.edi as usize,
                tf.esi as usize,
            ],
        )
    };
    let ret = do_syscall(k, num, args);
    if let Some(proc) = k.pm.table.get_mut(caller) {
        proc.tf.eax = ret as u32;
    }

    // Return-to-user checks for the task that is now current.
    let exiting = k
        .pm
        .table
        .get(k.pm.current)
        .map(|p| p.flags.contains(ProcFlags::EXITING) && k.pm.current != k.pm.idle)
        .unwrap_or(false);
    if exiting {
        let _ = lifecycle::do_exit(k, -codes::E_KILLED);
    }
    if k.pm
        .table
        .get(k.pm.current)
        .map(|p| p.need_resched)
        .unwrap_or(false)
    {
        k.pm.schedule();
    }
    ret
}

/// Service a numbered call with explicit arguments.
pub fn do_syscall(k: &mut Kernel, num: usize, args: [usize; 5]) -> isize {
    match syscall_inner(k, num, args) {
        Ok(v) => v,
        Err(e) => -(e.errno() as isize),
    }
}

fn syscall_inner(k: &mut Kernel, num: usize, args: [usize; 5]) -> KernelResult<isize> {
    match num {
        SYS_EXIT => sys_exit(k, args[0] as i32),
        SYS_FORK => sys_fork(k),
        SYS_WAIT => sys_wait(k, args[0], args[1]),
        SYS_EXEC => sys_exec(k, args[0], args[1], args[2]),
        SYS_CLONE => sys_clone(k, args[0], args[1], args[2], args[3]),
        SYS_YIELD => {
            lifecycle::do_yield(k);
            Ok(0)
        }
        SYS_SLEEP => lifecycle::do_sleep(k, args[0] as u64).map(|_| 0),
        SYS_KILL => lifecycle::do_kill_all_thread(k, Pid(args[0] as u32)).map(|_| 0),
        SYS_GETTIME => Ok(k.pm.ticks as isize),
        SYS_GETPID => Ok(k.pm.current.0 as isize),
        SYS_BRK => sys_brk(k, args[0]),
        SYS_SHMEM => Err(KernelError::NotImplemented),
        SYS_PUTC => {
            k.console.push(args[0] as u8);
            Ok(0)
        }
        SYS_PGDIR => sys_pgdir(k),
        SYS_SEM => sys_sem(k, args[0], args[1], args[2]),
        SYS_NICE => lifecycle::do_nice(k, Pid(args[0] as u32), args[1] as u32).map(|_| 0),
        SYS_GET_PDB => sys_get_pdb(k, args[0]),
        SYS_OPEN => sys_open(k, args[0], args[1] as u32),
        SYS_CLOSE => with_files(k, |files, fs| {
            file::file_close(files, fs, args[0]).map(|_| 0)
        }),
        SYS_READ => sys_read(k, args[0], args[1], args[2]),
        SYS_WRITE => sys_write(k, args[0], args[1], args[2]),
        SYS_SEEK => with_files(k, |files, fs| {
            file::file_seek(files, fs, args[0], args[1] as i32, args[2] as u32)
                .map(|pos| pos as isize)
        }),
        SYS_FSTAT => sys_fstat(k, args[0], args[1]),
        SYS_FSYNC => with_files(k, |files, fs| {
            file::file_fsync(files, fs, args[0]).map(|_| 0)
        }),
        SYS_CHDIR => {
            let path = read_user_str(k, args[0])?;
            with_files(k, |files, fs| file::chdir(files, fs, &path).map(|_| 0))
        }
        SYS_GETCWD => sys_getcwd(k, args[0], args[1]),
        SYS_MKDIR => {
            let path = read_user_str(k, args[0])?;
            with_files(k, |files, fs| file::path_mkdir(files, fs, &path).map(|_| 0))
        }
        SYS_LINK => {
            let old = read_user_str(k, args[0])?;
            let new = read_user_str(k, args[1])?;
            with_files(k, |files, fs| {
                file::path_link(files, fs, &old, &new).map(|_| 0)
            })
        }
        SYS_RENAME => {
            let old = read_user_str(k, args[0])?;
            let new = read_user_str(k, args[1])?;
            with_files(k, |files, fs| {
                file::path_rename(files, fs, &old, &new).map(|_| 0)
            })
        }
        SYS_UNLINK => {
            let path = read_user_str(k, args[0])?;
            with_files(k, |files, fs| {
                file::path_unlink(files, fs, &path).map(|_| 0)
            })
        }
        SYS_GETDIRENTRY => sys_getdirentry(k, args[0], args[1]),
        SYS_DUP => with_files(k, |files, fs| {
            file::file_dup(files, fs, args[0], args[1]).map(|fd| fd as isize)
        }),
        _ => panic!(
            "undefined syscall {}, pid = {}, name = {}",
            num,
            k.pm.current,
            k.pm.current_proc().name
        ),
    }
}

// ---- user-memory helpers ---------------------------------------------

fn current_space(k: &Kernel) -> KernelResult<Arc<Mutex<AddressSpace>>> {
    k.pm
        .current_proc()
        .space
        .clone()
        .ok_or(KernelError::InvalidArgument)
}

fn read_user_str(k: &mut Kernel, addr: usize) -> KernelResult<String> {
    let space = current_space(k)?;
    let mut guard = space.lock();
    Ok(k.mm.user_read_cstr(&mut guard, addr, MAX_STR)?)
}

fn read_user_bytes(k: &mut Kernel, addr: usize, len: usize) -> KernelResult<Vec<u8>> {
    let space = current_space(k)?;
    let mut guard = space.lock();
    let mut buf = vec![0u8; len];
    k.mm.user_read(&mut guard, addr, &mut buf)?;
    Ok(buf)
}

fn write_user_bytes(k: &mut Kernel, addr: usize, data: &[u8]) -> KernelResult<()> {
    let space = current_space(k)?;
    let mut guard = space.lock();
    Ok(k.mm.user_write(&mut guard, addr, data)?)
}

fn read_user_u32(k: &mut Kernel, addr: usize) -> KernelResult<u32> {
    let b = read_user_bytes(k, addr, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Run `op` with the caller's file table and the mounted filesystem.
fn with_files(
    k: &mut Kernel,
    op: impl FnOnce(
        &mut FilesStruct,
        &mut dyn crate::fs::Filesystem,
    ) -> Result<isize, crate::error::FsError>,
) -> KernelResult<isize> {
    with_files_raw(k, op)
}

// ---- process services ------------------------------------------------

fn sys_exit(k: &mut Kernel, code: i32) -> KernelResult<isize> {
    // A main thread reaps its thread children before it may exit.
    if k.pm.current_proc().is_ancestral_thread() {
        while k.pm.current_has_child() {
            match lifecycle::do_wait(k, 0, 0) {
                Ok(_) => continue,
                Err(KernelError::Proc(ProcError::WouldBlock)) => {
                    return Err(ProcError::WouldBlock.into())
                }
                Err(_) => break,
            }
        }
    }
    lifecycle::do_exit(k, code)?;
    Ok(0)
}

fn sys_fork(k: &mut Kernel) -> KernelResult<isize> {
    let tf = k.pm.current_proc().tf;
    let stack = tf.esp;
    let pid = lifecycle::do_fork(k, 0, stack, tf)?;
    Ok(pid.0 as isize)
}

fn sys_wait(k: &mut Kernel, pid: usize, code_store: usize) -> KernelResult<isize> {
    let pid = pid as i32;
    let want = if pid <= 0 { 0 } else { pid as u32 };
    let reaped = lifecycle::do_wait(k, want, code_store)?;
    Ok(reaped.0 as isize)
}

fn sys_exec(k: &mut Kernel, name_ptr: usize, argc: usize, argv_ptr: usize) -> KernelResult<isize> {
    let name = read_user_str(k, name_ptr)?;
    if argc > 32 {
        return Err(KernelError::InvalidArgument);
    }
    let mut argv = Vec::with_capacity(argc);
    for i in 0..argc {
        let slot = read_user_u32(k, argv_ptr + i * 4)? as usize;
        argv.push(read_user_str(k, slot)?);
    }
    lifecycle::do_execve(k, &name, &argv)?;
    Ok(0)
}

fn sys_clone(
    k: &mut Kernel,
    tid_store: usize,
    func: usize,
    arg: usize,
    exit_fn: usize,
) -> KernelResult<isize> {
    let pid = lifecycle::do_clone(k, func as u32, arg as u32, exit_fn as u32)?;
    write_user_bytes(k, tid_store, &pid.0.to_le_bytes())?;
    Ok(0)
}

fn sys_brk(k: &mut Kernel, brk_store: usize) -> KernelResult<isize> {
    let requested = read_user_u32(k, brk_store)? as usize;
    let end = lifecycle::do_brk(k, requested)?;
    write_user_bytes(k, brk_store, &(end as u32).to_le_bytes())?;
    Ok(0)
}

fn sys_pgdir(k: &mut Kernel) -> KernelResult<isize> {
    let space = current_space(k)?;
    let guard = space.lock();
    let text = page_table::dump(&k.mm.phys, guard.pgdir);
    log::info!("{}", text);
    Ok(0)
}

/// Semaphore multiplexer: 0 init, 1 up, 2 down, 3 getvalue. The semaphore
/// is keyed by its user-space address.
fn sys_sem(k: &mut Kernel, sem_addr: usize, value_ptr: usize, kind: usize) -> KernelResult<isize> {
    match kind {
        0 => {
            let init = read_user_u32(k, value_ptr)? as i32;
            if init < 0 {
                return Err(KernelError::InvalidArgument);
            }
            k.user_sems.insert(sem_addr, Semaphore::new(init));
            Ok(0)
        }
        1 => {
            let sem = k
                .user_sems
                .get_mut(&sem_addr)
                .ok_or(KernelError::InvalidArgument)?;
            sem.up(&mut k.pm);
            Ok(0)
        }
        2 => {
            let sem = k
                .user_sems
                .get_mut(&sem_addr)
                .ok_or(KernelError::InvalidArgument)?;
            let _ = sem.down(&mut k.pm);
            Ok(0)
        }
        3 => {
            let value = k
                .user_sems
                .get(&sem_addr)
                .ok_or(KernelError::InvalidArgument)?
                .value();
            write_user_bytes(k, value_ptr, &value.to_le_bytes())?;
            Ok(0)
        }
        _ => Err(KernelError::InvalidArgument),
    }
}

/// Bytes per serialized snapshot row.
pub const PDB_RECORD_BYTES: usize = 80;

fn encode_snapshot(row: &ProcSnapshot) -> [u8; PDB_RECORD_BYTES] {
    let mut b = [0u8; PDB_RECORD_BYTES];
    b[0..4].copy_from_slice(&row.pid.to_le_bytes());
    b[4..8].copy_from_slice(&(row.state as u32).to_le_bytes());
    b[8..12].copy_from_slice(&row.runs.to_le_bytes());
    b[12..16].copy_from_slice(&row.parent.to_le_bytes());
    b[16..20].copy_from_slice(&row.wait_state.to_le_bytes());
    b[20..24].copy_from_slice(&row.prior.to_le_bytes());
    b[24..28].copy_from_slice(&(row.is_thread as u32).to_le_bytes());
    b[28..32].copy_from_slice(&row.total_pages.to_le_bytes());
    b[32..36].copy_from_slice(&row.free_pages.to_le_bytes());
    let name = row.name.as_bytes();
    let n = name.len().min(PDB_RECORD_BYTES - 36 - 1);
    b[36..36 + n].copy_from_slice(&name[..n]);
    b
}

fn sys_get_pdb(k: &mut Kernel, base: usize) -> KernelResult<isize> {
    let rows = lifecycle::process_snapshot(k);
    let mut addr = base;
    for row in &rows {
        write_user_bytes(k, addr, &encode_snapshot(row))?;
        addr += PDB_RECORD_BYTES;
    }
    Ok(rows.len() as isize)
}

// ---- filesystem services ---------------------------------------------

fn sys_open(k: &mut Kernel, path_ptr: usize, flags: u32) -> KernelResult<isize> {
    let path = read_user_str(k, path_ptr)?;
    with_files(k, |files, fs| {
        file::file_open(files, fs, &path, flags).map(|fd| fd as isize)
    })
}

fn sys_read(k: &mut Kernel, fd: usize, base: usize, len: usize) -> KernelResult<isize> {
    let len = len.min(MAX_IO);
    let mut buf = vec![0u8; len];
    let got = with_files(k, |files, fs| {
        file::file_read(files, fs, fd, &mut buf).map(|n| n as isize)
    })?;
    write_user_bytes(k, base, &buf[..got as usize])?;
    Ok(got)
}

fn sys_write(k: &mut Kernel, fd: usize, base: usize, len: usize) -> KernelResult<isize> {
    let len = len.min(MAX_IO);
    let buf = read_user_bytes(k, base, len)?;
    with_files(k, |files, fs| {
        file::file_write(files, fs, fd, &buf).map(|n| n as isize)
    })
}

fn sys_fstat(k: &mut Kernel, fd: usize, stat_ptr: usize) -> KernelResult<isize> {
    let stat = with_files_raw(k, |files, fs| file::file_fstat(files, fs, fd))?;
    let mut b = [0u8; 16];
    b[0..4].copy_from_slice(&(stat.mode as u32).to_le_bytes());
    b[4..8].copy_from_slice(&(stat.nlinks as u32).to_le_bytes());
    b[8..12].copy_from_slice(&stat.blocks.to_le_bytes());
    b[12..16].copy_from_slice(&stat.size.to_le_bytes());
    write_user_bytes(k, stat_ptr, &b)?;
    Ok(0)
}

fn sys_getcwd(k: &mut Kernel, buf_ptr: usize, len: usize) -> KernelResult<isize> {
    let path = with_files_raw(k, |files, fs| file::getcwd(files, fs))?;
    if path.len() + 1 > len {
        return Err(KernelError::InvalidArgument);
    }
    write_user_bytes(k, buf_ptr, path.as_bytes())?;
    write_user_bytes(k, buf_ptr + path.len(), &[0u8])?;
    Ok(path.len() as isize)
}

fn sys_getdirentry(k: &mut Kernel, fd: usize, dirent_ptr: usize) -> KernelResult<isize> {
    let name = with_files_raw(k, |files, fs| file::file_getdirentry(files, fs, fd))?;
    write_user_bytes(k, dirent_ptr, name.as_bytes())?;
    write_user_bytes(k, dirent_ptr + name.len(), &[0u8])?;
    Ok(0)
}

/// Like `with_files` but for non-integer results.
fn with_files_raw<R>(
    k: &mut Kernel,
    op: impl FnOnce(&mut FilesStruct, &mut dyn crate::fs::Filesystem) -> Result<R, crate::error::FsError>,
) -> KernelResult<R> {
    let files = k
        .pm
        .current_proc()
        .files
        .clone()
        .ok_or(KernelError::InvalidArgument)?;
    let fs = k
        .fs
        .as_mut()
        .ok_or(KernelError::Fs(crate::error::FsError::NotFound))?;
    let mut guard = files.lock();
    op(&mut guard, fs.as_mut()).map_err(Into::into)
}

/// Build a trap frame that invokes `num` with `args` when dispatched.
pub fn trap_frame_for(num: usize, args: [usize; 5]) -> TrapFrame {
    TrapFrame {
        eax: num as u32,
        edx: args[0] as u32,
        ecx: args[1] as u32,
        ebx: args[2] as u32,
        edi: args[3] as u32,
        esi: args[4] as u32,
        ..TrapFrame::default()
    }
}
