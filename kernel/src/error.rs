//! Kernel error types and the numeric status codes shuttled to user mode.
//!
//! Core routines return `Result` with a subsystem error; the syscall layer
//! converts the error into a negative status via [`KernelError::errno`].
//! Invariant violations (free-list corruption, refcount underflow, bad
//! on-disk metadata) are not represented here: they panic.

use core::fmt;

/// Numeric error codes as seen by user mode (returned negated in register A).
pub mod codes {
    pub const E_UNSPECIFIED: i32 = 1;
    pub const E_BAD_PROC: i32 = 2;
    pub const E_INVAL: i32 = 3;
    pub const E_NO_MEM: i32 = 4;
    pub const E_NO_FREE_PROC: i32 = 5;
    pub const E_FAULT: i32 = 6;
    pub const E_SWAP_FAULT: i32 = 7;
    pub const E_INVAL_ELF: i32 = 8;
    pub const E_KILLED: i32 = 9;
    pub const E_PANIC: i32 = 10;
    pub const E_AGAIN: i32 = 11;
    pub const E_NO_DEV: i32 = 16;
    pub const E_NA_DEV: i32 = 17;
    pub const E_BUSY: i32 = 18;
    pub const E_NOENT: i32 = 19;
    pub const E_ISDIR: i32 = 20;
    pub const E_NOTDIR: i32 = 21;
    pub const E_XDEV: i32 = 22;
    pub const E_UNIMP: i32 = 23;
    pub const E_SEEK: i32 = 24;
    pub const E_MAX_OPEN: i32 = 25;
    pub const E_EXISTS: i32 = 26;
    pub const E_NOTEMPTY: i32 = 27;
    pub const E_TOO_BIG: i32 = 29;
}

/// Memory-subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Not enough free frames (or kernel heap) to satisfy the request.
    OutOfMemory,
    /// Address or range failed a user-region or alignment check.
    InvalidAddress { addr: usize },
    /// Fault could not be resolved against the faulting address space.
    BadFault { addr: usize },
    /// Swap slot missing or backing-device transfer failed.
    SwapFault,
    /// Swap requested but no replacement engine is configured.
    SwapDisabled,
}

/// Process-subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Process table or pid space exhausted.
    NoFreeProcess,
    /// No process with that pid.
    NotFound { pid: u32 },
    /// Caller has no child matching the wait request.
    NoChild,
    /// All 16 thread stack slots are occupied.
    NoThreadSlot,
    /// The caller must sleep; the trap return path retries after wakeup.
    WouldBlock,
    /// Priority outside the accepted `1..=19` range.
    InvalidPriority { prior: u32 },
    /// Sleeping call interrupted by kill.
    Killed,
}

/// Filesystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No such file or directory entry.
    NotFound,
    /// Entry already exists (create-excl, link, mkdir).
    Exists,
    /// Path component is not a directory.
    NotADirectory,
    /// Directory where a regular file was required.
    IsADirectory,
    /// Refusing to unlink `"."` or `".."`.
    NotEmpty,
    /// Inode still referenced at reclaim time.
    Busy,
    /// No free blocks left on the device.
    NoSpace,
    /// Offset/length outside the representable file range.
    InvalidOffset,
    /// File would exceed the 12 + 1024 block limit.
    FileTooLarge,
    /// Descriptor not open or out of range.
    BadFileDescriptor,
    /// Per-process open-file table is full.
    TooManyOpenFiles,
    /// Malformed path or over-long name.
    InvalidPath,
    /// Block-device transfer failed.
    Io,
}

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    Mem(MemError),
    Proc(ProcError),
    Fs(FsError),
    /// Argument failed validation in the syscall layer.
    InvalidArgument,
    /// Syscall present in the vector but intentionally not implemented.
    NotImplemented,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Positive status code for this error; the syscall layer returns its
    /// negation in register A.
    pub fn errno(&self) -> i32 {
        use codes::*;
        match self {
            Self::Mem(e) => match e {
                MemError::OutOfMemory => E_NO_MEM,
                MemError::InvalidAddress { .. } => E_INVAL,
                MemError::BadFault { .. } => E_FAULT,
                MemError::SwapFault => E_SWAP_FAULT,
                MemError::SwapDisabled => E_NA_DEV,
            },
            Self::Proc(e) => match e {
                ProcError::NoFreeProcess => E_NO_FREE_PROC,
                ProcError::NotFound { .. } => E_BAD_PROC,
                ProcError::NoChild => E_BAD_PROC,
                ProcError::NoThreadSlot => E_NO_MEM,
                ProcError::WouldBlock => E_AGAIN,
                ProcError::InvalidPriority { .. } => E_INVAL,
                ProcError::Killed => E_KILLED,
            },
            Self::Fs(e) => match e {
                FsError::NotFound => E_NOENT,
                FsError::Exists => E_EXISTS,
                FsError::NotADirectory => E_NOTDIR,
                FsError::IsADirectory => E_ISDIR,
                FsError::NotEmpty => E_NOTEMPTY,
                FsError::Busy => E_BUSY,
                FsError::NoSpace => E_NO_MEM,
                FsError::InvalidOffset => E_SEEK,
                FsError::FileTooLarge => E_TOO_BIG,
                FsError::BadFileDescriptor => E_INVAL,
                FsError::TooManyOpenFiles => E_MAX_OPEN,
                FsError::InvalidPath => E_INVAL,
                FsError::Io => E_UNSPECIFIED,
            },
            Self::InvalidArgument => E_INVAL,
            Self::NotImplemented => E_UNIMP,
        }
    }
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidAddress { addr } => write!(f, "invalid address {:#x}", addr),
            Self::BadFault { addr } => write!(f, "unresolvable fault at {:#x}", addr),
            Self::SwapFault => write!(f, "swap transfer failed"),
            Self::SwapDisabled => write!(f, "swapping not enabled"),
        }
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreeProcess => write!(f, "process table full"),
            Self::NotFound { pid } => write!(f, "no process {}", pid),
            Self::NoChild => write!(f, "no matching child"),
            Self::NoThreadSlot => write!(f, "thread stack slots exhausted"),
            Self::WouldBlock => write!(f, "caller must sleep"),
            Self::InvalidPriority { prior } => write!(f, "priority {} out of range", prior),
            Self::Killed => write!(f, "killed"),
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no such entry"),
            Self::Exists => write!(f, "entry exists"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::IsADirectory => write!(f, "is a directory"),
            Self::NotEmpty => write!(f, "refusing to unlink . or .."),
            Self::Busy => write!(f, "inode busy"),
            Self::NoSpace => write!(f, "no free blocks"),
            Self::InvalidOffset => write!(f, "bad offset"),
            Self::FileTooLarge => write!(f, "file too large"),
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::TooManyOpenFiles => write!(f, "too many open files"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::Io => write!(f, "i/o error"),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mem(e) => write!(f, "memory error: {}", e),
            Self::Proc(e) => write!(f, "process error: {}", e),
            Self::Fs(e) => write!(f, "filesystem error: {}", e),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl From<MemError> for KernelError {
    fn from(err: MemError) -> Self {
        Self::Mem(err)
    }
}

impl From<ProcError> for KernelError {
    fn from(err: ProcError) -> Self {
        Self::Proc(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}
