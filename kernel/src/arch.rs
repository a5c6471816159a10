//! Thin architecture shims for the uniprocessor model.
//!
//! Boot, descriptor tables, and interrupt controllers live outside this
//! crate. The two things the core needs from the machine are TLB entry
//! invalidation after a mapping change and short interrupt-masked critical
//! sections, and both degrade to no-ops on hosted builds.

/// Invalidate the TLB entry covering `addr` on the running CPU.
#[inline]
pub fn tlb_flush_page(addr: usize) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: invlpg only drops a TLB entry; it cannot fault or corrupt state.
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) addr, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = addr;
}

/// Guard that masks local interrupts for the duration of a critical section.
///
/// The kernel is uniprocessor: masking the timer is all the serialization a
/// short section needs. Nesting is supported by restoring the saved state.
pub struct IntrGuard {
    was_enabled: bool,
}

impl IntrGuard {
    pub fn new() -> Self {
        Self {
            was_enabled: disable_local_irq(),
        }
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable_local_irq();
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn disable_local_irq() -> bool {
    let flags: u32;
    // SAFETY: pushfd/pop reads EFLAGS; cli masks interrupts. Both are
    // whole-CPU state changes with no memory effects.
    unsafe {
        core::arch::asm!("pushfd; pop {0}; cli", out(reg) flags, options(nomem));
    }
    flags & (1 << 9) != 0
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn enable_local_irq() {
    // SAFETY: sti only sets the interrupt flag.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn disable_local_irq() -> bool {
    false
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn enable_local_irq() {}
