//! CPU Control and Identification
//!
//! Low-level CPU operations: interrupt mask save/restore, CPU numbering,
//! halt and the monitor/mwait pair used by the idle loop.
//!
//! All functions keep the same signature on hosted targets, where the
//! privileged instructions are replaced by software shims (a process cannot
//! execute `cli` or `mwait`). The shims preserve the save/restore contract so
//! lock and guard types behave identically.

use core::sync::atomic::{AtomicUsize, Ordering};

/// RFLAGS interrupt-enable bit.
pub const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use core::arch::asm;

    use super::RFLAGS_IF;

    /// Disable interrupts, returning the previous RFLAGS value.
    #[must_use]
    #[inline]
    pub fn disable_interrupts() -> u64 {
        let rflags: u64;
        // SAFETY: reading RFLAGS and masking interrupts is safe in ring 0.
        unsafe {
            asm!("pushfq", "pop {}", "cli", out(reg) rflags, options(nomem));
        }
        rflags
    }

    /// Restore the interrupt-enable state saved by [`disable_interrupts`].
    #[inline]
    pub fn restore_interrupts(rflags: u64) {
        if rflags & RFLAGS_IF != 0 {
            enable_interrupts();
        }
    }

    /// Enable interrupts.
    #[inline]
    pub fn enable_interrupts() {
        // SAFETY: unmasking interrupts is safe in ring 0.
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }

    /// Check whether interrupts are currently enabled.
    #[must_use]
    #[inline]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        // SAFETY: reading RFLAGS has no side effects.
        unsafe {
            asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags & RFLAGS_IF != 0
    }

    /// Halt until the next interrupt.
    #[inline]
    pub fn wait_for_interrupt() {
        // SAFETY: hlt is safe in ring 0; it resumes on the next interrupt.
        unsafe {
            asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }

    /// Arm the address monitor on `addr`.
    #[inline]
    pub fn monitor(addr: *const u8) {
        // SAFETY: monitor only arms the address range monitor.
        unsafe {
            asm!(
                "monitor",
                in("rax") addr,
                in("ecx") 0u32,
                in("edx") 0u32,
                options(nostack, preserves_flags)
            );
        }
    }

    /// Wait for a write to the monitored address (or an interrupt).
    #[inline]
    pub fn mwait() {
        // SAFETY: mwait merely idles the core until the monitor fires.
        unsafe {
            asm!(
                "mwait",
                in("eax") 0u32,
                in("ecx") 0u32,
                options(nostack, preserves_flags)
            );
        }
    }

    /// Initial APIC id of the calling CPU, from CPUID leaf 1.
    #[must_use]
    pub fn apic_id() -> u32 {
        let ebx: u32;
        // SAFETY: cpuid leaf 1 is available on every x86_64 CPU. rbx is
        // reserved by LLVM, so it is swapped through a scratch register.
        unsafe {
            asm!(
                "mov {tmp:r}, rbx",
                "cpuid",
                "xchg {tmp:r}, rbx",
                tmp = out(reg) ebx,
                inlateout("eax") 1u32 => _,
                lateout("ecx") _,
                lateout("edx") _,
                options(nomem, preserves_flags)
            );
        }
        ebx >> 24
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    //! Hosted shims: interrupt state is a software flag, idle primitives
    //! degrade to spin hints, and the CPU number is whatever the embedder
    //! registered. Semantics (save/restore pairing, nesting) are preserved.

    use core::sync::atomic::{AtomicU64, Ordering};

    use super::RFLAGS_IF;

    static SOFT_RFLAGS: AtomicU64 = AtomicU64::new(RFLAGS_IF);

    #[must_use]
    #[inline]
    pub fn disable_interrupts() -> u64 {
        SOFT_RFLAGS.swap(0, Ordering::SeqCst)
    }

    #[inline]
    pub fn restore_interrupts(rflags: u64) {
        SOFT_RFLAGS.store(rflags & RFLAGS_IF, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable_interrupts() {
        SOFT_RFLAGS.store(RFLAGS_IF, Ordering::SeqCst);
    }

    #[must_use]
    #[inline]
    pub fn interrupts_enabled() -> bool {
        SOFT_RFLAGS.load(Ordering::SeqCst) & RFLAGS_IF != 0
    }

    #[inline]
    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    #[inline]
    pub fn monitor(_addr: *const u8) {}

    #[inline]
    pub fn mwait() {
        core::hint::spin_loop();
    }

    #[must_use]
    pub fn apic_id() -> u32 {
        super::HOSTED_CPU.load(Ordering::Relaxed) as u32
    }
}

pub use imp::{
    apic_id, disable_interrupts, enable_interrupts, interrupts_enabled, monitor, mwait,
    restore_interrupts, wait_for_interrupt,
};

/// Logical CPU number used by hosted builds, settable via [`set_cpu_id`].
static HOSTED_CPU: AtomicUsize = AtomicUsize::new(0);

/// Largest APIC id the translation table supports.
pub const MAX_APIC_ID: usize = 256;

/// APIC id to logical CPU index translation, filled during bring-up.
/// Identity-mapped by default, which matches QEMU-style consecutive ids.
static CPU_INDEX: [AtomicUsize; MAX_APIC_ID] = {
    const SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);
    [SLOT; MAX_APIC_ID]
};

/// Register the logical index of the CPU with the given APIC id.
///
/// Called once per CPU during bring-up, before that CPU enters the scheduler.
pub fn register_cpu(apic: u32, index: usize) {
    CPU_INDEX[apic as usize % MAX_APIC_ID].store(index, Ordering::Release);
}

/// Logical index of the calling CPU.
///
/// Falls back to the raw APIC id when bring-up has not registered a mapping.
#[must_use]
#[inline]
pub fn cpu_id() -> usize {
    let apic = apic_id() as usize % MAX_APIC_ID;
    let idx = CPU_INDEX[apic].load(Ordering::Acquire);
    if idx == usize::MAX { apic } else { idx }
}

/// Pin the hosted shim's notion of the current CPU. No effect on bare metal,
/// where the CPU number always derives from the APIC id.
pub fn set_cpu_id(index: usize) {
    HOSTED_CPU.store(index, Ordering::Relaxed);
}

/// Spin-wait hint.
#[inline]
pub fn relax() {
    core::hint::spin_loop();
}

/// Halt the CPU forever.
#[inline]
pub fn halt() -> ! {
    loop {
        wait_for_interrupt();
    }
}

/// Flush the local TLB.
///
/// The MMU proper lives outside this crate; dispatch only needs the flush
/// entry point for the lazy-flush handshake.
#[inline]
pub fn flush_tlb_local() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: rewriting CR3 with its own value flushes non-global TLB
    // entries and has no other effect.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}
