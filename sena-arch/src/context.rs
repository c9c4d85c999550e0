//! Context switching
//!
//! The callee-saved register trampoline that swaps stacks between two
//! threads, plus initial stack frame construction for threads that have
//! never run.
//!
//! A suspended thread is represented by nothing more than its saved stack
//! pointer: the trampoline pushes the six callee-saved registers, stores
//! `rsp` through the outgoing thread's slot, loads the incoming thread's
//! saved `rsp` and pops. A fresh thread's stack is seeded with a fabricated
//! frame whose return address is a shim that pops the entry function and its
//! argument and jumps, with interrupts enabled.

/// Saved execution state of a thread that is not running.
///
/// Only the stack pointer is stored; everything else lives in the frame at
/// the top of the thread's stack.
#[derive(Debug)]
#[repr(C)]
pub struct Context {
    pub sp: usize,
}

impl Context {
    #[must_use]
    pub const fn new() -> Self {
        Self { sp: 0 }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point signature for a fresh thread.
pub type Entry = extern "C" fn(usize) -> !;

/// The fabricated frame a fresh thread's stack starts with, in ascending
/// address order as consumed by the trampoline and start shim.
#[repr(C)]
struct StartFrame {
    r15: usize,
    r14: usize,
    r13: usize,
    r12: usize,
    rbx: usize,
    rbp: usize,
    ret_addr: usize,
    entry: usize,
    arg: usize,
}

/// Seed `stack_top` with a frame that makes the thread enter `entry(arg)`
/// on its first dispatch. Returns the initial saved stack pointer.
///
/// # Safety
///
/// `stack_top` must be the exclusive, writable top of a stack at least
/// `size_of::<StartFrame>() + 16` bytes deep.
pub unsafe fn init_stack(stack_top: *mut u8, entry: Entry, arg: usize) -> usize {
    let top = (stack_top as usize) & !15;
    // One padding word above the frame keeps rsp ≡ 8 (mod 16) at the jump
    // into `entry`, matching the alignment after an ordinary call.
    let frame = (top - 8 - core::mem::size_of::<StartFrame>()) as *mut StartFrame;
    // SAFETY: per the caller contract, the frame lies inside the stack.
    unsafe {
        frame.write(StartFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            ret_addr: start_shim_addr(),
            entry: entry as usize,
            arg,
        });
    }
    frame as usize
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    /// Swap stacks: save callee-saved state and `rsp` through
    /// `current_sp`, then resume the context whose saved `rsp` is
    /// `next_sp`.
    ///
    /// # Safety
    ///
    /// Must be called with interrupts disabled. `current_sp` must point to
    /// the outgoing thread's context slot and `next_sp` must be a value
    /// previously produced by this function or by
    /// [`init_stack`](super::init_stack).
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch(_current_sp: *mut usize, _next_sp: usize) {
        core::arch::naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    }

    /// First instructions of a fresh thread: fetch the entry function and
    /// its argument from the seeded frame, enable interrupts, jump.
    #[unsafe(naked)]
    unsafe extern "C" fn start_shim() -> ! {
        core::arch::naked_asm!("pop rax", "pop rdi", "sti", "jmp rax");
    }

    pub(super) fn start_shim_addr() -> usize {
        start_shim as usize
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    /// Hosted builds cannot swap kernel stacks; the scheduler's dispatch
    /// path is exercised on bare metal only.
    ///
    /// # Safety
    ///
    /// Never returns normally on hosted targets.
    pub unsafe extern "C" fn switch(_current_sp: *mut usize, _next_sp: usize) {
        unreachable!("stack switching is only available on bare metal");
    }

    extern "C" fn start_stub(_arg: usize) -> ! {
        unreachable!("fresh threads only start on bare metal");
    }

    pub(super) fn start_shim_addr() -> usize {
        start_stub as usize
    }
}

use imp::start_shim_addr;
pub use imp::switch;
