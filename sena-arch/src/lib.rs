//! # sena-arch
//!
//! Architecture support for the sena scheduler: interrupt masking and
//! restoration, CPU identification, interrupt-safe spinlocks, the
//! monitor/mwait idle primitive and the context-switch trampoline.
//!
//! The crate targets x86_64 bare metal. Privileged instruction sequences are
//! gated on `target_os = "none"`; hosted builds get inert software shims with
//! the same signatures so the crates layered on top compile and run anywhere.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod cpu;
pub mod sync;

pub use cpu::{cpu_id, disable_interrupts, enable_interrupts, restore_interrupts};
pub use sync::{IrqGuard, IrqSpinMutex, IrqSpinMutexGuard, SpinLock, SpinLockGuard};
