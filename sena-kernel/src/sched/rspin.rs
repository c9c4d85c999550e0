//! Recursive Spinlock
//!
//! The timer paths re-enter their own locks: expiring a timer wakes a
//! thread, and the wake path may suspend that thread's remaining timers,
//! which takes the same client and CPU timer locks again. A recursive
//! owner-tagged spinlock makes those flows single-acquisition per owner.
//!
//! The lock does not carry its data. Guarded structures live in
//! `UnsafeCell`s next to it, and holders take short borrows that never span
//! a nested acquisition.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use super::thread;

/// Owner tag: `(cpu + 1) << 32 | thread_id`, nonzero by construction.
fn current_holder() -> u64 {
    let cpu = sena_arch::cpu_id() as u64 + 1;
    let tid = thread::try_current()
        .map(|t| t.t().id())
        .unwrap_or(u32::MAX) as u64;
    (cpu << 32) | tid
}

pub(crate) struct RSpinLock {
    holder: AtomicU64,
    count: UnsafeCell<u32>,
}

// SAFETY: `count` is only touched while `holder` equals the caller's tag,
// which a single owner establishes with a CAS.
unsafe impl Sync for RSpinLock {}
unsafe impl Send for RSpinLock {}

impl RSpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            holder: AtomicU64::new(0),
            count: UnsafeCell::new(0),
        }
    }

    pub(crate) fn lock(&self) {
        super::preempt_disable();
        let caller = current_holder();
        if self.holder.load(Ordering::Acquire) != caller {
            loop {
                match self
                    .holder
                    .compare_exchange(0, caller, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(_) => {
                        while self.holder.load(Ordering::Relaxed) != 0 {
                            core::hint::spin_loop();
                        }
                    }
                }
            }
        }
        // SAFETY: we are the holder.
        unsafe { *self.count.get() += 1 };
    }

    pub(crate) fn unlock(&self) {
        debug_assert_eq!(self.holder.load(Ordering::Relaxed), current_holder());
        // SAFETY: we are the holder.
        let count = unsafe {
            let c = self.count.get();
            *c -= 1;
            *c
        };
        if count == 0 {
            self.holder.store(0, Ordering::Release);
        }
        super::preempt_enable();
    }
}
