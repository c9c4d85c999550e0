//! Kernel Mutex
//!
//! A sleeping mutex with direct handoff: `unlock` transfers ownership to
//! the longest waiter before waking it, so a woken thread never contends.
//! The same handoff mechanism lets a wait queue send the mutex straight to
//! a thread it is waking (wait morphing) via
//! [`send_lock_unless_already_waiting`](Mutex::send_lock_unless_already_waiting).
//!
//! The mutex carries no data; callers guard their state by convention, as
//! the registries and the reaper do.

use alloc::collections::VecDeque;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use sena_arch::IrqSpinMutex;

use super::thread::{self, Thread};
use super::wait::{wait_until, WaitRecord, WrPtr};

pub struct Mutex {
    owner: AtomicPtr<Thread>,
    waiters: IrqSpinMutex<VecDeque<WrPtr>>,
}

impl Mutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: AtomicPtr::new(ptr::null_mut()),
            waiters: IrqSpinMutex::new(VecDeque::new()),
        }
    }

    fn try_acquire(&self, me: *mut Thread) -> bool {
        self.owner
            .compare_exchange(
                ptr::null_mut(),
                me,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Acquire, sleeping if contended. Not recursive.
    pub fn lock(&self) {
        let me = thread::current().as_ptr();
        if self.try_acquire(me) {
            return;
        }
        debug_assert!(
            self.owner.load(Ordering::Relaxed) != me,
            "recursive mutex acquisition"
        );

        let wr = WaitRecord::for_current();
        {
            let mut w = self.waiters.lock();
            // Retry under the queue lock; an unlock that raced with the
            // fast path cannot slip between the check and the push.
            if self.try_acquire(me) {
                return;
            }
            w.push_back(WrPtr(&wr));
        }
        wait_until(|| wr.woken());
        // Ownership arrived by handoff.
        debug_assert!(self.owned_by_current());
    }

    /// Acquire without sleeping.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let me = thread::current().as_ptr();
        self.try_acquire(me)
    }

    /// Release; ownership moves to the longest waiter, if any.
    pub fn unlock(&self) {
        debug_assert!(self.owned_by_current());
        let mut w = self.waiters.lock();
        match w.pop_front() {
            Some(WrPtr(wr)) => {
                // SAFETY: queued records stay alive until woken.
                let t = unsafe { (*wr).thread_ptr() };
                self.owner.store(t, Ordering::Release);
                drop(w);
                // SAFETY: as above.
                unsafe { (*wr).wake() };
            }
            None => {
                self.owner.store(ptr::null_mut(), Ordering::Release);
            }
        }
    }

    /// Queue `wr` as if its thread had blocked in [`lock`](Self::lock): the
    /// next unlock hands it the mutex and wakes it. Returns false (and
    /// queues nothing) when the record was already woken.
    ///
    /// Caller must hold the mutex.
    pub(crate) fn send_lock_unless_already_waiting(&self, wr: *const WaitRecord) -> bool {
        debug_assert!(self.owned_by_current());
        let mut w = self.waiters.lock();
        // SAFETY: the record is on its waiter's stack and the waiter is
        // suspended in a lock-handoff state.
        if unsafe { (*wr).woken() } {
            return false;
        }
        w.push_back(WrPtr(wr));
        true
    }

    #[must_use]
    pub fn owned_by_current(&self) -> bool {
        thread::try_current()
            .map(|t| self.owner.load(Ordering::Relaxed) == t.as_ptr())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.owner.load(Ordering::Relaxed).is_null()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
