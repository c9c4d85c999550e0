//! Predicate Waits and Wait Queues
//!
//! The wait protocol: `prepare_wait` parks the thread's status at
//! `WaitingRun` with preemption disabled, the waiter re-checks its
//! predicate, and `schedule` completes the suspension. `stop_wait` reverses
//! the process and rides out any wake handshake that is mid-flight.
//!
//! [`WaitQueue`] is a condition-variable-shaped list of [`WaitRecord`]s.
//! Its `wake_one` hands a mutex directly to the woken thread (wait
//! morphing), skipping the redundant wake-then-contend cycle.

use alloc::collections::VecDeque;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use sena_arch::IrqSpinMutex;

use super::mutex::Mutex;
use super::status::WAKE_LOCK_MASK;
use super::thread::{self, Thread};

/// One thread's registration on a wait queue.
///
/// Lives on the waiter's stack; queue members hold it by pointer until it
/// is woken, and the waiter does not return while it is still queued.
pub struct WaitRecord {
    t: AtomicPtr<Thread>,
}

impl WaitRecord {
    /// A record for the calling thread.
    #[must_use]
    pub fn for_current() -> Self {
        Self {
            t: AtomicPtr::new(thread::current().as_ptr()),
        }
    }

    /// Woken (or cleared) records hold no thread.
    #[must_use]
    pub fn woken(&self) -> bool {
        self.t.load(Ordering::Acquire).is_null()
    }

    /// Mark woken without waking; used when the waker found the thread
    /// already on its way out.
    pub(crate) fn clear(&self) {
        self.t.store(ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn thread_ptr(&self) -> *mut Thread {
        self.t.load(Ordering::Acquire)
    }

    /// Wake the recorded thread, if it has not been woken already.
    pub fn wake(&self) {
        let t = self.t.swap(ptr::null_mut(), Ordering::AcqRel);
        if !t.is_null() {
            // SAFETY: a thread with a live wait record is suspended, hence
            // alive; reclamation happens only after it runs again.
            let t = unsafe { &*t };
            thread::wake_impl(t.detached(), WAKE_LOCK_MASK);
        }
    }

    /// Block until woken, releasing `mtx` while asleep.
    ///
    /// Called with `mtx` held; returns with `mtx` held. If the waker handed
    /// the mutex over directly, the re-acquisition is skipped.
    pub fn wait(&self, mtx: &Mutex) {
        let t = thread::current();
        loop {
            t.t().prepare_wait();
            if self.woken() {
                t.t().stop_wait();
                return;
            }
            mtx.unlock();
            thread::wait();
            t.t().stop_wait();
            if t.t().detached().take_lock_sent() {
                // The mutex was morphed to us; we own it already.
                debug_assert!(self.woken());
            } else {
                mtx.lock();
            }
        }
    }
}

/// Pointer wrapper so records can sit in a queue.
#[derive(Clone, Copy)]
pub(crate) struct WrPtr(pub *const WaitRecord);

// SAFETY: wait records are pinned on their waiter's stack for the whole
// time they are queued.
unsafe impl Send for WrPtr {}

/// A FIFO of waiting threads guarded by the user's [`Mutex`].
pub struct WaitQueue {
    waiters: IrqSpinMutex<VecDeque<WrPtr>>,
}

impl WaitQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: IrqSpinMutex::new(VecDeque::new()),
        }
    }

    /// Sleep until a waker releases us. `mtx` must be held; it is dropped
    /// while asleep and held again on return.
    pub fn wait(&self, mtx: &Mutex) {
        debug_assert!(mtx.owned_by_current());
        let wr = WaitRecord::for_current();
        self.waiters.lock().push_back(WrPtr(&wr));
        wr.wait(mtx);
    }

    /// Wake the longest waiter, morphing `mtx` (which must be held) over to
    /// it when possible.
    pub fn wake_one(&self, mtx: &Mutex) {
        debug_assert!(mtx.owned_by_current());
        let head = self.waiters.lock().pop_front();
        if let Some(WrPtr(wr)) = head {
            // SAFETY: queued records stay alive until woken.
            let t = unsafe { (*wr).thread_ptr() };
            if !t.is_null() {
                // SAFETY: the record still holds its waiter, so the thread
                // is suspended and alive.
                unsafe { thread::wake_lock(&*t, mtx, wr) };
            }
        }
    }

    /// Wake every waiter. The first gets the mutex morphed over; the rest
    /// contend normally.
    pub fn wake_all(&self, mtx: &Mutex) {
        debug_assert!(mtx.owned_by_current());
        let mut drained = {
            let mut w = self.waiters.lock();
            core::mem::take(&mut *w)
        };
        let mut first = true;
        for WrPtr(wr) in drained.drain(..) {
            // SAFETY: queued records stay alive until woken.
            let t = unsafe { (*wr).thread_ptr() };
            if t.is_null() {
                continue;
            }
            if first {
                first = false;
                // SAFETY: as in wake_one.
                unsafe { thread::wake_lock(&*t, mtx, wr) };
            } else {
                // SAFETY: as in wake_one.
                unsafe { (*wr).wake() };
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Park the calling thread until `pred` holds.
///
/// The predicate is evaluated after the status is parked at `WaitingRun`,
/// so a waker that flips the condition and then wakes can never be missed.
pub fn wait_until(mut pred: impl FnMut() -> bool) {
    let t = thread::current();
    loop {
        t.t().prepare_wait();
        if pred() {
            t.t().stop_wait();
            return;
        }
        thread::wait();
        t.t().stop_wait();
    }
}
