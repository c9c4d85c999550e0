//! Detached-Thread Reaper
//!
//! Detached threads have nobody to join them. Their completion hands them
//! to this background thread, which joins each zombie in turn — observing
//! `Terminated` through the regular completion protocol — and reclaims it.

use alloc::collections::VecDeque;

use sena_arch::IrqSpinMutex;
use spin::Once;

use super::mutex::Mutex;
use super::thread::{self, Thread, ThreadAttr, ThreadPtr};
use super::wait::WaitQueue;

struct Reaper {
    mtx: Mutex,
    cond: WaitQueue,
    zombies: IrqSpinMutex<VecDeque<ThreadPtr>>,
    handle: IrqSpinMutex<Option<thread::JoinHandle>>,
}

impl Reaper {
    fn reap(&self) -> ! {
        loop {
            self.mtx.lock();
            while self.zombies.lock().is_empty() {
                self.cond.wait(&self.mtx);
            }
            self.mtx.unlock();

            loop {
                let z = self.zombies.lock().pop_front();
                match z {
                    Some(ThreadPtr(t)) => thread::join_ptr(t),
                    None => break,
                }
            }
        }
    }
}

static REAPER: Once<Reaper> = Once::new();

/// Create the reaper thread. Called once during scheduler init; the thread
/// itself parks as prestarted until the first CPU enters the scheduler.
pub(crate) fn init() {
    let r = REAPER.call_once(|| Reaper {
        mtx: Mutex::new(),
        cond: WaitQueue::new(),
        zombies: IrqSpinMutex::new(VecDeque::new()),
        handle: IrqSpinMutex::new(None),
    });
    let h = Thread::make(
        || match REAPER.get() {
            Some(r) => r.reap(),
            None => unreachable!("reaper thread before init"),
        },
        ThreadAttr::new().name("reaper"),
    );
    h.start();
    // Parked in the registry forever; the handle is kept so it is never
    // implicitly joined.
    *r.handle.lock() = Some(h);
}

/// Hand a completed detached thread to the reaper.
pub(crate) fn add_zombie(t: *mut Thread) {
    let r = REAPER.get().expect("detached thread completed before reaper init");
    r.zombies.lock().push_back(ThreadPtr(t));
    r.mtx.lock();
    r.cond.wake_one(&r.mtx);
    r.mtx.unlock();
}
