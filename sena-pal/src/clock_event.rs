//! One-Shot Clock Event Device
//!
//! Contract between the scheduler's timer machinery and the platform's
//! per-CPU one-shot timer hardware. The platform registers a device; the
//! scheduler registers a dispatch callback and programs deadlines with
//! [`set`]. The platform's interrupt glue calls [`dispatch`] when the device
//! fires on a CPU.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use crate::clock::Duration;

/// A per-CPU one-shot timer device.
///
/// `set` programs the device on the calling CPU to fire once after `after`.
/// Programming supersedes any previously programmed deadline on that CPU.
pub trait ClockEvent: Sync {
    fn set(&self, after: Duration);
}

static DEVICE: Once<&'static dyn ClockEvent> = Once::new();

/// Dispatch callback, stored as a raw fn pointer so firing is lock-free.
static CALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Register the platform's clock event device. First registration wins.
pub fn register_device(dev: &'static dyn ClockEvent) {
    DEVICE.call_once(|| dev);
}

/// Register the function invoked on the firing CPU when the device expires.
pub fn set_callback(f: fn()) {
    CALLBACK.store(f as usize, Ordering::Release);
}

/// Program the calling CPU's device to fire after `after`.
///
/// A no-op until a device is registered; the scheduler falls back to polling
/// at its other entry points, which keeps timers functional (if coarse)
/// without hardware.
pub fn set(after: Duration) {
    if let Some(dev) = DEVICE.get() {
        dev.set(after);
    }
}

/// Invoked by the platform's interrupt glue on the CPU whose device fired.
pub fn dispatch() {
    let f = CALLBACK.load(Ordering::Acquire);
    if f != 0 {
        // SAFETY: the value was stored from a `fn()` in `set_callback`.
        let f: fn() = unsafe { core::mem::transmute(f) };
        f();
    }
}
