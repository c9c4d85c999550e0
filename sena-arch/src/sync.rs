//! Synchronization primitives
//!
//! Provides [`IrqSpinMutex`], a spinlock that disables interrupts while held,
//! [`SpinLock`], a plain spinlock for data that is never touched from
//! interrupt context, and [`IrqGuard`], a bare RAII interrupt mask for
//! critical sections that protect per-CPU state rather than shared data.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::{disable_interrupts, restore_interrupts};

/// RAII interrupt mask.
///
/// Masks interrupts on construction and restores the previous state on drop.
/// Used on paths that mutate per-CPU structures owned by the current CPU,
/// where mutual exclusion against other CPUs is provided by ownership and
/// only interrupt re-entrancy has to be excluded.
pub struct IrqGuard {
    rflags: u64,
    // Restoring the mask on another CPU would corrupt both CPUs' state.
    _not_send: core::marker::PhantomData<*const ()>,
}

impl IrqGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rflags: disable_interrupts(),
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        restore_interrupts(self.rflags);
    }
}

/// A spinlock that disables interrupts while held.
///
/// This prevents the deadlock where a lock holder is interrupted on its own
/// CPU and the interrupt handler spins on the same lock. Interrupts are
/// masked before the acquire attempt and restored when the guard drops.
///
/// # Invariants
///
/// - The lock must not be held across a context switch or anything that may
///   sleep; critical sections are short.
/// - Nested acquisition of different `IrqSpinMutex`es is permitted when the
///   nesting order is globally consistent.
pub struct IrqSpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only reachable through the guard, which requires
// holding the lock.
unsafe impl<T: Send> Sync for IrqSpinMutex<T> {}
unsafe impl<T: Send> Send for IrqSpinMutex<T> {}

impl<T> IrqSpinMutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts for the guard's lifetime.
    #[must_use]
    pub fn lock(&self) -> IrqSpinMutexGuard<'_, T> {
        // Mask interrupts before spinning so an interrupt handler on this
        // CPU cannot preempt us mid-acquire and deadlock on the same lock.
        let rflags = disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqSpinMutexGuard {
            mutex: self,
            rflags,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Interrupts stay masked only if the lock was acquired.
    #[must_use]
    pub fn try_lock(&self) -> Option<IrqSpinMutexGuard<'_, T>> {
        let rflags = disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinMutexGuard {
                mutex: self,
                rflags,
                _not_send: core::marker::PhantomData,
            })
        } else {
            restore_interrupts(rflags);
            None
        }
    }

    /// Get a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for IrqSpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for IrqSpinMutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("IrqSpinMutex").field("data", &*guard).finish(),
            None => f.debug_struct("IrqSpinMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Guard providing access to [`IrqSpinMutex`] data.
///
/// `!Send`: migrating the guard would restore the interrupt mask on the
/// wrong CPU.
pub struct IrqSpinMutexGuard<'a, T> {
    mutex: &'a IrqSpinMutex<T>,
    rflags: u64,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqSpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqSpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release before restoring the mask so an interrupt taken right
        // after cannot observe the lock still held.
        self.mutex.locked.store(false, Ordering::Release);
        restore_interrupts(self.rflags);
    }
}

/// A plain spinlock.
///
/// No interrupt masking: only for data that interrupt handlers never touch.
/// A holder interrupted on its own CPU would deadlock any handler spinning
/// on the same lock, which is what [`IrqSpinMutex`] exists to prevent.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only reachable through the guard, which requires
// holding the lock.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is free.
    #[must_use]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinLockGuard { mutex: self }
    }

    /// Try to acquire the lock without spinning.
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { mutex: self })
        } else {
            None
        }
    }

    /// Get a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the lock and return the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &*guard).finish(),
            None => f.debug_struct("SpinLock").field("data", &"<locked>").finish(),
        }
    }
}

/// Guard providing access to [`SpinLock`] data.
pub struct SpinLockGuard<'a, T> {
    mutex: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let m = IrqSpinMutex::new(7u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 8);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = IrqSpinMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn spinlock_roundtrip_and_contention() {
        let m = SpinLock::new(3u32);
        {
            let mut g = m.lock();
            *g *= 2;
            assert!(m.try_lock().is_none());
        }
        assert_eq!(*m.lock(), 6);
        assert_eq!(m.into_inner(), 6);
    }
}
