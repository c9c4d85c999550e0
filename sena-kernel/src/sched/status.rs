//! Thread Status Cell
//!
//! A thread's lifecycle state lives in one atomic word shared between the
//! thread, its CPU and remote wakers. Every transition is a CAS on an
//! expected value; there is no lock anywhere in the state machine.
//!
//! The `*Run`/`*Sto` pairs encode whether the thread is still on its CPU:
//! a sleeping thread is `WaitingRun` until the CPU finishes switching away
//! from it, at which point the dispatcher downgrades it to `WaitingSto`.
//! Wakers that catch the `*Run` flavour hand over to the downgrade by
//! failing their CAS and retrying the `*Sto` edge.

use core::sync::atomic::{AtomicU32, Ordering};

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Created before the scheduler was up; started during bring-up.
    Prestarted = 0,
    /// Constructed but not yet started.
    Unstarted,
    /// Sleeping, still on its CPU (switch-out pending).
    WaitingRun,
    /// Sleeping, off-CPU.
    WaitingSto,
    /// A waker claimed the thread while it was `WaitingRun`.
    WakingRun,
    /// A waker claimed the thread while it was `WaitingSto`.
    WakingSto,
    /// A mutex is being handed to the thread; it was `WaitingRun`.
    SendingLockRun,
    /// A mutex is being handed to the thread; it was `WaitingSto`.
    SendingLockSto,
    /// Migrating to a stage CPU, source CPU still executing it.
    MigratingRun,
    /// Migrating to a stage CPU, off the source CPU.
    MigratingSto,
    /// On a runqueue awaiting dispatch.
    Queued,
    /// Currently executing.
    Running,
    /// Completed; the next thread on its CPU frees it.
    Terminating,
    /// Completion observable by the joiner.
    Terminated,
}

impl Status {
    /// Bitmask with only this status set, for wake admission masks.
    #[must_use]
    pub const fn mask(self) -> u32 {
        1 << self as u32
    }

    const fn from_u32(v: u32) -> Status {
        match v {
            0 => Status::Prestarted,
            1 => Status::Unstarted,
            2 => Status::WaitingRun,
            3 => Status::WaitingSto,
            4 => Status::WakingRun,
            5 => Status::WakingSto,
            6 => Status::SendingLockRun,
            7 => Status::SendingLockSto,
            8 => Status::MigratingRun,
            9 => Status::MigratingSto,
            10 => Status::Queued,
            11 => Status::Running,
            12 => Status::Terminating,
            _ => Status::Terminated,
        }
    }
}

/// Wake admission mask: the states a plain `wake` may claim.
pub const WAKE_DEFAULT_MASK: u32 = Status::WaitingRun.mask() | Status::WaitingSto.mask();

/// Wake admission mask including the lock-handoff states, used when a mutex
/// owner wakes the thread it handed the lock to.
pub const WAKE_LOCK_MASK: u32 =
    WAKE_DEFAULT_MASK | Status::SendingLockRun.mask() | Status::SendingLockSto.mask();

/// The atomic cell holding a thread's [`Status`].
#[derive(Debug)]
pub struct StatusCell(AtomicU32);

impl StatusCell {
    #[must_use]
    pub const fn new(initial: Status) -> Self {
        Self(AtomicU32::new(initial as u32))
    }

    #[must_use]
    pub fn load(&self, order: Ordering) -> Status {
        Status::from_u32(self.0.load(order))
    }

    pub fn store(&self, status: Status, order: Ordering) {
        self.0.store(status as u32, order);
    }

    /// CAS from `current` to `new`. On failure returns the observed status.
    pub fn compare_exchange(&self, current: Status, new: Status) -> Result<(), Status> {
        self.0
            .compare_exchange(
                current as u32,
                new as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(Status::from_u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn cas_follows_expected_value() {
        let st = StatusCell::new(Status::Unstarted);
        assert!(st.compare_exchange(Status::Unstarted, Status::WaitingSto).is_ok());
        assert_eq!(
            st.compare_exchange(Status::Unstarted, Status::Queued),
            Err(Status::WaitingSto)
        );
        assert_eq!(st.load(SeqCst), Status::WaitingSto);
    }

    #[test]
    fn status_roundtrips_through_the_cell() {
        let all = [
            Status::Prestarted,
            Status::Unstarted,
            Status::WaitingRun,
            Status::WaitingSto,
            Status::WakingRun,
            Status::WakingSto,
            Status::SendingLockRun,
            Status::SendingLockSto,
            Status::MigratingRun,
            Status::MigratingSto,
            Status::Queued,
            Status::Running,
            Status::Terminating,
            Status::Terminated,
        ];
        let cell = StatusCell::new(Status::Prestarted);
        for s in all {
            cell.store(s, SeqCst);
            assert_eq!(cell.load(SeqCst), s);
        }
    }

    #[test]
    fn masks_cover_the_wake_states() {
        assert_ne!(WAKE_DEFAULT_MASK & Status::WaitingRun.mask(), 0);
        assert_ne!(WAKE_DEFAULT_MASK & Status::WaitingSto.mask(), 0);
        assert_eq!(WAKE_DEFAULT_MASK & Status::SendingLockRun.mask(), 0);
        assert_ne!(WAKE_LOCK_MASK & Status::SendingLockSto.mask(), 0);
    }

    /// Concurrent wake: exactly one CAS from `WaitingSto` may win.
    #[test]
    fn concurrent_wake_has_a_single_winner() {
        for _ in 0..64 {
            let st = Arc::new(StatusCell::new(Status::WaitingSto));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let st = Arc::clone(&st);
                    std::thread::spawn(move || {
                        st.compare_exchange(Status::WaitingSto, Status::WakingSto)
                            .is_ok()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(st.load(SeqCst), Status::WakingSto);
        }
    }
}
