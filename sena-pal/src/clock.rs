//! Monotonic Uptime Clock
//!
//! Nanosecond-resolution monotonic time since boot, built on a raw counter
//! plus a frequency calibrated at init. On bare metal the counter is the
//! TSC; hosted builds read a counter that the embedder advances explicitly,
//! which keeps everything layered on the clock deterministic.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counter ticks per second. Set once during platform init.
static COUNTER_FREQ: AtomicU64 = AtomicU64::new(0);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
fn read_counter() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtsc reads the timestamp counter and nothing else.
    unsafe {
        core::arch::asm!(
            "lfence",
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack)
        );
    }
    ((hi as u64) << 32) | lo as u64
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
static HOSTED_COUNTER: AtomicU64 = AtomicU64::new(0);

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
fn read_counter() -> u64 {
    HOSTED_COUNTER.load(Ordering::SeqCst)
}

/// Advance the hosted counter by `ticks`. Bare metal has no equivalent; the
/// TSC advances on its own.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn advance_ticks(ticks: u64) {
    HOSTED_COUNTER.fetch_add(ticks, Ordering::SeqCst);
}

/// Calibrate the clock: `freq` counter ticks per second.
pub fn init(freq: u64) {
    COUNTER_FREQ.store(freq, Ordering::Relaxed);
}

/// Counter frequency in Hz, zero before [`init`].
#[must_use]
pub fn frequency() -> u64 {
    COUNTER_FREQ.load(Ordering::Relaxed)
}

/// Nanoseconds since boot.
///
/// Split division avoids overflowing the `ticks * 1e9` product for long
/// uptimes.
#[must_use]
pub fn now_ns() -> u64 {
    let count = read_counter();
    let freq = COUNTER_FREQ.load(Ordering::Relaxed);
    if freq == 0 {
        return count;
    }
    let secs = count / freq;
    let frac = count % freq;
    secs * 1_000_000_000 + (frac * 1_000_000_000) / freq
}

/// A span of time, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const ZERO: Self = Self { nanos: 0 };

    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self { nanos: micros * 1_000 }
    }

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self { nanos: millis * 1_000_000 }
    }

    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self { nanos: secs * 1_000_000_000 }
    }

    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    #[must_use]
    pub const fn as_micros(&self) -> u64 {
        self.nanos / 1_000
    }

    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.nanos == 0
    }
}

/// A point on the uptime timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    #[must_use]
    pub fn now() -> Self {
        Self { nanos: now_ns() }
    }

    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// `self - earlier`, or `None` when `earlier` is in the future (the
    /// caller decides how to treat a stuck or backward-stepping clock).
    #[must_use]
    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.nanos
            .checked_sub(earlier.nanos)
            .map(Duration::from_nanos)
    }

    #[must_use]
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, d: Duration) -> Instant {
        Instant {
            nanos: self.nanos.saturating_add(d.as_nanos()),
        }
    }
}

impl core::ops::Sub for Instant {
    type Output = Duration;

    fn sub(self, other: Instant) -> Duration {
        self.saturating_duration_since(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversions() {
        assert_eq!(Duration::from_millis(20).as_nanos(), 20_000_000);
        assert_eq!(Duration::from_secs(3).as_millis(), 3_000);
        assert_eq!(Duration::from_micros(5).as_nanos(), 5_000);
    }

    #[test]
    fn instant_arithmetic() {
        let a = Instant::from_nanos(1_000);
        let b = a + Duration::from_nanos(500);
        assert_eq!((b - a).as_nanos(), 500);
        assert_eq!(a.checked_duration_since(b), None);
        assert_eq!(b.checked_duration_since(a), Some(Duration::from_nanos(500)));
        assert_eq!((a - b), Duration::ZERO);
    }
}
