//! Console Sink
//!
//! Byte-stream output for the kernel logger and panic path. The platform
//! registers a sink (UART, framebuffer, test capture); until then output is
//! discarded.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

static SINK: AtomicUsize = AtomicUsize::new(0);

/// Register the console sink. Later registrations replace earlier ones, so
/// boot code can upgrade from an early UART to a real driver.
pub fn set_sink(sink: fn(&str)) {
    SINK.store(sink as usize, Ordering::Release);
}

/// Write a string to the console, if any sink is registered.
pub fn puts(s: &str) {
    let f = SINK.load(Ordering::Acquire);
    if f != 0 {
        // SAFETY: the value was stored from a `fn(&str)` in `set_sink`.
        let f: fn(&str) = unsafe { core::mem::transmute(f) };
        f(s);
    }
}

/// `core::fmt` adapter over the console sink.
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}
