//! Kernel Logger
//!
//! Formats records into a stack buffer (no locks, no allocation), stores
//! them in the ring buffer and mirrors them to the console sink while the
//! early console is enabled.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use sena_pal::console;

use crate::logging::buffer::{self, LogEntry};

/// Stack buffer for formatting a message before it is queued.
struct MessageBuffer {
    data: [u8; buffer::LOG_ENTRY_CONTENT_SIZE],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; buffer::LOG_ENTRY_CONTENT_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = buffer::LOG_ENTRY_CONTENT_SIZE - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let time_us = sena_pal::clock::now_ns() / 1_000;

        let mut msg_buf = MessageBuffer::new();
        let _ = write!(msg_buf, "{}", record.args());

        let entry = LogEntry::new(time_us, record.level(), record.target(), msg_buf.as_str());
        buffer::push(entry);

        if buffer::early_console_enabled() {
            let level_str = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => " WARN",
                Level::Info => " INFO",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };

            let mut console_buf = MessageBuffer::new();
            let _ = writeln!(
                console_buf,
                "[{:>6}.{:06}] {} {}: {}",
                time_us / 1_000_000,
                time_us % 1_000_000,
                level_str,
                record.target(),
                msg_buf.as_str()
            );
            console::puts(console_buf.as_str());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Idempotent: later calls are no-ops.
///
/// The maximum level matches `enabled()`: trace-level records carry the
/// scheduler's hot-path events and must reach the ring buffer.
pub fn init() {
    buffer::enable();
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .ok();
}
