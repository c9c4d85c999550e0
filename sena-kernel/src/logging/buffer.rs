//! Kernel Log Ring Buffer
//!
//! Fixed-size, lock-free storage for log messages so consumers can drain
//! diagnostics after the fact. Overflow drops the newest message.

use core::sync::atomic::{AtomicBool, Ordering};

use thingbuf::StaticThingBuf;

/// Maximum size of a single entry's content (target + message).
pub const LOG_ENTRY_CONTENT_SIZE: usize = 240;

/// Number of entry slots in the buffer.
pub const LOG_BUFFER_SLOTS: usize = 256;

/// A single log entry with fixed-size storage.
#[derive(Clone)]
pub struct LogEntry {
    /// Timestamp in microseconds since boot.
    pub timestamp_us: u64,
    /// Log level (0=Error .. 4=Trace).
    pub level: u8,
    /// Length of the target string.
    pub target_len: u8,
    /// Length of the message.
    pub message_len: u16,
    /// Combined content: `[target bytes][message bytes]`.
    pub content: [u8; LOG_ENTRY_CONTENT_SIZE],
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            timestamp_us: 0,
            level: 0,
            target_len: 0,
            message_len: 0,
            content: [0u8; LOG_ENTRY_CONTENT_SIZE],
        }
    }
}

impl LogEntry {
    pub fn new(timestamp_us: u64, level: log::Level, target: &str, message: &str) -> Self {
        let mut entry = Self {
            timestamp_us,
            ..Self::default()
        };
        entry.level = level_to_u8(level);

        let target_bytes = target.as_bytes();
        let target_len = target_bytes.len().min(255).min(LOG_ENTRY_CONTENT_SIZE);
        entry.content[..target_len].copy_from_slice(&target_bytes[..target_len]);
        entry.target_len = target_len as u8;

        let message_bytes = message.as_bytes();
        let remaining = LOG_ENTRY_CONTENT_SIZE - target_len;
        let message_len = message_bytes.len().min(remaining);
        entry.content[target_len..target_len + message_len]
            .copy_from_slice(&message_bytes[..message_len]);
        entry.message_len = message_len as u16;

        entry
    }

    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        core::str::from_utf8(&self.content[..len]).unwrap_or("<invalid>")
    }

    pub fn message(&self) -> &str {
        let start = self.target_len as usize;
        let len = self.message_len as usize;
        core::str::from_utf8(&self.content[start..start + len]).unwrap_or("<invalid>")
    }
}

fn level_to_u8(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 0,
        log::Level::Warn => 1,
        log::Level::Info => 2,
        log::Level::Debug => 3,
        log::Level::Trace => 4,
    }
}

/// Convert a stored level back to a `log::Level`.
pub fn u8_to_level(val: u8) -> log::Level {
    match val {
        0 => log::Level::Error,
        1 => log::Level::Warn,
        2 => log::Level::Info,
        3 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

static LOG_BUFFER: StaticThingBuf<LogEntry, LOG_BUFFER_SLOTS> = StaticThingBuf::new();

static EARLY_CONSOLE_ENABLED: AtomicBool = AtomicBool::new(true);
static BUFFER_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable the log buffer.
pub fn enable() {
    BUFFER_ENABLED.store(true, Ordering::Release);
}

/// Disable early console mirroring (a real console consumer took over).
pub fn disable_early_console() {
    EARLY_CONSOLE_ENABLED.store(false, Ordering::Release);
}

pub fn early_console_enabled() -> bool {
    EARLY_CONSOLE_ENABLED.load(Ordering::Acquire)
}

/// Push an entry. Lock-free and interrupt-safe; returns false when the
/// buffer is full or disabled.
pub fn push(entry: LogEntry) -> bool {
    if !BUFFER_ENABLED.load(Ordering::Acquire) {
        return false;
    }
    LOG_BUFFER.push(entry).is_ok()
}

/// Pop the oldest entry, if any.
pub fn pop() -> Option<LogEntry> {
    LOG_BUFFER.pop()
}

/// Number of buffered entries.
pub fn len() -> usize {
    LOG_BUFFER.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let e = LogEntry::new(123, log::Level::Info, "sched", "hello world");
        assert_eq!(e.timestamp_us, 123);
        assert_eq!(e.target(), "sched");
        assert_eq!(e.message(), "hello world");
        assert_eq!(u8_to_level(e.level), log::Level::Info);
    }

    #[test]
    fn entry_truncates_long_message() {
        let long = ["x"; 400].concat();
        let e = LogEntry::new(0, log::Level::Debug, "t", &long);
        assert_eq!(e.message().len(), LOG_ENTRY_CONTENT_SIZE - 1);
    }
}
