//! Kernel Logging
//!
//! `log`-facade implementation: messages go to a lock-free ring buffer and,
//! while the early console is enabled, to the registered console sink.

pub mod buffer;
pub mod logger;

pub use logger::init;
