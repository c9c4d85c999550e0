//! # sena-pal
//!
//! Platform abstraction layer for the sena scheduler: the monotonic uptime
//! clock, the one-shot clock-event device contract, and a pluggable console
//! sink for the kernel logger.
//!
//! The platform (boot code, device drivers) lives outside this workspace and
//! plugs in through the registration entry points here.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod clock_event;
pub mod console;

pub use clock::{Duration, Instant};
