//! # sena-kernel
//!
//! A multi-CPU kernel thread scheduler with a staged load-balancing
//! extension. Each logical CPU owns a scheduler instance: a FIFO runqueue,
//! a timer list driven by a one-shot clock event, per-source incoming-wakeup
//! queues, and an inbox for threads migrating between *stages* — named work
//! classes that compete for CPUs in proportion to their observed backlog.
//!
//! Threads are cooperative within a CPU (switches happen at interrupt or
//! explicit `schedule` points) and fully parallel across CPUs. Cross-CPU
//! wakeups never take a scheduler-wide lock: a waker CASes the target's
//! status cell, posts it to a per-source FIFO on the destination CPU and
//! announces it through a bitmask the destination polls.
//!
//! Architecture specifics (interrupt masking, context switching) come from
//! [`sena_arch`]; the clock and the clock-event device contract come from
//! [`sena_pal`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod logging;
pub mod sched;
