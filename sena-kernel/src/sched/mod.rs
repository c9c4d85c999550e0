//! The Scheduler
//!
//! Per-CPU runqueue scheduling with cross-CPU wakeups and stage-based load
//! balancing. See the crate docs for the overall model.
//!
//! # Bring-up
//!
//! The platform calls [`init`] once with the CPU count, then [`enter`] on
//! every CPU (CPU 0 first), each on its own stack; `enter` adopts the
//! calling context as that CPU's idle thread and never returns. Threads
//! created before `enter(0)` park as prestarted and are started during
//! bring-up.
//!
//! # Preemption
//!
//! Within a CPU, switches happen only at explicit points: [`schedule`],
//! [`yield_now`], the wait protocol, and [`preempt`], which the platform's
//! interrupt-return glue calls to honour [`needs_reschedule`]. The
//! preemption counter travels with the running thread.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use sena_arch::{cpu as arch_cpu, IrqGuard};
use sena_pal::clock::Instant;
use sena_pal::{clock_event, Duration};
use spin::Once;

pub(crate) mod assignment;
pub mod cpu;
pub mod cpu_set;
pub mod mutex;
mod reaper;
mod rspin;
pub mod stage;
pub mod status;
pub mod thread;
pub mod timer;
pub mod wait;

pub use cpu::{set_idle_mwait, Cpu};
pub use cpu_set::CpuSet;
pub use mutex::Mutex;
pub use stage::{Stage, MAX_STAGES};
pub use status::Status;
pub use thread::{
    current_id, exit, find_by_id, num_threads, pin, register_exit_notifier, run_stats, sleep,
    with_all_threads, with_current, with_thread_by_id, JoinHandle, Thread, ThreadAttr,
    ThreadHandle,
};
pub use timer::{Timer, TimerBase, TimerClient};
pub use wait::{wait_until, WaitQueue, WaitRecord};

/// Upper bound on logical CPUs, sized by the wakeup announcement mask.
pub const MAX_CPUS: usize = 64;

static CPUS: Once<Box<[Cpu]>> = Once::new();
static SCHED_UP: AtomicBool = AtomicBool::new(false);

/// Build the per-CPU records and the reaper. Later calls are no-ops.
pub fn init(ncpus: usize) {
    assert!(ncpus >= 1 && ncpus <= MAX_CPUS);
    let mut fresh = false;
    CPUS.call_once(|| {
        fresh = true;
        (0..ncpus).map(Cpu::new).collect()
    });
    if fresh {
        clock_event::set_callback(clock_tick);
        reaper::init();
        log::info!("scheduler initialized with {} CPUs", ncpus);
    }
}

/// All CPU records.
#[must_use]
pub fn cpus() -> &'static [Cpu] {
    CPUS.get().expect("scheduler not initialized")
}

#[must_use]
pub fn cpu_by_id(id: usize) -> &'static Cpu {
    &cpus()[id]
}

pub(crate) fn try_current_cpu() -> Option<&'static Cpu> {
    CPUS.get()?.get(arch_cpu::cpu_id())
}

/// The calling CPU's record.
#[must_use]
pub fn current_cpu() -> &'static Cpu {
    try_current_cpu().expect("unknown CPU; was enter() reached?")
}

pub(crate) fn scheduler_up() -> bool {
    SCHED_UP.load(Ordering::Acquire)
}

/// Adopt the calling context as `cpu_index`'s idle thread and run the
/// scheduler on this CPU forever. CPU 0 must enter first; it starts the
/// prestarted threads.
pub fn enter(cpu_index: usize) -> ! {
    arch_cpu::register_cpu(arch_cpu::apic_id(), cpu_index);
    let cpu = cpu_by_id(cpu_index);

    let mut name = alloc::string::String::from("idle");
    {
        use core::fmt::Write;
        let _ = write!(name, "{}", cpu_index);
    }
    // The idle thread adopts this stack: no entry closure, no owned stack;
    // its context slot is filled by its first switch-out.
    let idle = Thread::make(
        || {},
        ThreadAttr::new()
            .name(&name)
            .pin(cpu_index)
            .stack(core::ptr::null_mut(), 0),
    );
    let t = idle.thread() as *const Thread as *mut Thread;
    idle.thread().detached().set_cpu(cpu_index);
    idle.thread()
        .detached()
        .st
        .store(Status::Running, Ordering::Release);
    cpu.adopt_idle(t);
    // Never joined; the idle thread outlives everything.
    core::mem::forget(idle);

    if cpu_index == 0 {
        SCHED_UP.store(true, Ordering::Release);
    }
    log::info!("cpu {} scheduler online", cpu_index);

    cpu.idle()
}

// -- Preemption

/// RAII preemption disable.
pub(crate) struct PreemptGuard;

impl PreemptGuard {
    pub(crate) fn new() -> Self {
        preempt_disable();
        Self
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        preempt_enable();
    }
}

/// Disable preemption of the calling thread. Nests.
pub fn preempt_disable() {
    if let Some(t) = thread::try_current() {
        t.t().preempt_counter().fetch_add(1, Ordering::Relaxed);
    }
}

/// Re-enable preemption of the calling thread.
pub fn preempt_enable() {
    if let Some(t) = thread::try_current() {
        let prev = t.t().preempt_counter().fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }
}

/// Whether the calling thread may be preempted here.
#[must_use]
pub fn preemptable() -> bool {
    thread::try_current()
        .map(|t| t.t().preempt_counter().load(Ordering::Relaxed) == 0)
        .unwrap_or(false)
}

/// True when a wake targeting this CPU is waiting for a preemption point.
#[must_use]
pub fn needs_reschedule() -> bool {
    current_cpu().needs_reschedule()
}

/// Preemption point for the platform's interrupt-return glue.
pub fn preempt() {
    if preemptable() {
        schedule();
    }
}

// -- Scheduling entry points

/// Run the dispatcher on the calling CPU.
///
/// This is the only way a thread leaves the CPU; it returns when the
/// caller is dispatched again (possibly on a different CPU, after a
/// migration).
pub fn schedule() {
    let _irq = IrqGuard::new();
    current_cpu().reschedule_from_interrupt();
}

/// Give other runnable threads a turn. Returns immediately when the
/// runqueue is empty — the idle thread is not a yield target.
pub fn yield_now() {
    log::trace!("yield");
    let _irq = IrqGuard::new();
    let cpu = current_cpu();
    cpu.handle_incoming_wakeups();
    if cpu.runqueue.is_empty() {
        return;
    }
    debug_assert_eq!(
        thread::current().t().detached().st.load(Ordering::Relaxed),
        Status::Running
    );
    log::trace!("yield switch");
    cpu.reschedule_from_interrupt();
}

/// Clock-event dispatch: expire timers on the firing CPU.
fn clock_tick() {
    if let Some(cpu) = try_current_cpu() {
        timer::fired(cpu);
    }
}

// -- Process-wide CPU time

static LAST_CPUTIME_NS: AtomicU64 = AtomicU64::new(0);

/// Raise `last` to `v` and return the running maximum.
fn monotonize(last: &AtomicU64, v: u64) -> u64 {
    let mut l = last.load(Ordering::Relaxed);
    while v > l {
        match last.compare_exchange_weak(l, v, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return v,
            Err(cur) => l = cur,
        }
    }
    l
}

/// Total CPU time consumed by the process: uptime across all CPUs minus
/// their idle threads' time.
///
/// Idle accounting makes sub-microsecond mistakes when racing the idle
/// thread's transitions, so the result is monotonized across observations.
#[must_use]
pub fn process_cputime() -> Duration {
    let cpus = cpus();
    let mut ns = Instant::now().as_nanos() * cpus.len() as u64;
    for c in cpus {
        if let Some(idle) = c.idle_thread() {
            ns = ns.saturating_sub(idle.t().thread_clock().as_nanos());
        }
    }
    Duration::from_nanos(monotonize(&LAST_CPUTIME_NS, ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonize_never_decreases() {
        let last = AtomicU64::new(0);
        assert_eq!(monotonize(&last, 10), 10);
        assert_eq!(monotonize(&last, 7), 10);
        assert_eq!(monotonize(&last, 12), 12);
        assert_eq!(monotonize(&last, 12), 12);
        assert_eq!(monotonize(&last, 11), 12);
    }
}
