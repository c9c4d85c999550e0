//! Per-CPU Scheduler State
//!
//! Every logical CPU owns one [`Cpu`] record: the FIFO runqueue, the timer
//! list, the per-source incoming-wakeup queues with their announcement
//! mask, the stage-migration inbox and the idle thread. The record never
//! moves and is mutated almost exclusively by its owning CPU; the
//! exceptions (wakeup push, inbox push, announcement mask) are the
//! cross-CPU halves of the wakeup and migration protocols.
//!
//! The idle thread lives outside the runqueue. Dispatch pops the queue head
//! and falls back to idle when the queue is empty, which keeps idle last
//! without a priority concept.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use sena_arch::{context, cpu as arch_cpu, IrqSpinMutex};
use sena_pal::clock::Instant;
use sena_pal::Duration;

use super::cpu_set::AtomicCpuSet;
use super::rspin::RSpinLock;
use super::stage;
use super::status::Status;
use super::thread::{self, Thread, ThreadPtr, ThreadRef};
use super::timer::TimerList;
use super::MAX_CPUS;

/// Minimum interval charged per pass. During startup the clock may be
/// stuck or step backwards; charging zero would let the scheduler loop
/// without making accounting progress.
const CONTEXT_SWITCH_PENALTY: Duration = Duration::from_micros(10);

/// Whether the idle loop may use monitor/mwait on the wakeup mask.
static IDLE_MWAIT: AtomicBool = AtomicBool::new(true);

/// Enable or disable monitor/mwait in the idle loop.
pub fn set_idle_mwait(enabled: bool) {
    IDLE_MWAIT.store(enabled, Ordering::Relaxed);
}

// -- Runqueue

/// Intrusive singly-linked FIFO of `Queued` threads.
///
/// Only the owning CPU links and unlinks (with interrupts masked); remote
/// CPUs read `len` as a load heuristic. The link fields live in the thread
/// objects, so queue operations never allocate.
pub(crate) struct RunQueue {
    head: AtomicPtr<Thread>,
    tail: AtomicPtr<Thread>,
    len: AtomicU32,
}

impl RunQueue {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            len: AtomicU32::new(0),
        }
    }

    /// Owner CPU only.
    fn push_back(&self, t: &Thread) {
        let was_linked = t.rq_linked.swap(true, Ordering::Relaxed);
        debug_assert!(!was_linked);
        let tp = t as *const Thread as *mut Thread;
        t.rq_next.store(ptr::null_mut(), Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.is_null() {
            self.head.store(tp, Ordering::Relaxed);
        } else {
            // SAFETY: queued threads are alive and owned by this CPU.
            unsafe { (*tail).rq_next.store(tp, Ordering::Relaxed) };
        }
        self.tail.store(tp, Ordering::Relaxed);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Owner CPU only.
    fn pop_front(&self) -> Option<ThreadRef> {
        let head = self.head.load(Ordering::Relaxed);
        let head = ThreadRef::from_ptr(head)?;
        let next = head.t().rq_next.load(Ordering::Relaxed);
        self.head.store(next, Ordering::Relaxed);
        if next.is_null() {
            self.tail.store(ptr::null_mut(), Ordering::Relaxed);
        }
        head.t().rq_next.store(ptr::null_mut(), Ordering::Relaxed);
        let was_linked = head.t().rq_linked.swap(false, Ordering::Relaxed);
        debug_assert!(was_linked);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(head)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }
}

// -- Stage-migration inbox

/// Lock-free multi-producer stack of threads migrating to this CPU as part
/// of a stage handoff. The owning CPU drains it with one swap; order does
/// not matter, the runqueue imposes its own.
struct Inbox {
    head: AtomicPtr<Thread>,
}

impl Inbox {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, t: &Thread) {
        let tp = t as *const Thread as *mut Thread;
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            t.inbox_next.store(old, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(old, tp, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }

    fn take_all(&self) -> *mut Thread {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

// -- The CPU record

pub struct Cpu {
    id: usize,
    idle_thread: AtomicPtr<Thread>,
    current: AtomicPtr<Thread>,
    /// Outgoing thread whose `*Run` status the next dispatch downgrades.
    prev: AtomicPtr<Thread>,
    /// Latched corpse: freed by the next thread dispatched here.
    terminating: AtomicPtr<Thread>,
    pub(crate) runqueue: RunQueue,
    timer_lock: RSpinLock,
    timers: UnsafeCell<TimerList>,
    incoming_wakeups: [IrqSpinMutex<VecDeque<ThreadPtr>>; MAX_CPUS],
    incoming_wakeups_mask: AtomicCpuSet,
    inbox: Inbox,
    lazy_flush_tlb: AtomicBool,
    idle_poll: AtomicBool,
    need_reschedule: AtomicBool,
    running_since: AtomicU64,
}

// SAFETY: cross-CPU access is limited to atomics and locked queues; the
// UnsafeCell'd timer list is guarded by `timer_lock`.
unsafe impl Sync for Cpu {}
unsafe impl Send for Cpu {}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            idle_thread: AtomicPtr::new(ptr::null_mut()),
            current: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            terminating: AtomicPtr::new(ptr::null_mut()),
            runqueue: RunQueue::new(),
            timer_lock: RSpinLock::new(),
            timers: UnsafeCell::new(TimerList::new()),
            incoming_wakeups: core::array::from_fn(|_| IrqSpinMutex::new(VecDeque::new())),
            incoming_wakeups_mask: AtomicCpuSet::new(),
            inbox: Inbox::new(),
            lazy_flush_tlb: AtomicBool::new(false),
            idle_poll: AtomicBool::new(false),
            need_reschedule: AtomicBool::new(false),
            running_since: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn current_thread(&self) -> Option<ThreadRef> {
        ThreadRef::from_ptr(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn idle_thread(&self) -> Option<ThreadRef> {
        ThreadRef::from_ptr(self.idle_thread.load(Ordering::Acquire))
    }

    pub(crate) fn adopt_idle(&self, t: *mut Thread) {
        self.idle_thread.store(t, Ordering::Release);
        self.current.store(t, Ordering::Release);
        self.running_since
            .store(Instant::now().as_nanos(), Ordering::Relaxed);
    }

    pub(crate) fn running_since(&self) -> Instant {
        Instant::from_nanos(self.running_since.load(Ordering::Relaxed))
    }

    /// Runqueue length; remote CPUs use it as the load signal for the
    /// stage enqueue policy.
    #[must_use]
    pub fn load(&self) -> usize {
        self.runqueue.len()
    }

    pub(crate) fn timer_lock(&self) -> &RSpinLock {
        &self.timer_lock
    }

    /// Borrow the timer list.
    ///
    /// # Safety
    ///
    /// Caller holds [`timer_lock`](Self::timer_lock), and the borrow must
    /// end before any nested lock acquisition.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn timer_list(&self) -> &mut TimerList {
        // SAFETY: per the caller contract.
        unsafe { &mut *self.timers.get() }
    }

    pub(crate) fn set_need_reschedule(&self) {
        self.need_reschedule.store(true, Ordering::Release);
    }

    /// True while a wake should be honoured at the next preemption point.
    #[must_use]
    pub fn needs_reschedule(&self) -> bool {
        self.need_reschedule.load(Ordering::Acquire)
    }

    /// Ask this CPU to flush its TLB lazily, at its next dispatch.
    pub fn request_lazy_tlb_flush(&self) {
        self.lazy_flush_tlb.store(true, Ordering::SeqCst);
    }

    /// True while the CPU is in its idle polling window, where it will
    /// notice the wakeup mask without an IPI. Exposed for platform glue
    /// that implements wake IPIs.
    #[must_use]
    pub fn idle_poll(&self) -> bool {
        self.idle_poll.load(Ordering::Relaxed)
    }

    fn idle_poll_start(&self) {
        self.idle_poll.store(true, Ordering::Relaxed);
    }

    fn idle_poll_end(&self) {
        self.idle_poll.store(false, Ordering::Relaxed);
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    pub(crate) fn take_terminating_thread(&self) -> Option<ThreadRef> {
        ThreadRef::from_ptr(self.terminating.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    pub(crate) fn set_terminating_thread(&self, t: *mut Thread) {
        self.terminating.store(t, Ordering::Release);
    }

    // -- Cross-CPU producer side

    /// Post a claimed (waking) thread from `src` to this CPU.
    pub(crate) fn push_incoming(&self, src: usize, t: ThreadPtr) {
        self.incoming_wakeups[src].lock().push_back(t);
    }

    /// Set `src`'s announcement bit; returns whether it was already set.
    pub(crate) fn announce_incoming(&self, src: usize) -> bool {
        self.incoming_wakeups_mask.test_and_set(src)
    }

    pub(crate) fn push_stage_inbox(&self, t: &Thread) {
        self.inbox.push(t);
    }

    /// Claim the whole stage-migration inbox; returns the head of an
    /// intrusive list linked through `inbox_next`.
    pub(crate) fn take_stage_inbox(&self) -> *mut Thread {
        self.inbox.take_all()
    }

    // -- Dispatch

    pub(crate) fn enqueue(&self, t: &Thread) {
        log::trace!("queue thread={}", t.id());
        debug_assert_eq!(t.detached().st.load(Ordering::Relaxed), Status::Queued);
        self.runqueue.push_back(t);
    }

    /// Drain the announcement mask and the per-source queues.
    ///
    /// Threads arrive here as `WakingSto` (or still `WakingRun` for the
    /// short window before their source CPU finishes switching away; we
    /// spin that window out). The rare self-wake — the current thread woken
    /// before it ever switched out — just reverts to `Running`.
    pub(crate) fn handle_incoming_wakeups(&self) {
        let pending = self.incoming_wakeups_mask.fetch_clear();
        if pending.is_empty() {
            return;
        }
        for src in pending.iter() {
            loop {
                let next = self.incoming_wakeups[src].lock().pop_front();
                let ThreadPtr(t) = match next {
                    Some(p) => p,
                    None => break,
                };
                // SAFETY: a waking thread cannot be reclaimed until it is
                // dispatched again.
                let t_ref = unsafe { &*t };
                let ds = t_ref.detached();
                if ptr::eq(t, self.current.load(Ordering::Relaxed)) {
                    // Woken before having had a chance to switch out. No
                    // timers to resume: migration only touches stopped
                    // threads.
                    let r = ds.st.compare_exchange(Status::WakingRun, Status::Running);
                    debug_assert!(r.is_ok());
                } else {
                    loop {
                        if ds
                            .st
                            .compare_exchange(Status::WakingSto, Status::Queued)
                            .is_ok()
                        {
                            break;
                        }
                        debug_assert_eq!(ds.st.load(Ordering::Relaxed), Status::WakingRun);
                        arch_cpu::relax();
                    }
                    self.enqueue(t_ref);
                    if let Some(sid) = ds.stage_id() {
                        stage::by_id(sid).inc_backlog();
                    }
                    debug_assert_eq!(ds.cpu_id(), self.id);
                    t_ref.resume_timers(self);
                }
            }
        }
        log::trace!("load={}", self.runqueue.len());
    }

    /// The scheduler hot path. Called with interrupts disabled, on this
    /// CPU.
    ///
    /// Drains wakeups and the stage inbox, charges the outgoing thread,
    /// re-queues it if it is still runnable, picks the next thread and
    /// switches. The code after the switch runs much later, when the
    /// outgoing thread is dispatched again — possibly on another CPU, which
    /// is why it must not use `self`.
    pub(crate) fn reschedule_from_interrupt(&self) {
        log::trace!("sched");
        debug_assert!(!arch_cpu::interrupts_enabled());
        self.need_reschedule.store(false, Ordering::Relaxed);
        self.handle_incoming_wakeups();

        let now = Instant::now();
        let interval = match now.checked_duration_since(self.running_since()) {
            Some(d) if !d.is_zero() => d,
            _ => CONTEXT_SWITCH_PENALTY,
        };
        self.running_since
            .store(now.as_nanos(), Ordering::Relaxed);

        let p = self
            .current_thread()
            .expect("reschedule on a CPU that never entered the scheduler");
        let p_status = p.t().detached().st.load(Ordering::Acquire);
        debug_assert_ne!(p_status, Status::Queued);

        // During a stage handoff the outgoing thread already points at the
        // destination CPU; draining the inbox here would self-deadlock on
        // the not-yet-finished switch.
        if p_status != Status::MigratingRun {
            stage::dequeue_local(self);
        }

        p.t().charge_cpu_time(interval);

        let idle = self
            .idle_thread()
            .expect("reschedule before the idle thread was adopted");

        if p_status == Status::Running {
            if self.runqueue.is_empty() {
                // Nothing else to run; the idle thread stays put the same
                // way any sole runnable thread does.
                return;
            }
            if p != idle {
                p.t().detached().st.store(Status::Queued, Ordering::Release);
                log::trace!("preempt thread={}", p.t().id());
                p.t().stats().incr_preemptions();
                self.enqueue(p.t());
            }
            // The idle thread is never queued; it is the implicit dispatch
            // fallback and keeps its Running status while off-CPU.
        } else if let Some(sid) = p.t().detached().stage_id() {
            // Going to sleep: the thread leaves its stage's backlog.
            stage::by_id(sid).dec_backlog();
        }

        let (n, from_queue) = match self.runqueue.pop_front() {
            Some(n) => (n, true),
            None => (idle, false),
        };
        debug_assert!(n != p);

        n.t().cputime_estimator_set(now, n.t().total_cpu_time());
        if n == idle {
            log::trace!("idle");
        } else if p == idle {
            log::trace!("idle ret");
        }
        n.t().stats().incr_switches();
        log::trace!("load={}", self.runqueue.len());

        if from_queue {
            debug_assert_eq!(n.t().detached().st.load(Ordering::Relaxed), Status::Queued);
            n.t().detached().st.store(Status::Running, Ordering::Release);
        } else {
            debug_assert_eq!(n.t().detached().st.load(Ordering::Relaxed), Status::Running);
        }

        self.current.store(n.as_ptr(), Ordering::Release);

        if self.lazy_flush_tlb.swap(false, Ordering::SeqCst) {
            arch_cpu::flush_tlb_local();
        }

        self.prev.store(p.as_ptr(), Ordering::Release);
        // SAFETY: interrupts are off, both contexts are valid: p is the
        // running thread, n's context was saved by a previous switch or
        // seeded by init_stack.
        unsafe {
            let p_sp = &mut (*p.t().context()).sp as *mut usize;
            let n_sp = (*n.t().context()).sp;
            context::switch(p_sp, n_sp);
        }

        // Back after being dispatched again. Local variables, including
        // `self`, describe the world before we slept; pinning may have
        // moved us to a different CPU.
        super::current_cpu().finish_switch();
    }

    /// Complete the switch that resumed the calling thread: downgrade the
    /// outgoing thread's `*Run` status to `*Sto` now that it is truly
    /// off-CPU, and free any latched corpse.
    pub(crate) fn finish_switch(&self) {
        if let Some(prev) = ThreadRef::from_ptr(self.prev.swap(ptr::null_mut(), Ordering::AcqRel))
        {
            let st = &prev.t().detached().st;
            loop {
                let edge = match st.load(Ordering::Acquire) {
                    Status::WaitingRun => (Status::WaitingRun, Status::WaitingSto),
                    Status::WakingRun => (Status::WakingRun, Status::WakingSto),
                    Status::SendingLockRun => (Status::SendingLockRun, Status::SendingLockSto),
                    Status::MigratingRun => (Status::MigratingRun, Status::MigratingSto),
                    _ => break,
                };
                if st.compare_exchange(edge.0, edge.1).is_ok() {
                    break;
                }
            }
        }

        if let Some(corpse) = self.take_terminating_thread() {
            thread::destroy(corpse.as_ptr());
        }
    }

    // -- Idle

    /// Wait for work: poll wakeups and the stage inbox, optionally parking
    /// in monitor/mwait armed on the wakeup mask.
    pub(crate) fn do_idle(&self) {
        loop {
            self.handle_incoming_wakeups();
            stage::dequeue_local(self);
            if !self.runqueue.is_empty() {
                return;
            }
            if IDLE_MWAIT.load(Ordering::Relaxed) {
                self.idle_poll_start();
                arch_cpu::monitor(self.incoming_wakeups_mask.monitor_addr());
                // A wake that landed between the drain above and arming
                // the monitor left its bit set; skip the wait then.
                if self.incoming_wakeups_mask.load().is_empty() && self.runqueue.is_empty() {
                    arch_cpu::mwait();
                }
                self.idle_poll_end();
            } else {
                arch_cpu::relax();
            }
        }
    }

    /// Body of the idle thread. Never sleeps — the scheduler must always
    /// find at least one dispatchable context — which the disabled
    /// preemption counter asserts.
    pub(crate) fn idle(&self) -> ! {
        super::preempt_disable();

        if self.id == 0 {
            thread::start_early_threads();
        }

        loop {
            self.do_idle();
            // The runqueue is non-empty; this dispatches its head.
            super::schedule();
        }
    }
}

impl core::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("load", &self.load())
            .finish()
    }
}
