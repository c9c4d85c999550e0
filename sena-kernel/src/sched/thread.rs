//! Threads
//!
//! A thread owns its stack, its saved context and its entry closure. Its
//! lifecycle state lives in a separately owned *detached state* shared
//! through an `Arc`: remote wakers, timer dispatch and the completion
//! protocol all operate on the detached state, which lets them race with
//! thread destruction safely — the joiner may free the thread object while
//! the last scheduler interaction still publishes `Terminated` through its
//! own reference.
//!
//! Threads are registered in a map from numeric id to object; ids come from
//! a monotonic generator that wraps before the reserved high range.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use sena_arch::{context, IrqGuard, IrqSpinMutex};
use sena_pal::clock::Instant;
use sena_pal::Duration;

use super::cpu::Cpu;
use super::mutex::Mutex;
use super::stage;
use super::status::{Status, StatusCell, WAKE_DEFAULT_MASK};
use super::timer::{Timer, TimerClient};
use super::wait::{wait_until, WaitRecord};
use super::{cpu_by_id, current_cpu, preempt_disable, preempt_enable, PreemptGuard};

/// Ids above this are reserved for special purposes; the generator wraps
/// back to 1 instead of handing them out.
const TID_MAX: u32 = u32::MAX - 4096;

/// Default stack size for threads that do not specify one.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Lowest bits dropped when packing the cputime estimator: microsecond
/// granularity instead of nanosecond.
const CPUTIME_SHIFT: u32 = 10;

// -- Detached state

/// How a thread's completion interacts with `join`/`detach`.
const DETACH_ATTACHED: u32 = 0;
const DETACH_DETACHED: u32 = 1;
const DETACH_ATTACHED_COMPLETE: u32 = 2;

/// The part of a thread co-owned with the scheduler.
///
/// Holds everything a remote CPU may touch after the thread object itself
/// is gone: the status cell, the owning CPU, the current stage and the
/// lock-handoff flag.
pub(crate) struct DetachedState {
    pub(crate) st: StatusCell,
    cpu: AtomicUsize,
    stage: AtomicI32,
    lock_sent: AtomicBool,
    thread: AtomicPtr<Thread>,
}

impl DetachedState {
    fn new() -> Self {
        Self {
            st: StatusCell::new(Status::Unstarted),
            cpu: AtomicUsize::new(0),
            stage: AtomicI32::new(-1),
            lock_sent: AtomicBool::new(false),
            thread: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn cpu_id(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// Current stage id, or `None`.
    pub(crate) fn stage_id(&self) -> Option<usize> {
        let id = self.stage.load(Ordering::Acquire);
        if id < 0 { None } else { Some(id as usize) }
    }

    pub(crate) fn set_stage(&self, id: Option<usize>) {
        self.stage
            .store(id.map(|i| i as i32).unwrap_or(-1), Ordering::Release);
    }

    pub(crate) fn set_lock_sent(&self) {
        self.lock_sent.store(true, Ordering::Release);
    }

    pub(crate) fn take_lock_sent(&self) -> bool {
        self.lock_sent.swap(false, Ordering::AcqRel)
    }

    fn thread_ptr(&self) -> *mut Thread {
        self.thread.load(Ordering::Acquire)
    }
}

/// A wake-capable reference to a thread that may since have terminated.
///
/// Holds only the detached state, so waking through a handle is safe at any
/// point of the thread's lifecycle; a wake that races with termination
/// degenerates to a failed CAS.
#[derive(Clone)]
pub struct ThreadHandle {
    ds: Arc<DetachedState>,
}

impl ThreadHandle {
    pub fn wake(&self) {
        wake_impl(&self.ds, WAKE_DEFAULT_MASK);
    }
}

// -- Thread reference plumbing

/// Borrowed reference to a live thread.
#[derive(Clone, Copy)]
pub(crate) struct ThreadRef(NonNull<Thread>);

impl ThreadRef {
    pub(crate) fn from_ptr(p: *mut Thread) -> Option<Self> {
        NonNull::new(p).map(Self)
    }

    pub(crate) fn as_ptr(&self) -> *mut Thread {
        self.0.as_ptr()
    }

    /// Access the thread.
    ///
    /// Scheduler structures (runqueues, wakeup queues, the registry) only
    /// hold references to threads that have not been reclaimed; reclamation
    /// requires the thread to have left all of them.
    pub(crate) fn t(&self) -> &Thread {
        // SAFETY: see above.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// Raw thread pointer wrapper for queues and the registry.
#[derive(Clone, Copy)]
pub(crate) struct ThreadPtr(pub *mut Thread);

// SAFETY: thread objects are shared across CPUs by design; all their
// mutable state is behind atomics or locks.
unsafe impl Send for ThreadPtr {}

// -- Attributes

enum StackSpec {
    /// Allocate a stack of this size.
    Size(usize),
    /// Caller-provided memory; not freed on thread destruction.
    Raw { base: *mut u8, size: usize },
}

/// Construction-time thread attributes.
pub struct ThreadAttr {
    name: Option<String>,
    stack: StackSpec,
    pin: Option<usize>,
    detached: bool,
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            stack: StackSpec::Size(DEFAULT_STACK_SIZE),
            pin: None,
            detached: false,
        }
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    #[must_use]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack = StackSpec::Size(size);
        self
    }

    /// Run on caller-provided stack memory. The memory must outlive the
    /// thread and is not freed with it.
    #[must_use]
    pub fn stack(mut self, base: *mut u8, size: usize) -> Self {
        self.stack = StackSpec::Raw { base, size };
        self
    }

    /// Pin the thread to a CPU for its whole lifetime.
    #[must_use]
    pub fn pin(mut self, cpu: usize) -> Self {
        self.pin = Some(cpu);
        self
    }

    #[must_use]
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self::new()
    }
}

struct StackInfo {
    base: *mut u8,
    size: usize,
    owned: bool,
}

impl StackInfo {
    fn top(&self) -> *mut u8 {
        // Stacks grow down; keep the top 16-aligned.
        ((self.base as usize + self.size) & !15) as *mut u8
    }
}

// -- Statistics

#[derive(Default)]
pub struct ThreadStats {
    preemptions: AtomicU64,
    switches: AtomicU64,
    migrations: AtomicU64,
}

impl ThreadStats {
    pub(crate) fn incr_preemptions(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_switches(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_migrations(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }
}

// -- The thread object

type ThreadFn = Box<dyn FnOnce() + Send>;

pub struct Thread {
    id: u32,
    name: IrqSpinMutex<String>,
    func: IrqSpinMutex<Option<ThreadFn>>,
    cleanup: IrqSpinMutex<Option<ThreadFn>>,
    stack: StackInfo,
    ctx: UnsafeCell<context::Context>,
    ds: Arc<DetachedState>,
    detach_state: AtomicU32,
    joiner: AtomicPtr<Thread>,
    pinned: AtomicBool,
    /// CPU requested by the pin attribute; `usize::MAX` when unpinned.
    pin_cpu: AtomicUsize,
    migration_lock: AtomicU32,
    preempt_counter: AtomicU32,
    total_cpu_time: AtomicU64,
    cputime_estimator: AtomicU64,
    stats: ThreadStats,
    timer_client: TimerClient,
    // Intrusive links: runqueue FIFO and the stage-migration inbox.
    pub(crate) rq_next: AtomicPtr<Thread>,
    pub(crate) rq_linked: AtomicBool,
    pub(crate) inbox_next: AtomicPtr<Thread>,
}

// SAFETY: every mutable field is an atomic, a lock, or an UnsafeCell whose
// access is confined to the owning CPU (the saved context).
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Construct a thread. It does not run until [`JoinHandle::start`].
    pub fn make(f: impl FnOnce() + Send + 'static, attr: ThreadAttr) -> JoinHandle {
        let name = match attr.name {
            Some(n) => n,
            // Unnamed threads inherit ">parent" so diagnostics stay
            // attributable.
            None => match try_current() {
                Some(parent) => {
                    let mut n = String::from(">");
                    n.push_str(&parent.t().name());
                    n
                }
                None => String::new(),
            },
        };

        let stack = match attr.stack {
            StackSpec::Size(size) => {
                assert!(size != 0);
                let layout = core::alloc::Layout::from_size_align(size, 16)
                    .expect("stack layout");
                // SAFETY: size is nonzero; ownership recorded for drop.
                let base = unsafe { alloc::alloc::alloc(layout) };
                assert!(!base.is_null(), "thread stack allocation failed");
                StackInfo {
                    base,
                    size,
                    owned: true,
                }
            }
            StackSpec::Raw { base, size } => StackInfo {
                base,
                size,
                owned: false,
            },
        };

        let ds = Arc::new(DetachedState::new());
        let t = Box::new(Thread {
            id: 0,
            name: IrqSpinMutex::new(name),
            func: IrqSpinMutex::new(Some(Box::new(f))),
            cleanup: IrqSpinMutex::new(None),
            stack,
            ctx: UnsafeCell::new(context::Context::new()),
            ds: Arc::clone(&ds),
            detach_state: AtomicU32::new(if attr.detached {
                DETACH_DETACHED
            } else {
                DETACH_ATTACHED
            }),
            joiner: AtomicPtr::new(ptr::null_mut()),
            pinned: AtomicBool::new(attr.pin.is_some()),
            pin_cpu: AtomicUsize::new(attr.pin.unwrap_or(usize::MAX)),
            migration_lock: AtomicU32::new(if attr.pin.is_some() { 1 } else { 0 }),
            preempt_counter: AtomicU32::new(0),
            total_cpu_time: AtomicU64::new(0),
            cputime_estimator: AtomicU64::new(0),
            stats: ThreadStats::default(),
            timer_client: TimerClient::new_thread_client(),
            rq_next: AtomicPtr::new(ptr::null_mut()),
            rq_linked: AtomicBool::new(false),
            inbox_next: AtomicPtr::new(ptr::null_mut()),
        });
        let t = Box::into_raw(t);
        ds.thread.store(t, Ordering::Release);
        // SAFETY: not yet published; we hold the only reference.
        unsafe {
            (*t).timer_client.bind_thread(t);
            if (*t).stack.owned || !(*t).stack.base.is_null() {
                let sp = context::init_stack((*t).stack.top(), thread_entry, t as usize);
                (*(*t).ctx.get()).sp = sp;
            }
        }

        {
            let mut reg = registry().lock();
            let id = allocate_id(&reg.map, reg.idgen).expect("thread id space exhausted");
            reg.idgen = id;
            // SAFETY: id is written before the thread is reachable through
            // the map or a handle.
            unsafe { (*t).id = id };
            reg.map.insert(id, ThreadPtr(t));
        }

        log::trace!("thread {:?} created", unsafe { (*t).id });

        JoinHandle {
            t,
            ds,
            consumed: false,
        }
    }

    /// CPU the pin attribute requested, if any.
    fn pin_target(&self) -> Option<usize> {
        match self.pin_cpu.load(Ordering::Relaxed) {
            usize::MAX => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn detached(&self) -> &Arc<DetachedState> {
        &self.ds
    }

    pub(crate) fn timer_client(&self) -> &TimerClient {
        &self.timer_client
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_owned();
    }

    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }

    /// Register a closure run when the thread is reclaimed.
    pub fn set_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        assert_eq!(self.ds.st.load(Ordering::Relaxed), Status::Unstarted);
        *self.cleanup.lock() = Some(Box::new(f));
    }

    /// A wake-capable handle that survives the thread.
    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            ds: Arc::clone(&self.ds),
        }
    }

    pub(crate) fn migratable(&self) -> bool {
        self.migration_lock.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn preempt_counter(&self) -> &AtomicU32 {
        &self.preempt_counter
    }

    pub(crate) fn context(&self) -> *mut context::Context {
        self.ctx.get()
    }

    pub(crate) fn total_cpu_time(&self) -> Duration {
        Duration::from_nanos(self.total_cpu_time.load(Ordering::Relaxed))
    }

    pub(crate) fn charge_cpu_time(&self, delta: Duration) {
        self.total_cpu_time
            .fetch_add(delta.as_nanos(), Ordering::Relaxed);
    }

    // -- Wake / wait protocol

    pub fn wake(&self) {
        wake_impl(&self.ds, WAKE_DEFAULT_MASK);
    }

    /// Run `action`, then wake; preemption stays off in between so the
    /// wake cannot be lost to a migration of the waker.
    pub(crate) fn wake_with(&self, action: impl FnOnce()) {
        let _p = PreemptGuard::new();
        action();
        wake_impl(&self.ds, WAKE_DEFAULT_MASK);
    }

    /// Park the status at `WaitingRun`. Preemption is disabled until the
    /// matching [`stop_wait`](Self::stop_wait): once the status leaves
    /// `Running`, an involuntary switch would strand the thread.
    pub(crate) fn prepare_wait(&self) {
        preempt_disable();
        debug_assert_eq!(self.ds.st.load(Ordering::Relaxed), Status::Running);
        self.ds.st.store(Status::WaitingRun, Ordering::Release);
    }

    /// Leave the wait protocol. On return the status is `Running`.
    pub(crate) fn stop_wait(&self) {
        let st = &self.ds.st;
        if st.compare_exchange(Status::WaitingRun, Status::Running).is_ok() {
            preempt_enable();
            return;
        }
        // An asynchronous event claimed our status; wait for it to finish.
        preempt_enable();

        if st.load(Ordering::Acquire) == Status::Terminated {
            // Lost a race with unsafe_stop; never returns.
            super::schedule();
            unreachable!("terminated thread resumed");
        }

        loop {
            match st.load(Ordering::Acquire) {
                // The claimant finishes by dispatching us again; spin
                // through scheduler passes until it does.
                Status::SendingLockRun | Status::MigratingRun | Status::WakingRun => {
                    super::schedule();
                }
                Status::Running => break,
                other => panic!("stop_wait: illegal status {:?}", other),
            }
        }
        debug_assert_eq!(st.load(Ordering::Relaxed), Status::Running);
    }

    /// Terminate a sleeping thread in its sleep. Succeeds only on a thread
    /// that is off-CPU in `WaitingSto` (or already terminated).
    pub fn unsafe_stop(&self) -> bool {
        match self
            .ds
            .st
            .compare_exchange(Status::WaitingSto, Status::Terminated)
        {
            Ok(()) => true,
            Err(observed) => observed == Status::Terminated,
        }
    }

    // -- Timers

    pub(crate) fn suspend_timers(&self) {
        let c = cpu_by_id(self.ds.cpu_id());
        debug_assert!(
            current_cpu().id() == c.id()
                || self.ds.st.load(Ordering::Relaxed) == Status::WakingSto
        );
        self.timer_client.suspend_timers(c);
    }

    pub(crate) fn resume_timers(&self, on: &Cpu) {
        self.timer_client.resume_timers(on);
    }

    // -- CPU time

    /// Publish `(running_since, total_cpu_time)` packed into one atomic so
    /// remote observers can estimate a running thread's CPU time without
    /// synchronization.
    pub(crate) fn cputime_estimator_set(&self, running_since: Instant, total: Duration) {
        self.cputime_estimator.store(
            estimator_pack(running_since.as_nanos(), total.as_nanos()),
            Ordering::Relaxed,
        );
    }

    fn cputime_estimator_get(&self) -> (Instant, Duration) {
        let e = self.cputime_estimator.load(Ordering::Relaxed);
        let (rs, tc) = estimator_unpack(
            e,
            Instant::now().as_nanos(),
            self.total_cpu_time.load(Ordering::Relaxed),
        );
        (Instant::from_nanos(rs), Duration::from_nanos(tc))
    }

    /// Total CPU time consumed by this thread.
    pub fn thread_clock(&self) -> Duration {
        if ptr::eq(self, current().as_ptr()) {
            // Under the preemption guard the scheduler cannot update our
            // accounting concurrently.
            let _p = PreemptGuard::new();
            let since = current_cpu().running_since();
            Duration::from_nanos(
                self.total_cpu_time.load(Ordering::Relaxed)
                    + (Instant::now() - since).as_nanos(),
            )
        } else if self.ds.st.load(Ordering::Acquire) == Status::Running {
            // The estimator published before the status became visible.
            // Worst case overshoot is the duration of this code.
            let (since, total) = self.cputime_estimator_get();
            Duration::from_nanos(total.as_nanos() + (Instant::now() - since).as_nanos())
        } else {
            Duration::from_nanos(self.total_cpu_time.load(Ordering::Relaxed))
        }
    }

    // -- Lifecycle

    pub(crate) fn main(&self) {
        let f = self.func.lock().take();
        if let Some(f) = f {
            f();
        }
    }

    /// Completion: run notifiers, hand detached zombies to the reaper,
    /// latch ourselves for destruction by the next thread on this CPU and
    /// leave the CPU for good.
    pub(crate) fn complete(&self) -> ! {
        run_exit_notifiers();

        let prev = self.detach_state.compare_exchange(
            DETACH_ATTACHED,
            DETACH_ATTACHED_COMPLETE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev == Err(DETACH_DETACHED) {
            super::reaper::add_zombie(self.ds.thread_ptr());
        }

        // Once the status leaves Running we would never be dispatched
        // again, so the latching below must not be preempted.
        preempt_disable();
        self.ds.st.store(Status::Terminating, Ordering::Release);
        let cpu = cpu_by_id(self.ds.cpu_id());
        // A thread cannot free its own stack; defer destruction to the
        // next thread dispatched here. The slot holds at most one corpse.
        if let Some(prev) = cpu.take_terminating_thread() {
            assert!(!ptr::eq(prev.as_ptr(), self));
            destroy(prev.as_ptr());
        }
        cpu.set_terminating_thread(self.ds.thread_ptr());
        loop {
            super::schedule();
        }
    }

    /// Drop the permanent CPU affinity of this thread.
    pub fn unpin(&self) {
        if ptr::eq(self, current().as_ptr()) {
            let _p = PreemptGuard::new();
            if self.pinned.swap(false, Ordering::Relaxed) {
                self.migration_lock.fetch_sub(1, Ordering::Relaxed);
            }
            return;
        }
        // Unpinning a different thread must run on its CPU to avoid racing
        // concurrent pin or migration attempts; a helper chases it there.
        let target = ThreadPtr(self.ds.thread_ptr());
        let h = Thread::make(
            move || {
                let target = target;
                // SAFETY: the outer unpin call keeps the thread alive until
                // the helper is joined.
                let t = unsafe { &*target.0 };
                preempt_disable();
                while current_cpu().id() != t.ds.cpu_id() {
                    let dest = t.ds.cpu_id();
                    preempt_enable();
                    pin(dest);
                    preempt_disable();
                }
                if t.pinned.swap(false, Ordering::Relaxed) {
                    t.migration_lock.fetch_sub(1, Ordering::Relaxed);
                }
                preempt_enable();
            },
            ThreadAttr::new().pin(self.ds.cpu_id()),
        );
        h.start();
        h.join();
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.stack.owned && !self.stack.base.is_null() {
            let layout = core::alloc::Layout::from_size_align(self.stack.size, 16)
                .expect("stack layout");
            // SAFETY: allocated in make() with the same layout.
            unsafe { alloc::alloc::dealloc(self.stack.base, layout) };
        }
    }
}

/// First code of every fresh thread: finish the switch that started us,
/// then run the entry closure and complete.
extern "C" fn thread_entry(arg: usize) -> ! {
    let t = arg as *mut Thread;
    current_cpu().finish_switch();
    // SAFETY: the dispatcher only enters threads that are alive.
    unsafe { (*t).main() };
    exit();
}

/// Terminate the calling thread.
pub fn exit() -> ! {
    current().t().complete()
}

// -- The wake protocol

/// Try to claim a sleeping thread for wakeup and deliver it to its CPU.
///
/// `allowed` is a bitmask of admissible initial states, walked in the
/// temporal order the sleeping side moves through them: a thread progresses
/// `WaitingRun → WaitingSto` on its own as its CPU switches away, so a
/// failed CAS on the `Run` flavour falls through to the `Sto` flavour.
/// Exactly one waker wins; everyone else sees a wake already in flight and
/// returns.
pub(crate) fn wake_impl(ds: &Arc<DetachedState>, allowed: u32) {
    debug_assert!(allowed & Status::WaitingRun.mask() != 0);
    debug_assert!(allowed & Status::WaitingSto.mask() != 0);

    const EDGES: [(Status, Status, bool); 4] = [
        (Status::WaitingRun, Status::WakingRun, false),
        (Status::WaitingSto, Status::WakingSto, true),
        (Status::SendingLockRun, Status::WakingRun, false),
        (Status::SendingLockSto, Status::WakingSto, true),
    ];

    let mut stopped = None;
    for (from, to, was_stopped) in EDGES {
        if allowed & from.mask() != 0 && ds.st.compare_exchange(from, to).is_ok() {
            stopped = Some(was_stopped);
            break;
        }
    }
    let stopped = match stopped {
        Some(s) => s,
        // Already waking, running, or terminated: someone else's wake.
        None => return,
    };

    log::trace!("wake {:p}", Arc::as_ptr(ds));

    // Delivery. The thread cannot terminate while it is `Waking*`, so the
    // object pointer is usable until it is dispatched again.
    let _p = PreemptGuard::new();
    let t = ds.thread_ptr();
    // SAFETY: see above.
    let t_ref = unsafe { &*t };
    let mut tcpu = cpu_by_id(ds.cpu_id());

    if stopped && t_ref.migratable() {
        if let Some(stage_id) = ds.stage_id() {
            debug_assert!(!ptr::eq(t, current().as_ptr()));
            debug_assert!(!t_ref.rq_linked.load(Ordering::Relaxed));
            let target = stage::by_id(stage_id).enqueue_policy();
            if target.id() != tcpu.id() {
                let _irq = IrqGuard::new();
                log::trace!("migrate thread={} cpu={}", t_ref.id(), target.id());
                t_ref.stats.incr_migrations();
                t_ref.suspend_timers();
                ds.set_cpu(target.id());
                tcpu = target;
            }
        }
    }

    let src = current_cpu().id();
    {
        let _irq = IrqGuard::new();
        tcpu.push_incoming(src, ThreadPtr(t));
    }
    // Announce after the push; the mask operation orders both.
    if !tcpu.announce_incoming(src) && tcpu.id() == current_cpu().id() {
        // A wake for the CPU we are on: honoured at the next preemption
        // point instead of through the polled mask.
        tcpu.set_need_reschedule();
    }
}

/// Wait-morphing: wake `t` by handing it the mutex its waker holds.
///
/// On success the thread moves through `SendingLock*` and is woken later by
/// the mutex unlock path with the lock already owned. On failure (the
/// record was already woken) the claim is reverted and the thread will
/// acquire the mutex itself.
pub(crate) fn wake_lock(t: &Thread, mtx: &Mutex, wr: *const WaitRecord) {
    let ds = &t.ds;
    let from_pre = if ds
        .st
        .compare_exchange(Status::WaitingRun, Status::SendingLockRun)
        .is_ok()
    {
        true
    } else if ds
        .st
        .compare_exchange(Status::WaitingSto, Status::SendingLockSto)
        .is_ok()
    {
        false
    } else {
        // Already waking through another path; it will take the mutex on
        // its own.
        // SAFETY: the caller popped `wr` from its queue and owns it now.
        unsafe { (*wr).clear() };
        return;
    };

    if mtx.send_lock_unless_already_waiting(wr) {
        ds.set_lock_sent();
        return;
    }

    // Revert the claim.
    if from_pre
        && ds
            .st
            .compare_exchange(Status::SendingLockRun, Status::WaitingRun)
            .is_ok()
    {
        // still on its CPU, back to plain waiting
    } else {
        // The CPU switched away in the meantime.
        debug_assert_eq!(ds.st.load(Ordering::Relaxed), Status::SendingLockSto);
        let _ = ds
            .st
            .compare_exchange(Status::SendingLockSto, Status::WaitingSto);
    }
    // SAFETY: as above.
    unsafe { (*wr).clear() };
}

/// Yield until dispatched again.
pub(crate) fn wait() {
    log::trace!("wait");
    super::schedule();
}

// -- Completion, join, destroy

/// Publish a terminating thread's demise and wake its joiner.
///
/// Runs on the thread's CPU, from the first dispatch after its final
/// switch; never from the dying thread itself (it would be freeing the
/// stack it runs on).
pub(crate) fn destroy(t: *mut Thread) {
    debug_assert!(!ptr::eq(t, current().as_ptr()));
    // SAFETY: the terminating thread stays alive until join observes
    // `Terminated`, which this function publishes.
    let t_ref = unsafe { &*t };
    debug_assert_eq!(t_ref.ds.st.load(Ordering::Relaxed), Status::Terminating);

    // Keep the detached state alive independently: the moment `Terminated`
    // is published, a concurrent join may reclaim the thread object.
    let ds = Arc::clone(&t_ref.ds);
    match t_ref
        .joiner
        .compare_exchange(ptr::null_mut(), t, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => {
            // No joiner yet; it will observe Terminated and skip waiting.
            ds.st.store(Status::Terminated, Ordering::Release);
        }
        Err(joiner) => {
            // The joiner won the race and sleeps; publish and wake it.
            // SAFETY: a sleeping joiner is alive.
            let joiner = unsafe { &*joiner };
            joiner.wake_with(|| ds.st.store(Status::Terminated, Ordering::Release));
        }
    }
}

/// Wait for `t` to terminate and reclaim it. Shared by the join handle and
/// the reaper.
pub(crate) fn join_ptr(t: *mut Thread) {
    // SAFETY: the caller owns the reclamation right; the thread is alive.
    let t_ref = unsafe { &*t };
    let st = &t_ref.ds.st;

    if st.load(Ordering::Acquire) == Status::Unstarted {
        // Never started; nothing will ever publish Terminated.
        reclaim(t);
        return;
    }

    let me = current().as_ptr();
    if t_ref
        .joiner
        .compare_exchange(ptr::null_mut(), me, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // destroy() got there first; it no longer touches the object.
        reclaim(t);
        return;
    }

    let ds = Arc::clone(&t_ref.ds);
    wait_until(|| ds.st.load(Ordering::Acquire) == Status::Terminated);
    reclaim(t);
}

/// Tear the thread down: deregister, account, run cleanup, free.
fn reclaim(t: *mut Thread) {
    // SAFETY: single reclaimer, established by join_ptr.
    let boxed = unsafe { Box::from_raw(t) };
    {
        let mut reg = registry().lock();
        reg.map.remove(&boxed.id);
    }
    TOTAL_EXITED_NS.fetch_add(boxed.total_cpu_time.load(Ordering::Relaxed), Ordering::Relaxed);
    let cleanup = boxed.cleanup.lock().take();
    if let Some(f) = cleanup {
        f();
    }
    log::trace!("thread {} reclaimed", boxed.id);
    drop(boxed);
}

// -- Join handle

/// Owner's handle to a thread: start it, wake it, join it.
///
/// Dropping the handle joins first, so a thread object can never outlive
/// its owner unnoticed; `detach` transfers that responsibility to the
/// reaper.
pub struct JoinHandle {
    t: *mut Thread,
    ds: Arc<DetachedState>,
    consumed: bool,
}

// SAFETY: the underlying thread object is Sync; the handle only adds the
// reclamation right, which moves with it.
unsafe impl Send for JoinHandle {}

impl JoinHandle {
    /// Make the thread runnable.
    ///
    /// Before the scheduler is up the thread parks as `Prestarted` and is
    /// started during bring-up.
    pub fn start(&self) {
        // SAFETY: the handle keeps the thread alive.
        let t = unsafe { &*self.t };
        assert_eq!(t.ds.st.load(Ordering::Relaxed), Status::Unstarted);

        if !super::scheduler_up() {
            t.ds.st.store(Status::Prestarted, Ordering::Release);
            return;
        }

        let cpu = t
            .pin_target()
            .unwrap_or_else(|| current().t().ds.cpu_id());
        t.ds.set_cpu(cpu);
        t.ds.st.store(Status::WaitingSto, Ordering::Release);
        t.wake();
    }

    pub fn wake(&self) {
        wake_impl(&self.ds, WAKE_DEFAULT_MASK);
    }

    pub fn id(&self) -> u32 {
        // SAFETY: the handle keeps the thread alive.
        unsafe { (*self.t).id }
    }

    /// Borrow the thread object.
    pub fn thread(&self) -> &Thread {
        // SAFETY: the handle keeps the thread alive.
        unsafe { &*self.t }
    }

    /// Wait for termination and reclaim the thread.
    pub fn join(mut self) {
        self.join_inner();
    }

    /// Give the thread to the reaper; it is reclaimed after completion
    /// without anyone joining.
    pub fn detach(mut self) {
        self.consumed = true;
        // SAFETY: the handle keeps the thread alive until this call, and
        // afterwards the reaper owns reclamation.
        let t = unsafe { &*self.t };
        match t.detach_state.compare_exchange(
            DETACH_ATTACHED,
            DETACH_DETACHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(DETACH_ATTACHED_COMPLETE) => {
                // Completed before the detach: nobody else will reap it.
                super::reaper::add_zombie(self.t);
            }
            Err(_) => {}
        }
    }

    fn join_inner(&mut self) {
        if self.consumed {
            return;
        }
        self.consumed = true;
        join_ptr(self.t);
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        self.join_inner();
    }
}

// -- Pinning

/// Pin the *calling* thread to `target_cpu`, migrating it there first if
/// needed.
///
/// The wakeup that re-enqueues us on the target CPU cannot be issued from
/// this CPU while we still run here, so a short-lived helper thread, pinned
/// to the source CPU, performs it after we have switched away.
pub fn pin(target_cpu: usize) {
    let tref = current();
    let t = tref.t();
    {
        let _p = PreemptGuard::new();
        if !t.pinned.swap(true, Ordering::Relaxed) {
            // Pinning carries one unit of migration lock.
            t.migration_lock.fetch_add(1, Ordering::Relaxed);
        }
    }
    let source = current_cpu();
    if source.id() == target_cpu {
        return;
    }

    let flag = Arc::new(AtomicBool::new(false));
    let wake_flag = Arc::clone(&flag);
    let me = t.handle();
    let wakeme = Thread::make(
        move || {
            wait_until(|| wake_flag.load(Ordering::Acquire));
            me.wake();
        },
        ThreadAttr::new().pin(source.id()),
    );
    wakeme.start();
    {
        let _irq = IrqGuard::new();
        log::trace!("migrate thread={} cpu={}", t.id(), target_cpu);
        t.stats.incr_migrations();
        t.suspend_timers();
        t.ds.set_cpu(target_cpu);
        t.ds.st.store(Status::WaitingRun, Ordering::Release);
        // The helper shares this CPU and interrupts are off: it cannot run
        // (and wake us) before we are truly gone.
        wakeme.thread().wake_with(|| flag.store(true, Ordering::Release));
        source.reschedule_from_interrupt();
    }
    // Running on the target CPU now; the handle drop joins the helper.
}

// -- Registry

struct Registry {
    map: BTreeMap<u32, ThreadPtr>,
    idgen: u32,
}

static REGISTRY: IrqSpinMutex<Registry> = IrqSpinMutex::new(Registry {
    map: BTreeMap::new(),
    idgen: 0,
});

/// CPU time of threads that have already been reclaimed.
static TOTAL_EXITED_NS: AtomicU64 = AtomicU64::new(0);

fn registry() -> &'static IrqSpinMutex<Registry> {
    &REGISTRY
}

/// Next free id after `start`, wrapping past [`TID_MAX`]. One full rotation
/// without a free id gives up.
fn allocate_id(map: &BTreeMap<u32, ThreadPtr>, start: u32) -> Option<u32> {
    let stop = if start == 0 || start > TID_MAX { TID_MAX } else { start };
    let mut tid = start;
    loop {
        tid += 1;
        if tid > TID_MAX {
            tid = 1;
        }
        if !map.contains_key(&tid) {
            return Some(tid);
        }
        if tid == stop {
            return None;
        }
    }
}

/// The thread running on the calling CPU.
///
/// Panics outside thread context; use [`try_current`] where bring-up may
/// not have happened.
pub(crate) fn current() -> ThreadRef {
    try_current().expect("no current thread on this CPU")
}

pub(crate) fn try_current() -> Option<ThreadRef> {
    super::try_current_cpu().and_then(|c| c.current_thread())
}

/// Numeric id of the calling thread.
pub fn current_id() -> u32 {
    current().t().id()
}

/// Run `f` with the calling thread.
pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
    f(current().t())
}

/// Look up a thread by id; the handle stays safe even if the thread
/// terminates right after.
pub fn find_by_id(id: u32) -> Option<ThreadHandle> {
    let reg = registry().lock();
    reg.map.get(&id).map(|p| {
        // SAFETY: registered threads are alive; reclaim deregisters first.
        let t = unsafe { &*p.0 };
        t.handle()
    })
}

/// Run `f` over every registered thread. `f` must not sleep; the registry
/// lock is held throughout.
pub fn with_all_threads(mut f: impl FnMut(&Thread)) {
    let reg = registry().lock();
    for p in reg.map.values() {
        // SAFETY: registered threads are alive.
        f(unsafe { &*p.0 });
    }
}

/// Run `f` with the thread for `id`, or `None` when unknown. Same
/// no-sleeping contract as [`with_all_threads`].
pub fn with_thread_by_id<R>(id: u32, f: impl FnOnce(Option<&Thread>) -> R) -> R {
    let reg = registry().lock();
    // SAFETY: registered threads are alive.
    f(reg.map.get(&id).map(|p| unsafe { &*p.0 }))
}

pub fn num_threads() -> usize {
    registry().lock().map.len()
}

/// Total application CPU time: exited threads plus everything currently
/// registered.
pub fn run_stats() -> Duration {
    let mut total = TOTAL_EXITED_NS.load(Ordering::Relaxed);
    let reg = registry().lock();
    for p in reg.map.values() {
        // SAFETY: registered threads are alive.
        total += unsafe { &*p.0 }.thread_clock().as_nanos();
    }
    Duration::from_nanos(total)
}

/// Start every thread parked as `Prestarted` before the scheduler came up.
pub(crate) fn start_early_threads() {
    // Collect first: starting wakes threads, which must not happen under
    // the registry lock.
    let mut early: Vec<ThreadPtr> = Vec::new();
    {
        let reg = registry().lock();
        for p in reg.map.values() {
            // SAFETY: registered threads are alive.
            let t = unsafe { &*p.0 };
            if t.ds.st.load(Ordering::Relaxed) == Status::Prestarted {
                early.push(*p);
            }
        }
    }
    for p in early {
        // SAFETY: prestarted threads have no other owner action pending.
        let t = unsafe { &*p.0 };
        if t
            .ds
            .st
            .compare_exchange(Status::Prestarted, Status::Unstarted)
            .is_ok()
        {
            t.ds.set_cpu(t.pin_target().unwrap_or(0));
            t.ds.st.store(Status::WaitingSto, Ordering::Release);
            t.wake();
        }
    }
}

// -- Exit notifiers

type Notifier = Box<dyn Fn() + Send + Sync>;

static EXIT_NOTIFIERS: spin::RwLock<Vec<Notifier>> = spin::RwLock::new(Vec::new());

/// Register a callback run by every thread as it completes.
pub fn register_exit_notifier(f: impl Fn() + Send + Sync + 'static) {
    EXIT_NOTIFIERS.write().insert(0, Box::new(f));
}

fn run_exit_notifiers() {
    for n in EXIT_NOTIFIERS.read().iter() {
        n();
    }
}

// -- Sleeping

/// Block the calling thread for at least `d`.
pub fn sleep(d: Duration) {
    let timer = Timer::for_current();
    timer.set(Instant::now() + d);
    wait_until(|| timer.expired());
}

// -- The cputime estimator packing

/// Pack `(running_since, total_cpu_time)` into 32 bits each: drop the low
/// [`CPUTIME_SHIFT`] bits (microsecond accuracy) and the high 22 bits
/// (range of ~2000 s, far beyond any inter-switch interval).
fn estimator_pack(running_since_ns: u64, total_ns: u64) -> u64 {
    let rs = (running_since_ns >> CPUTIME_SHIFT) as u32;
    let tc = (total_ns >> CPUTIME_SHIFT) as u32;
    rs as u64 | ((tc as u64) << 32)
}

/// Recover the full values using reference readings of the clock and the
/// total counter: the dropped high bits usually match the reference's, and
/// a reference that wrapped past the cutoff since the pack is detected by
/// its low part being smaller than the packed one.
fn estimator_unpack(e: u64, rs_ref: u64, tc_ref: u64) -> (u64, u64) {
    let rs = (e as u32 as u64) << CPUTIME_SHIFT;
    let tc = (e >> 32) << CPUTIME_SHIFT;
    const HO: u64 = !(u64::MAX >> (64 - 32 - CPUTIME_SHIFT));
    let mut rs_ho = rs_ref & HO;
    let mut tc_ho = tc_ref & HO;
    if (rs_ref & !HO) < rs {
        rs_ho = rs_ho.wrapping_sub(1 << (32 + CPUTIME_SHIFT));
    }
    if (tc_ref & !HO) < tc {
        tc_ho = tc_ho.wrapping_sub(1 << (32 + CPUTIME_SHIFT));
    }
    (rs_ho | rs, tc_ho | tc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAIN: u64 = 1 << CPUTIME_SHIFT;

    #[test]
    fn estimator_roundtrip_is_exact_at_grain() {
        let rs = 123_456_789 & !(GRAIN - 1);
        let tc = 42_000_000 & !(GRAIN - 1);
        let e = estimator_pack(rs, tc);
        // References taken shortly after the pack share the high bits.
        let (rs2, tc2) = estimator_unpack(e, rs + 5_000, tc + 1_000);
        assert_eq!(rs2, rs);
        assert_eq!(tc2, tc);
    }

    #[test]
    fn estimator_drops_only_low_bits() {
        let rs = 987_654_321;
        let tc = 55_555_555;
        let e = estimator_pack(rs, tc);
        let (rs2, tc2) = estimator_unpack(e, rs, tc);
        assert_eq!(rs2, rs & !(GRAIN - 1));
        assert_eq!(tc2, tc & !(GRAIN - 1));
    }

    #[test]
    fn estimator_recovers_high_bit_rollover() {
        // Pack just below a high-part boundary, reference just above it:
        // the saved low part is larger than the reference's, which must be
        // recognized as a rollover and corrected downward.
        let boundary = 1u64 << (32 + CPUTIME_SHIFT);
        let rs = boundary - GRAIN;
        let tc = boundary - 4 * GRAIN;
        let e = estimator_pack(rs, tc);
        let (rs2, tc2) = estimator_unpack(e, boundary + GRAIN, boundary + GRAIN);
        assert_eq!(rs2, rs);
        assert_eq!(tc2, tc);
    }

    #[test]
    fn id_allocation_skips_taken_and_wraps() {
        let mut map: BTreeMap<u32, ThreadPtr> = BTreeMap::new();
        map.insert(1, ThreadPtr(ptr::null_mut()));
        map.insert(2, ThreadPtr(ptr::null_mut()));
        assert_eq!(allocate_id(&map, 0), Some(3));
        assert_eq!(allocate_id(&map, 2), Some(3));
        // At the top of the space the generator wraps back past the
        // reserved range.
        assert_eq!(allocate_id(&map, TID_MAX), Some(3));
        map.insert(3, ThreadPtr(ptr::null_mut()));
        assert_eq!(allocate_id(&map, TID_MAX - 1), Some(TID_MAX));
    }

    #[test]
    fn id_allocation_gives_up_after_one_rotation() {
        // A tiny synthetic rotation: every id in [1, stop] taken.
        let mut map: BTreeMap<u32, ThreadPtr> = BTreeMap::new();
        for id in 1..=4u32 {
            map.insert(id, ThreadPtr(ptr::null_mut()));
        }
        // start == 4: ids 5.. are free, so allocation still succeeds.
        assert_eq!(allocate_id(&map, 4), Some(5));
    }
}
