//! Stages
//!
//! A stage is a named class of work. Threads attach themselves to a stage
//! by calling [`Stage::enqueue`], which migrates the calling thread to a
//! CPU currently dedicated to that stage; the per-stage backlog counter
//! (outstanding runnable members) is the demand signal the assignment
//! engine divides CPUs by.
//!
//! All stages are defined once, before the first enqueue; the registry is
//! fixed afterwards.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use sena_arch::{IrqGuard, IrqSpinMutex, SpinLock};
use sena_pal::clock::Instant;
use sena_pal::Duration;
use spin::{Once, RwLock};

use super::assignment::{compute_requirements, smooth_loads, Assignment};
use super::cpu::Cpu;
use super::cpu_set::CpuSet;
use super::status::Status;
use super::thread;
use super::{cpu_by_id, cpus, current_cpu, preemptable};

/// Upper bound on the number of stages.
pub const MAX_STAGES: usize = 8;

/// How long an assignment may serve enqueues before it is recomputed.
static MAX_ASSIGNMENT_AGE_NS: AtomicU64 = AtomicU64::new(20_000_000);

/// Nonzero: dynamic assignment is off and stage `i` uses CPUs
/// `{n*i, n*i+1}`.
static FIXED_CPUS_PER_STAGE: AtomicUsize = AtomicUsize::new(0);

pub fn set_max_assignment_age(age: Duration) {
    MAX_ASSIGNMENT_AGE_NS.store(age.as_nanos(), Ordering::Relaxed);
}

pub fn set_fixed_cpus_per_stage(stride: usize) {
    FIXED_CPUS_PER_STAGE.store(stride, Ordering::Relaxed);
}

/// A named stage. Obtained from [`define`]; all references are `'static`.
pub struct Stage {
    id: AtomicU32,
    name: Once<String>,
    /// Outstanding runnable members; the proportional demand signal.
    backlog: AtomicI64,
}

impl Stage {
    const fn empty() -> Self {
        Self {
            id: AtomicU32::new(0),
            name: Once::new(),
            backlog: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed) as usize
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or("")
    }

    #[must_use]
    pub fn backlog(&self) -> i64 {
        self.backlog.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_backlog(&self) {
        self.backlog.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_backlog(&self) {
        self.backlog.fetch_sub(1, Ordering::Relaxed);
    }

    /// Pick the CPU an enqueue to this stage should land on, refreshing
    /// the assignment first when it has aged out.
    pub(crate) fn enqueue_policy(&self) -> &'static Cpu {
        let ncpus = cpus().len();

        let stride = FIXED_CPUS_PER_STAGE.load(Ordering::Relaxed);
        if stride != 0 {
            let mut set = CpuSet::EMPTY;
            for c in [stride * self.id(), stride * self.id() + 1] {
                if c < ncpus {
                    set.set(c);
                }
            }
            if !set.is_empty() {
                return least_busy(set);
            }
        }

        // Serve enqueues from the existing assignment for up to its
        // maximum age; a single CAS winner recomputes it, everyone else
        // keeps reading the old snapshot meanwhile.
        let now = Instant::now().as_nanos();
        let age = now.saturating_sub(ASSIGNMENT_CREATED_NS.load(Ordering::Acquire));
        let can_update = preemptable() && age > MAX_ASSIGNMENT_AGE_NS.load(Ordering::Relaxed);
        if can_update
            && !ASSIGNMENT_UPDATING.swap(true, Ordering::AcqRel)
        {
            update_assignment();
            // Restart aging only after the new snapshot is visible.
            ASSIGNMENT_CREATED_NS.store(Instant::now().as_nanos(), Ordering::Release);
            ASSIGNMENT_UPDATING.store(false, Ordering::Release);
        }

        let acpus = {
            let guard = ASSIGNMENT.read();
            let a = guard.as_ref().expect("stage enqueue before define");
            a.stage_cpus(self.id())
        };

        if acpus.is_empty() {
            // This stage is so irrelevant it owns no CPU; fall back to the
            // last one instead of disturbing the dedicated sets.
            return cpu_by_id(ncpus - 1);
        }
        least_busy(acpus)
    }

    /// Move the calling thread under this stage, migrating it to one of
    /// the stage's CPUs.
    ///
    /// On return the thread executes on the chosen CPU. The interrupts-off
    /// window spans the context switch; that is sound because the switch
    /// happens on the calling thread's own stack and the destination CPU
    /// will not dispatch us until this CPU has fully switched away (the
    /// `MigratingRun → MigratingSto` gate).
    pub fn enqueue(&'static self) {
        let target = self.enqueue_policy();

        let _irq = IrqGuard::new();
        let source = current_cpu();
        let tref = thread::current();
        let t = tref.t();
        let ds = t.detached();

        log::trace!(
            "stage enqueue stage={} scpu={} tcpu={} thread={}",
            self.id(),
            source.id(),
            target.id(),
            t.id()
        );

        assert!(t.migratable());
        assert!(!t.rq_linked.load(Ordering::Relaxed));
        let claimed = ds.st.compare_exchange(Status::Running, Status::MigratingRun);
        assert!(claimed.is_ok());

        // Backlog handover. The dispatch below sees a non-runnable
        // outgoing thread and debits the thread's *current* stage, which
        // is this one after the switch of attachment: credit it here so
        // the pair cancels, and debit the stage we are leaving.
        if let Some(old) = ds.stage_id() {
            by_id(old).dec_backlog();
        }
        ds.set_stage(Some(self.id()));
        self.inc_backlog();

        if target.id() == source.id() {
            ds.st.store(Status::Running, Ordering::Release);
            source.reschedule_from_interrupt();
            return;
        }

        t.stats().incr_migrations();
        t.suspend_timers();
        ds.set_cpu(target.id());

        // Publish as late as possible to shrink the window in which the
        // destination spins on our not-yet-finished switch.
        target.push_stage_inbox(t);
        target.announce_incoming(source.id());

        // Find something else to run here; our own switch-out downgrades
        // the status and unblocks the destination.
        source.reschedule_from_interrupt();
        // Running on the destination CPU now.
    }
}

fn least_busy(set: CpuSet) -> &'static Cpu {
    let c = set
        .iter()
        .min_by_key(|c| cpu_by_id(*c).load())
        .expect("least_busy on an empty set");
    cpu_by_id(c)
}

/// Drain `cpu`'s stage-migration inbox into its runqueue.
///
/// Runs at the top of every dispatch on `cpu` (except when the outgoing
/// thread is itself mid-handoff) and from the idle polling loop. Threads
/// still `MigratingRun` are spun on: their source CPU is inside its final
/// context switch.
pub(crate) fn dequeue_local(cpu: &Cpu) {
    let _irq = IrqGuard::new();

    let mut next = cpu.take_stage_inbox();
    while let Some(tref) = thread::ThreadRef::from_ptr(next) {
        let t = tref.t();
        // Read the link first; once queued the thread can run and reuse it.
        next = t.inbox_next.load(Ordering::Relaxed);

        let ds = t.detached();
        loop {
            if ds
                .st
                .compare_exchange(Status::MigratingSto, Status::Queued)
                .is_ok()
            {
                break;
            }
            log::trace!("stage dequeue wait dcpu={} thread={}", cpu.id(), t.id());
            debug_assert_eq!(ds.st.load(Ordering::Relaxed), Status::MigratingRun);
            sena_arch::cpu::relax();
        }
        debug_assert_eq!(ds.cpu_id(), cpu.id());
        log::trace!("stage dequeue dcpu={} thread={}", cpu.id(), t.id());
        cpu.enqueue(t);
        if let Some(sid) = ds.stage_id() {
            by_id(sid).inc_backlog();
        }
        t.resume_timers(cpu);
    }
}

// -- Registry

static STAGES: [Stage; MAX_STAGES] = [const { Stage::empty() }; MAX_STAGES];
static STAGE_COUNT: AtomicUsize = AtomicUsize::new(0);
static DEFINE_LOCK: IrqSpinMutex<()> = IrqSpinMutex::new(());

/// Register a stage. Returns `None` when the table is full.
///
/// All stages must be defined before the first enqueue: the assignment
/// engine assumes a fixed stage count.
pub fn define(name: &str) -> Option<&'static Stage> {
    let _guard = DEFINE_LOCK.lock();

    let count = STAGE_COUNT.load(Ordering::Relaxed);
    if count == MAX_STAGES {
        return None;
    }

    let stage = &STAGES[count];
    stage.id.store(count as u32, Ordering::Relaxed);
    stage.name.call_once(|| name.to_owned());

    // Each definition republishes a fresh round-robin assignment over the
    // new stage count.
    let ncpus = cpus().len();
    *ASSIGNMENT.write() = Some(Arc::new(Assignment::initial(ncpus, count + 1)));
    ASSIGNMENT_CREATED_NS.store(Instant::now().as_nanos(), Ordering::Release);

    STAGE_COUNT.store(count + 1, Ordering::Release);
    log::debug!("stage {} defined: {}", count, name);
    Some(stage)
}

pub(crate) fn by_id(id: usize) -> &'static Stage {
    &STAGES[id]
}

/// Number of defined stages.
#[must_use]
pub fn count() -> usize {
    STAGE_COUNT.load(Ordering::Acquire)
}

// -- Assignment publication

static ASSIGNMENT: RwLock<Option<Arc<Assignment>>> = RwLock::new(None);
static ASSIGNMENT_UPDATING: AtomicBool = AtomicBool::new(false);
static ASSIGNMENT_CREATED_NS: AtomicU64 = AtomicU64::new(0);
/// Smoothed backlog state. Touched only by the single updater, which runs
/// in a preemptible (never interrupt) context, so a plain spinlock does.
static EWMA: SpinLock<[u64; MAX_STAGES]> = SpinLock::new([0; MAX_STAGES]);

/// CPUs currently dedicated to `stage`, for observers.
#[must_use]
pub fn stage_cpus(stage: &Stage) -> CpuSet {
    ASSIGNMENT
        .read()
        .as_ref()
        .map(|a| a.stage_cpus(stage.id()))
        .unwrap_or(CpuSet::EMPTY)
}

/// Recompute requirements from the smoothed backlogs and publish the
/// minimum-cost transition of the current assignment.
///
/// Single caller at a time (the `ASSIGNMENT_UPDATING` latch) and only from
/// a preemptible context.
fn update_assignment() {
    debug_assert!(preemptable());
    let begin = Instant::now();

    let stages = STAGE_COUNT.load(Ordering::Acquire);
    let mut samples = [0i64; MAX_STAGES];
    for (si, sample) in samples.iter_mut().enumerate().take(stages) {
        *sample = STAGES[si].backlog.load(Ordering::Relaxed);
    }

    let (smoothed, total) = {
        let mut ewma = EWMA.lock();
        let total = smooth_loads(&mut ewma, &samples, stages);
        (*ewma, total)
    };

    let reqs = match compute_requirements(&smoothed, total, cpus().len(), stages) {
        Some(reqs) => reqs,
        None => return,
    };

    let mut next = {
        let guard = ASSIGNMENT.read();
        guard
            .as_ref()
            .expect("assignment update before define")
            .as_ref()
            .clone()
    };
    next.transition_to(&reqs);
    *ASSIGNMENT.write() = Some(Arc::new(next));

    log::trace!(
        "assignment updated cpu={} ns={} loads={:?}",
        current_cpu().id(),
        (Instant::now() - begin).as_nanos(),
        &samples[..stages]
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Registry behaviour end to end: ordered ids, round-robin assignment
    /// republished per definition, table-full refusal. One sequential test
    /// because the registry is global.
    #[test]
    fn define_assigns_ids_and_republishes_the_assignment() {
        crate::sched::init(8);

        let a = define("ingest").expect("first stage");
        assert_eq!(a.id(), 0);
        assert_eq!(a.name(), "ingest");
        assert_eq!(stage_cpus(a).len(), 8);

        let b = define("parse").expect("second stage");
        assert_eq!(b.id(), 1);
        // Two stages on eight CPUs: the fresh assignment deals them 4:4,
        // disjoint.
        let (ca, cb) = (stage_cpus(a), stage_cpus(b));
        assert_eq!(ca.len(), 4);
        assert_eq!(cb.len(), 4);
        assert_eq!(ca.bits() & cb.bits(), 0);

        // The backlog counter is a plain saturating signal.
        a.inc_backlog();
        a.inc_backlog();
        a.dec_backlog();
        assert_eq!(a.backlog(), 1);
        a.dec_backlog();

        for i in count()..MAX_STAGES {
            assert!(define("filler").is_some(), "slot {} refused", i);
        }
        assert!(define("overflow").is_none());
        assert_eq!(count(), MAX_STAGES);
    }
}
