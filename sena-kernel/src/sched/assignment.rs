//! Stage-to-CPU Assignment Engine
//!
//! Two phases. Phase 1 turns smoothed per-stage backlogs into integer CPU
//! requirements proportional to load: floor-allocate by priority, then use
//! the remainders as the priorities for the still-unassigned CPUs, merging
//! the weakest priority into the strongest whenever no stage is dominant
//! enough to win a whole CPU. Phase 2 morphs the previous CPU sets into
//! ones satisfying the new requirements while moving as few CPUs as
//! possible: only stages whose requirement shrank give CPUs up, and only
//! to stages whose requirement grew.
//!
//! Fractions use Q32 fixed point; all arithmetic is exact and
//! deterministic.

use super::cpu_set::CpuSet;
use super::stage::MAX_STAGES;

/// Q32: 32 fractional bits.
const FRAC_BITS: u32 = 32;
const FRAC_MASK: u64 = (1 << FRAC_BITS) - 1;

/// Exponential smoothing of the raw backlog samples, `α = 1/10`:
/// `ewma ← (9·ewma + sample)/10`, all in Q32.
pub(crate) fn smooth_loads(
    ewma: &mut [u64; MAX_STAGES],
    samples: &[i64; MAX_STAGES],
    stages: usize,
) -> u64 {
    let mut total: u64 = 0;
    for si in 0..stages {
        let sample_q = (samples[si].max(0) as u64) << FRAC_BITS;
        let next = ((9u128 * ewma[si] as u128 + sample_q as u128) / 10) as u64;
        ewma[si] = next;
        total = total.saturating_add(next);
    }
    total
}

/// Phase 1: distribute `cpus` CPUs over `stages` stages proportionally to
/// the smoothed loads. Returns `None` when there is no load at all.
///
/// It is acceptable for a stage to end up with no CPU.
pub(crate) fn compute_requirements(
    smoothed: &[u64; MAX_STAGES],
    total_load: u64,
    cpus: usize,
    stages: usize,
) -> Option<[i32; MAX_STAGES]> {
    if total_load == 0 {
        return None;
    }

    let mut reqs = [0i32; MAX_STAGES];

    // First round of priorities is proportional to the smoothed load.
    // Round to nearest: truncation would rob every stage of up to one ulp
    // and skew exact splits.
    let mut sp = [0u64; MAX_STAGES];
    for si in 0..stages {
        sp[si] = ((((smoothed[si] as u128) << FRAC_BITS) + total_load as u128 / 2)
            / total_load as u128) as u64;
    }

    let mut cpus_left = cpus as u64;
    while cpus_left > 0 {
        let mut remainders = [0u64; MAX_STAGES];
        let cpus_assigned;
        let total_remainders;
        loop {
            let mut assigned: u64 = 0;
            let mut rem_total: u64 = 0;
            for si in 0..stages {
                let fp = cpus_left as u128 * sp[si] as u128;
                let whole = (fp >> FRAC_BITS) as u64;
                let rem = fp as u64 & FRAC_MASK;
                remainders[si] = rem;
                rem_total += rem;
                reqs[si] += whole as i32;
                assigned += whole;
            }
            if assigned > 0 {
                cpus_assigned = assigned;
                total_remainders = rem_total;
                break;
            }

            // No stage is dominant enough to win a whole CPU. Give the
            // weakest stage's priority to the strongest, iteratively: with
            // more than one CPU left this converges to a fairer split than
            // crowning a single winner outright.
            debug_assert!(stages >= 2);
            let mut max_idx = 0;
            for si in 1..stages {
                if sp[si] > sp[max_idx] {
                    max_idx = si;
                }
            }
            // Rightmost nonzero minimum, so repeated merges sweep from the
            // tail toward the head.
            let mut min_idx = stages - 1;
            for si in (0..stages - 1).rev() {
                if sp[min_idx] == 0 || (sp[si] != 0 && sp[si] < sp[min_idx]) {
                    min_idx = si;
                }
            }
            if min_idx == max_idx {
                // Everything else merged away; one stage holds the whole
                // priority and the last CPU goes to it.
                debug_assert_eq!(cpus_left, 1);
                reqs[max_idx] += 1;
                cpus_assigned = 1;
                total_remainders = 0;
                break;
            }
            sp[max_idx] += sp[min_idx];
            sp[min_idx] = 0;
        }

        debug_assert!(cpus_assigned <= cpus_left);
        cpus_left -= cpus_assigned;

        if cpus_left == 0 {
            break;
        }

        if total_remainders == 0 {
            // Truncation left unassignable CPUs with no fractional claim
            // anywhere; hand them to the strongest stage to terminate.
            let mut max_idx = 0;
            for si in 1..stages {
                if reqs[si] > reqs[max_idx] {
                    max_idx = si;
                }
            }
            reqs[max_idx] += cpus_left as i32;
            cpus_left = 0;
            break;
        }

        // CPUs are indivisible, so the fractional losses become the
        // priorities for the remaining CPUs.
        for si in 0..stages {
            sp[si] = ((((remainders[si] as u128) << FRAC_BITS) + total_remainders as u128 / 2)
                / total_remainders as u128) as u64;
        }
    }
    debug_assert_eq!(cpus_left, 0);
    debug_assert_eq!(
        reqs[..stages].iter().map(|r| *r as i64).sum::<i64>(),
        cpus as i64
    );

    Some(reqs)
}

/// A published snapshot: which CPUs serve which stage, plus the integer
/// requirement the sets satisfy.
///
/// Invariant: the per-stage sets are pairwise disjoint and their sizes sum
/// to the CPU count.
#[derive(Clone)]
pub(crate) struct Assignment {
    reqs: [i32; MAX_STAGES],
    cpus_per_stage: [CpuSet; MAX_STAGES],
    cpus: usize,
    stages: usize,
}

impl Assignment {
    /// The initial assignment: CPUs dealt round-robin across the stages.
    pub(crate) fn initial(cpus: usize, stages: usize) -> Self {
        assert!(stages >= 1);
        assert!(stages <= cpus, "more stages than CPUs");
        let mut a = Self {
            reqs: [0; MAX_STAGES],
            cpus_per_stage: [CpuSet::EMPTY; MAX_STAGES],
            cpus,
            stages,
        };
        for c in 0..cpus {
            a.reqs[c % stages] += 1;
            a.cpus_per_stage[c % stages].set(c);
        }
        a.validate(&a.reqs);
        a
    }

    pub(crate) fn stage_cpus(&self, stage: usize) -> CpuSet {
        self.cpus_per_stage[stage]
    }

    fn validate(&self, reqs: &[i32; MAX_STAGES]) {
        let mut sum: i64 = 0;
        for si in 0..self.stages {
            assert!(reqs[si] >= 0);
            sum += reqs[si] as i64;
        }
        assert_eq!(sum, self.cpus as i64);
    }

    /// Phase 2: satisfy `new_reqs`, leaving as many CPUs untouched as
    /// possible. Requires `Σ new_reqs = Σ reqs` (phase 1 guarantees it).
    pub(crate) fn transition_to(&mut self, new_reqs: &[i32; MAX_STAGES]) {
        self.validate(new_reqs);

        let mut delta = [0i32; MAX_STAGES];
        let mut delta_total: i64 = 0;
        for si in 0..self.stages {
            delta[si] = new_reqs[si] - self.reqs[si];
            delta_total += delta[si] as i64;
        }
        // The transfer walk below only terminates when gains and losses
        // cancel exactly.
        assert_eq!(delta_total, 0);

        for si in 0..self.stages {
            if delta[si] == 0 {
                continue;
            }
            for isi in si..self.stages {
                let tx = delta[isi].abs().min(delta[si].abs());
                if delta[isi] < 0 && delta[si] > 0 {
                    delta[si] -= tx;
                    delta[isi] += tx;
                    self.transfer_cpus(isi, si, tx as usize);
                    debug_assert!(delta[isi] <= 0);
                    debug_assert!(delta[si] >= 0);
                } else if delta[isi] > 0 && delta[si] < 0 {
                    delta[si] += tx;
                    delta[isi] -= tx;
                    self.transfer_cpus(si, isi, tx as usize);
                    debug_assert!(delta[isi] >= 0);
                    debug_assert!(delta[si] <= 0);
                }
            }
            assert_eq!(delta[si], 0);
        }
        self.reqs = *new_reqs;
    }

    fn transfer_cpus(&mut self, from: usize, to: usize, mut amount: usize) {
        let from_set = self.cpus_per_stage[from];
        for c in from_set.iter() {
            if amount == 0 {
                break;
            }
            if !self.cpus_per_stage[to].test_and_set(c) {
                self.cpus_per_stage[from].clear(c);
            }
            amount -= 1;
        }
        assert_eq!(amount, 0, "donor stage ran out of CPUs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loads(v: &[i64]) -> [i64; MAX_STAGES] {
        let mut out = [0i64; MAX_STAGES];
        out[..v.len()].copy_from_slice(v);
        out
    }

    /// Run smoothing until the EWMA has converged on a steady input.
    fn converge(ewma: &mut [u64; MAX_STAGES], samples: &[i64; MAX_STAGES], stages: usize) -> u64 {
        let mut total = 0;
        for _ in 0..200 {
            total = smooth_loads(ewma, samples, stages);
        }
        total
    }

    fn check_invariants(a: &Assignment) {
        let mut seen = CpuSet::EMPTY;
        let mut count = 0;
        for si in 0..a.stages {
            for c in a.stage_cpus(si).iter() {
                assert!(!seen.test_and_set(c), "cpu {} in two stages", c);
                count += 1;
            }
            assert_eq!(a.stage_cpus(si).len() as i32, a.reqs[si]);
        }
        assert_eq!(count, a.cpus);
    }

    #[test]
    fn initial_assignment_is_round_robin() {
        let a = Assignment::initial(4, 2);
        check_invariants(&a);
        assert_eq!(a.stage_cpus(0).len(), 2);
        assert_eq!(a.stage_cpus(1).len(), 2);
    }

    #[test]
    fn one_loaded_stage_takes_every_cpu() {
        let mut ewma = [0u64; MAX_STAGES];
        let total = converge(&mut ewma, &loads(&[100, 0]), 2);
        let reqs = compute_requirements(&ewma, total, 4, 2).unwrap();
        assert_eq!(&reqs[..2], &[4, 0]);
    }

    #[test]
    fn equal_loads_split_evenly() {
        let mut ewma = [0u64; MAX_STAGES];
        let total = converge(&mut ewma, &loads(&[50, 50]), 2);
        let reqs = compute_requirements(&ewma, total, 4, 2).unwrap();
        assert_eq!(&reqs[..2], &[2, 2]);
    }

    #[test]
    fn zero_total_load_aborts_the_update() {
        let ewma = [0u64; MAX_STAGES];
        assert!(compute_requirements(&ewma, 0, 4, 2).is_none());
    }

    #[test]
    fn requirements_always_sum_to_the_cpu_count() {
        let cases: &[&[i64]] = &[
            &[1, 1, 1, 1],
            &[7, 3],
            &[1, 0, 0, 9],
            &[13, 17, 5],
            &[1000, 1],
        ];
        for case in cases {
            let mut ewma = [0u64; MAX_STAGES];
            let total = converge(&mut ewma, &loads(case), case.len());
            for cpus in [case.len(), 4, 8, 64] {
                if cpus < case.len() {
                    continue;
                }
                let reqs = compute_requirements(&ewma, total, cpus, case.len()).unwrap();
                let sum: i64 = reqs[..case.len()].iter().map(|r| *r as i64).sum();
                assert_eq!(sum, cpus as i64, "case {:?} cpus {}", case, cpus);
                assert!(reqs[..case.len()].iter().all(|r| *r >= 0));
            }
        }
    }

    /// Four equal stages on two CPUs: the iterative merge must spread the
    /// CPUs over two stages rather than crowning a single winner.
    #[test]
    fn priority_merge_keeps_the_split_fair() {
        let mut ewma = [0u64; MAX_STAGES];
        let total = converge(&mut ewma, &loads(&[10, 10, 10, 10]), 4);
        let reqs = compute_requirements(&ewma, total, 2, 4).unwrap();
        assert_eq!(reqs[..4].iter().filter(|r| **r == 1).count(), 2);
        assert_eq!(reqs[..4].iter().sum::<i32>(), 2);
    }

    #[test]
    fn transition_moves_no_cpu_when_requirements_hold() {
        let mut a = Assignment::initial(4, 2);
        let before = [a.stage_cpus(0), a.stage_cpus(1)];
        let reqs = {
            let mut r = [0i32; MAX_STAGES];
            r[0] = 2;
            r[1] = 2;
            r
        };
        a.transition_to(&reqs);
        assert_eq!(a.stage_cpus(0), before[0]);
        assert_eq!(a.stage_cpus(1), before[1]);
        check_invariants(&a);
    }

    #[test]
    fn transition_moves_only_the_delta() {
        let mut a = Assignment::initial(4, 2);
        let s0_before = a.stage_cpus(0);
        let mut reqs = [0i32; MAX_STAGES];
        reqs[0] = 3;
        reqs[1] = 1;
        a.transition_to(&reqs);
        check_invariants(&a);
        // Stage 0 kept both of its CPUs and gained exactly one.
        assert_eq!(a.stage_cpus(0).len(), 3);
        for c in s0_before.iter() {
            assert!(a.stage_cpus(0).test(c));
        }
    }

    /// The load-flip scenario: all CPUs follow the backlog from one stage
    /// to the other within a bounded number of update rounds.
    #[test]
    fn load_flip_reassigns_all_cpus_within_bounded_rounds() {
        let cpus = 4;
        let stages = 2;
        let mut ewma = [0u64; MAX_STAGES];
        let mut a = Assignment::initial(cpus, stages);

        let mut drive =
            |ewma: &mut [u64; MAX_STAGES], a: &mut Assignment, sample: &[i64], target: usize| {
                for round in 1..=100 {
                    let total = smooth_loads(ewma, &loads(sample), stages);
                    if let Some(reqs) = compute_requirements(ewma, total, cpus, stages) {
                        a.transition_to(&reqs);
                    }
                    check_invariants(a);
                    if a.stage_cpus(target).len() == cpus {
                        return round;
                    }
                }
                100
            };

        let rounds = drive(&mut ewma, &mut a, &[100, 0], 0);
        assert!(rounds < 100, "stage 0 never absorbed all CPUs");
        assert_eq!(a.stage_cpus(0).len(), cpus);

        let rounds = drive(&mut ewma, &mut a, &[0, 100], 1);
        assert!(rounds < 100, "stage 1 never absorbed all CPUs");
        assert_eq!(a.stage_cpus(1).len(), cpus);
    }

    #[test]
    fn smoothing_tracks_a_step_input() {
        let mut ewma = [0u64; MAX_STAGES];
        smooth_loads(&mut ewma, &loads(&[100]), 1);
        // One step of α = 0.1 from zero: exactly 10 in Q32.
        assert_eq!(ewma[0] >> 32, 10);
        let total = converge(&mut ewma, &loads(&[100]), 1);
        assert_eq!(total >> 32, 99);
    }
}
