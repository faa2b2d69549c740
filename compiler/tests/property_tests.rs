// Property-based tests for compiler invariants.
//
// Three categories:
// 1. Parallel-copy sequentialization matches a simultaneous-copy evaluator
// 2. Every schedule visits each task id exactly once (simulated)
// 3. Sum reductions fold to the exact total (simulated)
//
// Uses proptest with explicit configuration to prevent CI flakiness.

mod common;

use std::collections::{HashMap, HashSet};

use common::*;
use kcc::codegen::CodegenOptions;
use kcc::seqcopy::sequentialize;
use proptest::prelude::*;

// ── Sequentializer ──────────────────────────────────────────────────────────

/// Copies over a small variable pool with pairwise distinct destinations;
/// sources are unconstrained, so cycles, fan-out and self copies all occur.
fn arb_copies() -> impl Strategy<Value = Vec<(u8, u8)>> {
    proptest::collection::vec((0u8..8, 0u8..8), 0..12).prop_map(|pairs| {
        let mut seen = HashSet::new();
        pairs.into_iter().filter(|(dst, _)| seen.insert(*dst)).collect()
    })
}

fn simultaneous(copies: &[(u8, u8)], env: &HashMap<u8, i64>) -> HashMap<u8, i64> {
    let mut out = env.clone();
    for (dst, src) in copies {
        out.insert(*dst, env[src]);
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn sequential_replay_matches_simultaneous_copy(copies in arb_copies()) {
        let mut env: HashMap<u8, i64> = (0u8..8).map(|v| (v, i64::from(v) * 10)).collect();
        let reference = simultaneous(&copies, &env);

        let mut next_temp = 100u8;
        let seq = sequentialize(&copies, || {
            next_temp += 1;
            next_temp
        });
        for (dst, src) in &seq {
            prop_assert_ne!(dst, src);
            let value = env[src];
            env.insert(*dst, value);
        }
        for v in 0u8..8 {
            prop_assert_eq!(env[&v], reference[&v], "variable {} after {:?}", v, seq);
        }
    }
}

// ── Simulated schedules ─────────────────────────────────────────────────────

const SCHEDULES: [&str; 7] = [
    "direct",
    "cooperative",
    "subgroup_cooperative",
    "coarse_sequential",
    "coarse_rotation",
    "fixed_work_groups_sequential",
    "fixed_work_groups_rotation",
];

fn sub_group_size(local: u64) -> u32 {
    if local >= 2 {
        2
    } else {
        1
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_task_is_visited_once(
        schedule in 0usize..SCHEDULES.len(),
        n in 1usize..40,
        local in prop_oneof![Just(1u64), Just(2), Just(4), Just(8)],
        param in 1u64..4,
    ) {
        let clause = schedule_clause(SCHEDULES[schedule], param);
        let kernel = generate(&bump_listing(&clause, local), &CodegenOptions::default());
        let launch = run(&kernel, &bump_inputs(n), sub_group_size(local));
        let visits = launch.output.floats("B").unwrap();
        prop_assert_eq!(visits, vec![1.0; n], "{} with local size {}", clause, local);
    }

    #[test]
    fn sum_reduction_is_exact(
        schedule in prop_oneof![
            Just("direct"),
            Just("coarse_sequential"),
            Just("coarse_rotation"),
            Just("fixed_work_groups_sequential"),
            Just("fixed_work_groups_rotation"),
        ],
        strategy in prop_oneof![
            Just("per_work_item"),
            Just("local_memory"),
            Just("work_group_builtin"),
        ],
        halves in proptest::collection::vec(-40i32..40, 1..30),
        local in prop_oneof![Just(1u64), Just(2), Just(4)],
        param in 1u64..4,
    ) {
        let values: Vec<f64> = halves.iter().map(|h| f64::from(*h) * 0.5).collect();
        let expected: f64 = values.iter().sum();
        let clause = schedule_clause(schedule, param);
        let kernel = generate(&sum_listing(&clause, local, strategy), &CodegenOptions::default());
        let launch = run(&kernel, &sum_inputs(&values), 1);
        prop_assert_eq!(finalize_sum(&kernel, &launch, 0.0), expected);
    }
}
