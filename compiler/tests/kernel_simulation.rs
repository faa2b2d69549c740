// Simulation tests: generated kernels executed work-item by work-item.
//
// Three properties of generated code:
// - every schedule visits each logical task id exactly once, in 1-D and 2-D
// - a sum reduction over K work-items yields the exact sum of the
//   contributions after the launcher folds the partials, for K in {1, 2, 17}
// - every local reduction strategy combines the lanes of a cooperative task
//   into the exact row sum

mod common;

use common::*;
use kcc::codegen::CodegenOptions;
use kcc::kernel::ClVersion;
use kcc::schedule::ScheduleKind;

// ── Task coverage ───────────────────────────────────────────────────────────

fn assert_each_task_once(
    schedule: &str,
    local: u64,
    n: usize,
    options: &CodegenOptions,
    sub_group_size: u32,
) {
    let kernel = generate(&bump_listing(schedule, local), options);
    let launch = run(&kernel, &bump_inputs(n), sub_group_size);
    let visits = launch.output.floats("B").expect("B written back");
    assert_eq!(visits.len(), n);
    for (task, count) in visits.iter().enumerate() {
        assert_eq!(
            *count, 1.0,
            "schedule {schedule}: task {task} visited {count} times (global {:?}, local {:?})",
            launch.global, launch.local
        );
    }
}

#[test]
fn direct_covers_every_task() {
    let options = CodegenOptions::default();
    assert_each_task_once("direct", 8, 29, &options, 4);
    assert_each_task_once("direct", 4, 32, &options, 4);
}

#[test]
fn coarse_schedules_cover_every_task() {
    let options = CodegenOptions::default();
    for kind in ["coarse_sequential", "coarse_rotation"] {
        assert_each_task_once(&schedule_clause(kind, 3), 4, 37, &options, 4);
        assert_each_task_once(&schedule_clause(kind, 1), 2, 5, &options, 2);
    }
}

#[test]
fn fixed_work_group_schedules_cover_every_task() {
    let options = CodegenOptions::default();
    for kind in ["fixed_work_groups_sequential", "fixed_work_groups_rotation"] {
        assert_each_task_once(&schedule_clause(kind, 2), 4, 41, &options, 4);
        // More work-items than tasks.
        assert_each_task_once(&schedule_clause(kind, 3), 8, 5, &options, 4);
    }
}

#[test]
fn cooperative_group_visits_each_task_once() {
    let kernel = generate(&bump_listing("cooperative", 4), &CodegenOptions::default());
    assert_eq!(kernel.schedule, ScheduleKind::Cooperative);
    let launch = run(&kernel, &bump_inputs(10), 4);
    assert_eq!(launch.output.floats("B").unwrap(), vec![1.0; 10]);
}

#[test]
fn hardware_subgroups_visit_each_task_once() {
    let kernel = generate(&bump_listing("subgroup_cooperative", 8), &CodegenOptions::default());
    assert_eq!(kernel.version, ClVersion::V2_0);
    let launch = run(&kernel, &bump_inputs(19), 4);
    assert_eq!(launch.output.floats("B").unwrap(), vec![1.0; 19]);
}

#[test]
fn emulated_subgroups_visit_each_task_once() {
    let options = CodegenOptions {
        warp_fallback: true,
        sub_group_size: 4,
        ..CodegenOptions::default()
    };
    let kernel = generate(&bump_listing("subgroup_cooperative", 8), &options);
    assert_eq!(kernel.version, ClVersion::V1_0);
    let launch = run(&kernel, &bump_inputs(13), 4);
    assert_eq!(launch.output.floats("B").unwrap(), vec![1.0; 13]);
}

#[test]
fn two_dimensional_nests_cover_every_cell() {
    let options = CodegenOptions::default();
    let clauses = [
        "direct".to_string(),
        "coarse_sequential, 2, 3".to_string(),
        "coarse_rotation, 3, 2".to_string(),
        "fixed_work_groups_sequential, 2, 2".to_string(),
        "fixed_work_groups_rotation, 1, 3".to_string(),
    ];
    for clause in &clauses {
        for (m, n) in [(1, 1), (5, 3), (2, 9), (7, 7)] {
            let kernel = generate(&grid_bump_listing(clause, (2, 2)), &options);
            assert_eq!(kernel.local_sizes.len(), 2);
            let launch = run(&kernel, &grid_inputs(m, n), 4);
            assert_eq!(
                launch.output.floats("B").unwrap(),
                vec![1.0; m * n],
                "{clause} over {m}x{n} (global {:?}, local {:?})",
                launch.global,
                launch.local
            );
        }
    }
}

// ── Reductions ──────────────────────────────────────────────────────────────

fn contributions(k: usize) -> Vec<f64> {
    (0..k).map(|i| (i + 1) as f64 * 0.5).collect()
}

fn assert_exact_sum(schedule: &str, local: u64, strategy: &str, k: usize) {
    let values = contributions(k);
    let expected: f64 = values.iter().sum();
    let kernel = generate(&sum_listing(schedule, local, strategy), &CodegenOptions::default());
    assert_eq!(kernel.reductions[0].strategy, strategy);
    let launch = run(&kernel, &sum_inputs(&values), 4);
    let total = finalize_sum(&kernel, &launch, 0.0);
    assert_eq!(total, expected, "{strategy} with {k} work-items under {schedule}");
}

#[test]
fn per_work_item_partials_sum_exactly() {
    for k in [1, 2, 17] {
        assert_exact_sum("direct", k as u64, "per_work_item", k);
        assert_exact_sum("direct", 1, "per_work_item", k);
    }
}

#[test]
fn local_memory_partials_sum_exactly() {
    for k in [1, 2, 17] {
        assert_exact_sum("direct", k as u64, "local_memory", k);
        assert_exact_sum("direct", 4, "local_memory", k);
    }
}

#[test]
fn work_group_builtin_partials_sum_exactly() {
    for k in [1, 2, 17] {
        assert_exact_sum("direct", k as u64, "work_group_builtin", k);
    }
}

#[test]
fn cooperative_reduction_counts_each_task_once() {
    for k in [1, 2, 17] {
        assert_exact_sum("cooperative", 4, "local_memory", k);
    }
}

#[test]
fn coarse_reduction_accumulates_across_tasks() {
    for k in [1, 2, 17] {
        assert_exact_sum("coarse_sequential, 3", 2, "per_work_item", k);
        assert_exact_sum("fixed_work_groups_rotation, 2", 2, "local_memory", k);
    }
}

#[test]
fn initial_value_is_folded_by_the_launcher_only() {
    let values = contributions(5);
    let kernel = generate(&sum_listing("direct", 2, "per_work_item"), &CodegenOptions::default());
    let launch = run(&kernel, &sum_inputs(&values), 4);
    // Padding work-items contribute the identity.
    assert_eq!(launch.global, vec![6]);
    let partials = launch.output.floats(&partial_buffer(&kernel)).unwrap();
    assert_eq!(partials[5], 0.0);
    assert_eq!(finalize_sum(&kernel, &launch, 10.0), 10.0 + 7.5);
}

// ── Local reductions ────────────────────────────────────────────────────────

const ROW_SHAPES: [(usize, usize); 5] = [(1, 1), (3, 1), (1, 2), (6, 3), (2, 17)];

fn assert_row_sums(
    schedule: &str,
    local: u64,
    strategy: &str,
    options: &CodegenOptions,
    sub_group_size: u32,
) {
    let kernel = generate(&row_sums_listing(schedule, local, strategy), options);
    assert_eq!(kernel.schedule.name(), schedule);
    for (m, n) in ROW_SHAPES {
        let launch = run(&kernel, &row_sums_inputs(m, n), sub_group_size);
        assert_eq!(
            launch.output.floats("R").unwrap(),
            expected_row_sums(m, n),
            "{strategy} under {schedule} over {m}x{n}"
        );
    }
}

#[test]
fn simple_local_fold_sums_rows() {
    assert_row_sums("cooperative", 4, "simple", &CodegenOptions::default(), 4);
    assert_row_sums("cooperative", 3, "simple", &CodegenOptions::default(), 4);
}

#[test]
fn interleaved_tree_sums_rows() {
    assert_row_sums("cooperative", 4, "interleaved", &CodegenOptions::default(), 4);
    assert_row_sums("cooperative", 1, "interleaved", &CodegenOptions::default(), 4);
}

#[test]
fn sub_group_builtin_sums_rows() {
    assert_row_sums("subgroup_cooperative", 8, "sub_group_builtin", &CodegenOptions::default(), 4);
}

#[test]
fn warp_local_memory_sums_rows() {
    let options = CodegenOptions {
        warp_fallback: true,
        sub_group_size: 4,
        ..CodegenOptions::default()
    };
    assert_row_sums("subgroup_cooperative", 8, "warp_local_memory", &options, 4);
}
