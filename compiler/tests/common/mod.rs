// Shared helpers for the simulation-based suites: SSA listing builders and a
// harness that binds kernel arguments from their roles and runs the kernel
// in the simulator.

#![allow(dead_code)]

use std::collections::HashMap;

use kcc::codegen::CodegenOptions;
use kcc::interp::{simulate, LaunchConfig, SimArg, SimOutput, Value};
use kcc::kernel::{launch_geometry, ArgumentRole, GeneratedKernel, LocalSlots};
use kcc::pipeline::compile;

/// `B[i] = B[i] + 1` over `1..=n`: every visit of task `i` bumps one cell.
pub fn bump_listing(schedule: &str, local: u64) -> String {
    format!(
        "\
function bump(B$1, n$1) -> (B$3)
  types {{
    B$1: double[?]
    n$1: int32
    B$2: double[?]
    B$3: double[?]
    B$4: double[?]
    $one: int32(1)
    $inc: double(1.0)
    i$1: int32
    $b: double
    $c: double
  }}
  parallel #0 schedule({schedule}) local_size({local})
  block #0 {{
    B$1 = arg 0
    n$1 = arg 1
    $one = 1
    $inc = 1.0
    for $one, $one, n$1 loop #1 end #2
  }}
  block #1 {{
    B$2 = phi #0:B$1, #1:B$4
    i$1 = iter
    $b = simple_get B$2[i$1]
    $c = call plus($b, $inc)
    B$4 = simple_set B$2[i$1] = $c
  }}
  block #2 {{
    B$3 = phi #0:B$1, #1:B$4
  }}
end
"
    )
}

/// `s = sum(A)` with one scalar reduction.
pub fn sum_listing(schedule: &str, local: u64, strategy: &str) -> String {
    format!(
        "\
function total(A$1, n$1) -> (s$4)
  types {{
    A$1: double[?]
    n$1: int32
    s$1: double(0.0)
    s$2: double
    s$3: double
    s$4: double
    $one: int32(1)
    i$1: int32
    $a: double
  }}
  parallel #0 schedule({schedule}) local_size({local}) strategies({strategy}) reduce sum(s$1 -> s$4)
  block #0 {{
    A$1 = arg 0
    n$1 = arg 1
    s$1 = 0.0
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }}
  block #1 {{
    s$2 = phi #0:s$1, #1:s$3
    i$1 = iter
    $a = simple_get A$1[i$1]
    s$3 = call plus(s$2, $a)
  }}
  block #2 {{
    s$4 = phi #0:s$1, #1:s$3
  }}
end
"
    )
}

/// `B[i, j] = B[i, j] + 1` over a 2-D nest `1..=m` by `1..=n`.
pub fn grid_bump_listing(schedule: &str, local: (u64, u64)) -> String {
    format!(
        "\
function grid(B$1, m$1, n$1) -> (B$3)
  types {{
    B$1: double[?, ?]
    m$1: int32
    n$1: int32
    B$2: double[?, ?]
    B$3: double[?, ?]
    B$4: double[?, ?]
    B$5: double[?, ?]
    B$6: double[?, ?]
    $one: int32(1)
    $inc: double(1.0)
    i$1: int32
    j$1: int32
    $b: double
    $c: double
  }}
  parallel #0, #1 schedule({schedule}) local_size({}, {})
  block #0 {{
    B$1 = arg 0
    m$1 = arg 1
    n$1 = arg 2
    $one = 1
    $inc = 1.0
    for $one, $one, m$1 loop #1 end #2
  }}
  block #1 {{
    B$2 = phi #0:B$1, #4:B$5
    i$1 = iter
    for $one, $one, n$1 loop #3 end #4
  }}
  block #2 {{
    B$3 = phi #0:B$1, #4:B$5
  }}
  block #3 {{
    B$4 = phi #1:B$2, #3:B$6
    j$1 = iter
    $b = simple_get B$4[i$1, j$1]
    $c = call plus($b, $inc)
    B$6 = simple_set B$4[i$1, j$1] = $c
  }}
  block #4 {{
    B$5 = phi #1:B$2, #3:B$6
  }}
end
",
        local.0, local.1
    )
}

/// `R[i] = sum(A[i, :])`: a parallel outer loop around a sequential sum that
/// cooperative schedules distribute over the lanes of a group.
pub fn row_sums_listing(schedule: &str, local: u64, local_strategy: &str) -> String {
    format!(
        "\
function rows(A$1, m$1, n$1) -> (R$3)
  types {{
    A$1: double[?, ?]
    m$1: int32
    n$1: int32
    R$1: double[?]
    R$2: double[?]
    R$3: double[?]
    R$4: double[?]
    s$1: double(0.0)
    s$2: double
    s$3: double
    s$4: double
    $one: int32(1)
    i$1: int32
    j$1: int32
    $a: double
  }}
  parallel #0 schedule({schedule}) local_size({local}) local_strategies({local_strategy})
  block #0 {{
    A$1 = arg 0
    m$1 = arg 1
    n$1 = arg 2
    R$1 = call zeros(m$1)
    $one = 1
    for $one, $one, m$1 loop #1 end #2
  }}
  block #1 {{
    R$2 = phi #0:R$1, #1:R$4
    i$1 = iter
    s$1 = 0.0
    for $one, $one, n$1 loop #3 end #4
  }}
  block #2 {{
    R$3 = phi #0:R$1, #1:R$4
  }}
  block #3 {{
    s$2 = phi #1:s$1, #3:s$3
    j$1 = iter
    $a = simple_get A$1[i$1, j$1]
    s$3 = call plus(s$2, $a)
  }}
  block #4 {{
    s$4 = phi #1:s$1, #3:s$3
    R$4 = simple_set R$2[i$1] = s$4
  }}
end
"
    )
}

/// Schedule clause for `kind`, with `param` where the kind takes one.
pub fn schedule_clause(kind: &str, param: u64) -> String {
    match kind {
        "coarse_sequential"
        | "coarse_rotation"
        | "fixed_work_groups_sequential"
        | "fixed_work_groups_rotation" => format!("{kind}, {param}"),
        _ => kind.to_string(),
    }
}

pub fn generate(source: &str, options: &CodegenOptions) -> GeneratedKernel {
    let result = kcc::parser::parse(source);
    assert!(result.errors.is_empty(), "parse errors: {:?}\n{source}", result.errors);
    let program = result.program.unwrap();
    let mut out = compile(&program, options).unwrap_or_else(|e| panic!("{e}\n{source}"));
    assert_eq!(out.kernels.len(), 1);
    out.kernels.remove(0)
}

/// Host-side values of one launch, keyed by SSA base name. Buffers are
/// column-major; a buffer without an entry in `shapes` is a vector.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub buffers: HashMap<String, Vec<f64>>,
    pub shapes: HashMap<String, Vec<usize>>,
    pub scalars: HashMap<String, i64>,
}

impl Inputs {
    fn scalar(&self, source: &str) -> i64 {
        *self
            .scalars
            .get(base(source))
            .unwrap_or_else(|| panic!("no scalar for `{source}`"))
    }

    fn dim(&self, source: &str, dim: usize, len: usize) -> usize {
        match self.shapes.get(base(source)) {
            Some(shape) => shape[dim],
            None if dim == 0 => len,
            None => 1,
        }
    }
}

fn base(ssa: &str) -> &str {
    ssa.split('$').next().unwrap_or(ssa)
}

pub struct Launch {
    pub output: SimOutput,
    pub global: Vec<u64>,
    pub local: Vec<u64>,
}

/// Run `kernel` with its planned geometry. The task count of each dimension
/// is the host scalar bound to its `num_tasks` argument (loops start at 1
/// with unit step).
pub fn run(kernel: &GeneratedKernel, inputs: &Inputs, sub_group_size: u32) -> Launch {
    let mut tasks = vec![0u64; kernel.local_sizes.len()];
    for arg in &kernel.arguments {
        if let ArgumentRole::NumTasks { dim } = arg.role {
            tasks[dim] = inputs.scalar(&arg.source) as u64;
        }
    }
    let local: Vec<u64> = kernel
        .local_sizes
        .iter()
        .map(|s| s.constant().expect("constant local size"))
        .collect();
    let params: Vec<u64> = kernel.params.iter().map(|p| p.constant().unwrap_or(1)).collect();
    let global = launch_geometry(kernel.schedule, &tasks, &local, &params);
    let items: u64 = global.iter().product();
    let groups: u64 = global.iter().zip(&local).map(|(g, l)| g / l).product();
    let per_group: u64 = local.iter().product();

    let mut args = Vec::new();
    for arg in &kernel.arguments {
        let buffer = || {
            inputs
                .buffers
                .get(base(&arg.source))
                .unwrap_or_else(|| panic!("no buffer for `{}`", arg.source))
        };
        args.push(match &arg.role {
            ArgumentRole::Data => SimArg::floats(buffer()),
            ArgumentRole::Numel => SimArg::int(buffer().len() as i64),
            ArgumentRole::Dim { dim } => {
                SimArg::int(inputs.dim(&arg.source, *dim, buffer().len()) as i64)
            }
            ArgumentRole::Value => SimArg::int(inputs.scalar(&arg.source)),
            ArgumentRole::NumTasks { dim } => SimArg::int(tasks[*dim] as i64),
            ArgumentRole::GlobalPerWorkItemBuffer { .. } => SimArg::zeros(items as usize),
            ArgumentRole::GlobalPerWorkGroupBuffer { .. } => SimArg::zeros(groups as usize),
            ArgumentRole::LocalReductionBuffer { slots, .. } => SimArg::Local(match slots {
                LocalSlots::One => 1,
                LocalSlots::SubGroups => (per_group / u64::from(sub_group_size)).max(1) as usize,
                LocalSlots::LocalSize => per_group as usize,
            }),
        });
    }

    let launch =
        LaunchConfig::new(global.clone(), local.clone()).with_sub_group_size(sub_group_size);
    let output = simulate(&kernel.function, &launch, args).unwrap_or_else(|e| panic!("{e}"));
    Launch {
        output,
        global,
        local,
    }
}

/// Name of the first argument with a reduction buffer role in global memory.
pub fn partial_buffer(kernel: &GeneratedKernel) -> String {
    kernel
        .arguments
        .iter()
        .find(|a| {
            matches!(
                a.role,
                ArgumentRole::GlobalPerWorkItemBuffer { .. }
                    | ArgumentRole::GlobalPerWorkGroupBuffer { .. }
            )
        })
        .map(|a| a.name.clone())
        .expect("kernel has a global reduction buffer")
}

/// What the launcher does after the kernel: fold the partials into the
/// initial value.
pub fn finalize_sum(kernel: &GeneratedKernel, launch: &Launch, initial: f64) -> f64 {
    let partials = launch
        .output
        .floats(&partial_buffer(kernel))
        .expect("partials written");
    partials.iter().fold(initial, |acc, v| acc + v)
}

pub fn values(output: &SimOutput, name: &str) -> Vec<Value> {
    output.globals.get(name).cloned().unwrap_or_default()
}

pub fn sum_inputs(contributions: &[f64]) -> Inputs {
    Inputs {
        buffers: [("A".to_string(), contributions.to_vec())].into(),
        scalars: [("n".to_string(), contributions.len() as i64)].into(),
        ..Inputs::default()
    }
}

pub fn bump_inputs(n: usize) -> Inputs {
    Inputs {
        buffers: [("B".to_string(), vec![0.0; n])].into(),
        scalars: [("n".to_string(), n as i64)].into(),
        ..Inputs::default()
    }
}

pub fn grid_inputs(m: usize, n: usize) -> Inputs {
    Inputs {
        buffers: [("B".to_string(), vec![0.0; m * n])].into(),
        shapes: [("B".to_string(), vec![m, n])].into(),
        scalars: [("m".to_string(), m as i64), ("n".to_string(), n as i64)].into(),
    }
}

/// Element `(i, j)` of the row-sum input, 0-based.
pub fn row_sums_element(i: usize, j: usize) -> f64 {
    (i * 10 + j + 1) as f64 * 0.5
}

pub fn row_sums_inputs(m: usize, n: usize) -> Inputs {
    let mut a = Vec::with_capacity(m * n);
    for j in 0..n {
        for i in 0..m {
            a.push(row_sums_element(i, j));
        }
    }
    Inputs {
        buffers: [("A".to_string(), a), ("R".to_string(), vec![0.0; m])].into(),
        shapes: [("A".to_string(), vec![m, n])].into(),
        scalars: [("m".to_string(), m as i64), ("n".to_string(), n as i64)].into(),
    }
}

pub fn expected_row_sums(m: usize, n: usize) -> Vec<f64> {
    (0..m).map(|i| (0..n).map(|j| row_sums_element(i, j)).sum()).collect()
}
