// Snapshot tests: lock emitted C and OpenCL text to detect unintended
// behavior changes.
//
// Uses the library API (parse → compile → render) directly. Snapshots are
// inline `insta` snapshots; run `cargo insta review` after intentional
// output changes to update them.

use std::fmt::Write as _;
use std::path::Path;

use kcc::codegen::{render_signature, CodegenOptions, Target};
use kcc::pipeline::{compile, CompileOutput};

fn compile_fixture(name: &str, options: &CodegenOptions) -> CompileOutput {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    let source = std::fs::read_to_string(path).unwrap();
    let result = kcc::parser::parse(&source);
    assert!(result.errors.is_empty(), "parse errors: {:?}", result.errors);
    compile(&result.program.unwrap(), options).unwrap()
}

#[test]
fn snapshot_sequential_c_unit() {
    let out = compile_fixture("sequential.ssa", &CodegenOptions::default());
    insta::assert_snapshot!(out.c_source, @r###"
#include "kcc_runtime.h"

double total(int32_t n);

double total(int32_t n) {
    double acc;
    int32_t i;
    double x;
    acc = 0.0;
    for (i = 1; i <= n; i++) {
        x = i;
        acc = acc + x;
    }
    return acc;
}
"###);
}

#[test]
fn snapshot_sum_kernel_interface() {
    let out = compile_fixture("sum.ssa", &CodegenOptions::default());
    let kernel = out.kernel("total_0").unwrap();
    let mut text = String::new();
    let _ = writeln!(text, "{}", render_signature(&kernel.function, Target::OpenCl));
    let _ = writeln!(text, "{}", render_signature(&kernel.launch.prototype, Target::C));
    for arg in &kernel.arguments {
        let _ = writeln!(text, "{} <- {}: {}", arg.name, arg.source, arg.c_type);
    }
    insta::assert_snapshot!(text, @r###"
__kernel __attribute__((reqd_work_group_size(128, 1, 1))) void total_0(__global double* A, ulong A_numel, ulong A_dim1, ulong num_tasks0, __global double* s_partial)
void total_0_launch(double* A, size_t A_numel, size_t A_dim1, size_t num_tasks0, double s_initial, double* s_result)
A <- A$1: __global double*
A_numel <- A$1: ulong
A_dim1 <- A$1: ulong
num_tasks0 <- n$1: ulong
s_partial <- s$4: __global double*
"###);
}
