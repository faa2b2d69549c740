// kcc — Kernel Compiler Collection
//
// Library root. Lowers typed SSA programs to C host code and OpenCL kernels.

pub mod affine;
pub mod alloc;
pub mod codegen;
pub mod depend;
pub mod diag;
pub mod dot;
pub mod error;
pub mod id;
pub mod instances;
pub mod interp;
pub mod kernel;
pub mod lexer;
pub mod lir;
pub mod liveness;
pub mod lower;
pub mod ops;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod plan;
pub mod reduce;
pub mod schedule;
pub mod seqcopy;
pub mod ssa;
pub mod types;
