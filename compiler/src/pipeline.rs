// pipeline.rs — Compilation state and pass orchestration
//
// Holds every pass artifact and runs the minimal set of passes for a given
// terminal PassId: plan parallel nests, generate kernels and launch tables,
// lower host functions (with loops replaced by launcher calls), render.
//
// Preconditions: `state.program` is a well-typed SSA program.
// Postconditions: artifacts for all required passes are populated, or a
//                 `PipelineError` names the failing function or kernel.
// Failure modes: any `LowerError` raised while planning or lowering.
// Side effects: calls `on_pass_complete` after each pass with that pass's
//               diagnostics.

use std::fmt::Write as _;

use indexmap::IndexMap;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info_span};

use crate::alloc::{allocate, VariableNames};
use crate::codegen::{render_c_unit, reserved_names, CodegenOptions, Target};
use crate::diag::Diagnostic;
use crate::error::LowerError;
use crate::id::IdAllocator;
use crate::instances::{InstanceRef, InstanceSet};
use crate::kernel::{generate_kernel, GeneratedKernel, LaunchTable};
use crate::lir::CFunction;
use crate::pass::{descriptor, required_passes, PassId};
use crate::plan::{plan_function, KernelPlan};
use crate::ssa::{TypedFunction, TypedProgram};

// ── Artifact storage ───────────────────────────────────────────────────────

/// Emitted texts.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub c: String,
    /// Kernel name to OpenCL program text.
    pub opencl: IndexMap<String, String>,
    pub manifest: serde_json::Value,
}

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub program: TypedProgram,
    pub plans: Option<Vec<KernelPlan>>,
    pub kernels: Option<Vec<GeneratedKernel>>,
    /// Function name to allocation listing.
    pub allocations: Option<IndexMap<String, String>>,
    pub instances: InstanceSet,
    /// Declared-type instances of every program function, in program order.
    pub entries: Option<Vec<InstanceRef>>,
    pub rendered: Option<Rendered>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilationState {
    pub fn new(program: TypedProgram) -> Self {
        Self {
            program,
            plans: None,
            kernels: None,
            allocations: None,
            instances: InstanceSet::new(),
            entries: None,
            rendered: None,
            diagnostics: Vec::new(),
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// A fatal `LowerError`, tagged with what was being generated.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("while planning `{function}`: {source}")]
    Plan {
        function: String,
        #[source]
        source: LowerError,
    },

    #[error("while generating kernel `{kernel}`: {source}")]
    Kernel {
        kernel: String,
        #[source]
        source: LowerError,
    },

    #[error("while lowering `{function}`: {source}")]
    Function {
        function: String,
        #[source]
        source: LowerError,
    },

    #[error("artifact of pass `{0}` is missing")]
    MissingArtifact(&'static str),
}

impl PipelineError {
    pub fn lower_error(&self) -> Option<&LowerError> {
        match self {
            PipelineError::Plan { source, .. }
            | PipelineError::Kernel { source, .. }
            | PipelineError::Function { source, .. } => Some(source),
            PipelineError::MissingArtifact(_) => None,
        }
    }

    pub fn pass(&self) -> Option<PassId> {
        match self {
            PipelineError::Plan { .. } => Some(PassId::Plan),
            PipelineError::Kernel { .. } => Some(PassId::GenerateKernels),
            PipelineError::Function { .. } => Some(PassId::LowerFunctions),
            PipelineError::MissingArtifact(_) => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let context = match self {
            PipelineError::Plan { function, .. } => format!("planning `{function}`"),
            PipelineError::Kernel { kernel, .. } => format!("generating kernel `{kernel}`"),
            PipelineError::Function { function, .. } => format!("lowering `{function}`"),
            PipelineError::MissingArtifact(pass) => {
                return Diagnostic::new(crate::diag::DiagLevel::Error, None, self.to_string())
                    .with_hint(format!("run `{pass}` first"))
            }
        };
        match self.lower_error() {
            Some(e) => e.to_diagnostic().with_cause(context, None),
            None => Diagnostic::new(crate::diag::DiagLevel::Error, None, self.to_string()),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) {
    on_pass_complete(pass_id, &diags);
    debug!(pass = descriptor(pass_id).name, diagnostics = diags.len(), "pass complete");
    state.diagnostics.extend(diags);
}

/// Groups of one function with their emitted names, one line per group.
pub fn allocation_listing(
    function: &TypedFunction,
    options: &CodegenOptions,
) -> Result<String, LowerError> {
    let alloc = allocate(function)?;
    let names = VariableNames::assign(&alloc, &reserved_names(Target::C, options));
    let mut out = String::new();
    let _ = writeln!(out, "function {}", function.name);
    for (_, members) in alloc.groups() {
        let name = members
            .first()
            .and_then(|m| names.try_final_name(m))
            .unwrap_or("?");
        let _ = writeln!(out, "  {name}: {}", members.join(" "));
    }
    for (a, b) in alloc.extra_copies() {
        let _ = writeln!(out, "  copy {a} <-> {b}");
    }
    Ok(out)
}

/// Launch tables of every host function, keyed by host name.
fn launch_tables(kernels: &[GeneratedKernel]) -> IndexMap<String, LaunchTable> {
    let mut tables: IndexMap<String, LaunchTable> = IndexMap::new();
    for k in kernels {
        tables
            .entry(k.host.clone())
            .or_default()
            .insert(k.launch_block, k.launch.clone());
    }
    tables
}

fn render(state: &CompilationState, kernels: &[GeneratedKernel]) -> Rendered {
    let externs: Vec<&CFunction> = kernels.iter().map(|k| &k.launch.prototype).collect();
    let functions: Vec<&CFunction> = state
        .instances
        .for_target(Target::C)
        .into_iter()
        .map(|i| &i.function)
        .collect();
    let c = render_c_unit(&externs, &functions);
    let opencl = kernels
        .iter()
        .map(|k| (k.name.clone(), k.source(&state.instances)))
        .collect();
    let manifest = json!({
        "kernels": kernels.iter().map(GeneratedKernel::manifest).collect::<Vec<_>>(),
    });
    Rendered { c, opencl, manifest }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute, then `on_pass_complete` with the pass's
/// diagnostics. Diagnostics of passes that fail are discarded; the error
/// carries the cause.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &CodegenOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let span = info_span!("pass", name = descriptor(pass_id).name);
        let _guard = span.enter();
        match pass_id {
            PassId::Plan => {
                let mut ids = IdAllocator::new();
                let mut plans = Vec::new();
                for f in &state.program.functions {
                    let planned =
                        plan_function(f, options, &mut ids).map_err(|source| PipelineError::Plan {
                            function: f.name.clone(),
                            source,
                        })?;
                    plans.extend(planned);
                }
                debug!(kernels = plans.len(), "planned");
                state.plans = Some(plans);
                finish_pass(state, pass_id, Vec::new(), &mut on_pass_complete);
            }
            PassId::GenerateKernels => {
                let plans = state
                    .plans
                    .take()
                    .ok_or(PipelineError::MissingArtifact("plan"))?;
                let mut kernels = Vec::with_capacity(plans.len());
                let mut diags = Vec::new();
                for plan in &plans {
                    let k = generate_kernel(plan, &state.program, options, &mut state.instances)
                        .map_err(|source| PipelineError::Kernel {
                            kernel: plan.name.clone(),
                            source,
                        })?;
                    diags.extend(k.diagnostics.iter().cloned());
                    kernels.push(k);
                }
                state.instances.set_launches(launch_tables(&kernels));
                state.plans = Some(plans);
                state.kernels = Some(kernels);
                finish_pass(state, pass_id, diags, &mut on_pass_complete);
            }
            PassId::Allocate => {
                let mut listings = IndexMap::new();
                for f in &state.program.functions {
                    let listing =
                        allocation_listing(f, options).map_err(|source| PipelineError::Function {
                            function: f.name.clone(),
                            source,
                        })?;
                    listings.insert(f.name.clone(), listing);
                }
                state.allocations = Some(listings);
                finish_pass(state, pass_id, Vec::new(), &mut on_pass_complete);
            }
            PassId::LowerFunctions => {
                let before = state.instances.len();
                let mut entries = Vec::new();
                for f in &state.program.functions {
                    let fail = |source| PipelineError::Function {
                        function: f.name.clone(),
                        source,
                    };
                    let types = f
                        .params
                        .iter()
                        .map(|p| f.type_of(p).cloned())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(fail)?;
                    let entry = state
                        .instances
                        .request(&state.program, options, f, &types, Target::C)
                        .map_err(fail)?;
                    entries.push(entry);
                }
                debug!(
                    functions = entries.len(),
                    instances = state.instances.len() - before,
                    "host functions lowered"
                );
                let diags: Vec<Diagnostic> = [Target::C, Target::OpenCl]
                    .into_iter()
                    .flat_map(|t| state.instances.for_target(t))
                    .flat_map(|i| i.diagnostics.iter().cloned())
                    .collect();
                state.entries = Some(entries);
                finish_pass(state, pass_id, diags, &mut on_pass_complete);
            }
            PassId::Render => {
                let kernels = state
                    .kernels
                    .take()
                    .ok_or(PipelineError::MissingArtifact("generate_kernels"))?;
                let rendered = render(state, &kernels);
                state.kernels = Some(kernels);
                state.rendered = Some(rendered);
                finish_pass(state, pass_id, Vec::new(), &mut on_pass_complete);
            }
        }
    }
    Ok(())
}

// ── One-shot entry point ───────────────────────────────────────────────────

/// Everything a compilation produces.
#[derive(Debug)]
pub struct CompileOutput {
    pub kernels: Vec<GeneratedKernel>,
    pub instances: InstanceSet,
    pub entries: Vec<InstanceRef>,
    pub c_source: String,
    pub opencl: IndexMap<String, String>,
    pub manifest: serde_json::Value,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn kernel(&self, name: &str) -> Option<&GeneratedKernel> {
        self.kernels.iter().find(|k| k.name == name)
    }
}

/// Compile `program` end to end.
pub fn compile(
    program: &TypedProgram,
    options: &CodegenOptions,
) -> Result<CompileOutput, PipelineError> {
    let span = info_span!("compile", functions = program.functions.len());
    let _guard = span.enter();
    let mut state = CompilationState::new(program.clone());
    run_pipeline(&mut state, PassId::Render, options, |_, _| {})?;
    let rendered = state
        .rendered
        .ok_or(PipelineError::MissingArtifact("render"))?;
    Ok(CompileOutput {
        kernels: state.kernels.unwrap_or_default(),
        instances: state.instances,
        entries: state.entries.unwrap_or_default(),
        c_source: rendered.c,
        opencl: rendered.opencl,
        manifest: rendered.manifest,
        diagnostics: state.diagnostics,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const SUM: &str = "\
function total(A$1, n$1) -> (s$4)
  types {
    A$1: double[?]
    n$1: int32
    s$1: double(0.0)
    s$2: double
    s$3: double
    s$4: double
    $one: int32(1)
    i$1: int32
    $a: double
  }
  parallel #0 reduce sum(s$1 -> s$4)
  block #0 {
    A$1 = arg 0
    n$1 = arg 1
    s$1 = 0.0
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    s$2 = phi #0:s$1, #1:s$3
    i$1 = iter
    $a = simple_get A$1[i$1]
    s$3 = call plus(s$2, $a)
  }
  block #2 {
    s$4 = phi #0:s$1, #1:s$3
  }
end
";

    fn program(src: &str) -> TypedProgram {
        let result = parse(src);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        result.program.unwrap()
    }

    #[test]
    fn host_loop_becomes_launcher_call() {
        let out = compile(&program(SUM), &CodegenOptions::default()).unwrap();
        assert_eq!(out.kernels.len(), 1);
        assert!(out.c_source.starts_with("#include \"kcc_runtime.h\"\n"));
        assert!(out.c_source.contains("void total_0_launch("), "{}", out.c_source);
        assert!(out.c_source.contains("total_0_launch(A"), "{}", out.c_source);
        assert!(!out.c_source.contains("for ("), "{}", out.c_source);
        assert!(out.opencl["total_0"].contains("#pragma OPENCL EXTENSION cl_khr_fp64 : enable"));
        assert_eq!(out.manifest["kernels"][0]["name"], "total_0");
    }

    #[test]
    fn callback_sees_passes_in_order() {
        let mut state = CompilationState::new(program(SUM));
        let mut seen = Vec::new();
        run_pipeline(&mut state, PassId::Render, &CodegenOptions::default(), |p, _| {
            seen.push(p)
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                PassId::Plan,
                PassId::GenerateKernels,
                PassId::LowerFunctions,
                PassId::Render
            ]
        );
        assert!(state.allocations.is_none());
    }

    #[test]
    fn allocation_listing_groups_reduction_names() {
        let p = program(SUM);
        let text = allocation_listing(&p.functions[0], &CodegenOptions::default()).unwrap();
        assert!(text.starts_with("function total\n"), "{text}");
        let line = text.lines().find(|l| l.starts_with("  s: ")).unwrap();
        for name in ["s$1", "s$2", "s$3", "s$4"] {
            assert!(line.split_whitespace().any(|w| w == name), "{text}");
        }
    }

    #[test]
    fn errors_name_the_kernel() {
        let options = CodegenOptions {
            reduction_strategies: vec![crate::reduce::GlobalStrategyKind::MatrixSet],
            ..CodegenOptions::default()
        };
        let err = compile(&program(SUM), &options).unwrap_err();
        assert!(
            matches!(err, PipelineError::Kernel { ref kernel, .. } if kernel == "total_0"),
            "{err}"
        );
        assert_eq!(err.pass(), Some(PassId::GenerateKernels));
        let d = err.to_diagnostic();
        assert_eq!(d.code.map(|c| c.0), Some("E0201"));
        assert_eq!(d.cause_chain[0].message, "generating kernel `total_0`");
    }
}
