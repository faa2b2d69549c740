// plan.rs — Parallel region planner: loop nests to kernel plans
//
// Turns one `ParallelLoopDescriptor` into a `KernelPlan`: the validated nest,
// the global reductions threaded through it, the local reductions the body
// can combine cooperatively, the chosen schedule and the extracted kernel
// body in its own block numbering.
//
// Preconditions: the host function satisfies the SSA contract; descriptor
//                blocks exist.
// Postconditions: the kernel body defines every name it reads except the
//                 listed imports, each of which has an `Initialization` at
//                 the top of block 0.
// Failure modes: `Malformed` for nests or reductions that break the shape
//                rules; `Unsupported` / `UnsupportedSchedule` for valid
//                requests no schedule can serve.
// Side effects: none. Dependence findings become `Warning` diagnostics.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;
use tracing::{debug, instrument};

use crate::affine::AffineContext;
use crate::codegen::CodegenOptions;
use crate::depend::{analyze_loop, DependenceVerdict, MatrixLineage};
use crate::diag::{self, DiagLevel, Diagnostic};
use crate::error::LowerError;
use crate::id::{BlockId, IdAllocator, KernelId};
use crate::liveness::iter_output;
use crate::reduce::{GlobalStrategyKind, LocalStrategyKind};
use crate::schedule::ScheduleKind;
use crate::ssa::{
    Block, FunctionBody, Instruction, ParallelLoopDescriptor, ReductionKind, SizeRef,
    TypedFunction,
};
use crate::types::{NumericKind, Storage, VarType};

// ── Plan model ──────────────────────────────────────────────────────────────

/// One loop of the nest, in host block numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct NestLevel {
    /// Block whose ending instruction is this loop's `For`.
    pub for_block: BlockId,
    pub start: String,
    pub interval: String,
    pub end: String,
    pub loop_block: BlockId,
    pub end_block: BlockId,
    pub iter: Option<String>,
}

impl NestLevel {
    fn level(&self) -> Level {
        Level {
            for_block: self.for_block,
            loop_block: self.loop_block,
            end_block: self.end_block,
        }
    }
}

/// A reduction carried across the whole nest.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedReduction {
    pub kind: ReductionKind,
    pub initial: String,
    pub final_name: String,
    pub elem: NumericKind,
    /// Loop phis, construction output and copies, then inner end phis.
    pub loop_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalSite {
    pub kind: ReductionKind,
    /// Loop phi output; its group is the accumulator.
    pub phi: String,
    pub elem: NumericKind,
}

/// A sequential inner loop of the kernel body whose iterations are spread
/// over the lanes of a cooperative task.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalReduction {
    /// Loop block in kernel numbering.
    pub loop_block: BlockId,
    pub sites: Vec<LocalSite>,
}

#[derive(Debug, Clone)]
pub struct KernelPlan {
    pub id: KernelId,
    pub name: String,
    pub host: String,
    /// Outermost loop first. The innermost loop is dimension 0.
    pub nest: Vec<NestLevel>,
    pub schedule: ScheduleKind,
    /// Coarsening factors or work-group counts, per dimension.
    pub params: Vec<SizeRef>,
    pub local_sizes: Vec<SizeRef>,
    pub reductions: Vec<PlannedReduction>,
    pub local_reductions: Vec<LocalReduction>,
    pub kernel: TypedFunction,
    /// Names read by the kernel body and defined on the host.
    pub imports: Vec<String>,
    pub strategies: Vec<GlobalStrategyKind>,
    pub local_strategies: Vec<LocalStrategyKind>,
    pub line: Option<u32>,
    pub diagnostics: Vec<Diagnostic>,
}

impl KernelPlan {
    pub fn depth(&self) -> usize {
        self.nest.len()
    }

    /// Dimension of nest level `level`.
    pub fn dimension(&self, level: usize) -> usize {
        self.nest.len() - 1 - level
    }

    /// Block of the host function the launch replaces.
    pub fn launch_block(&self) -> BlockId {
        self.nest[0].for_block
    }

    /// Every name of a scalar reduction, as it appears in the kernel.
    pub fn accumulator_names(&self) -> HashSet<String> {
        self.reductions
            .iter()
            .filter(|r| r.kind.is_scalar())
            .flat_map(|r| r.loop_names.iter().chain([&r.initial, &r.final_name]).cloned())
            .collect()
    }
}

// ── Reduction tracing ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Level {
    for_block: BlockId,
    loop_block: BlockId,
    end_block: BlockId,
}

/// `(entry, back)` sources of a two-input loop phi.
fn split_phi(sources: &[(BlockId, String)], entry: BlockId) -> Option<(&str, &str)> {
    if sources.len() != 2 {
        return None;
    }
    let (_, e) = sources.iter().find(|(b, _)| *b == entry)?;
    let (_, b) = sources.iter().find(|(b, _)| *b != entry)?;
    Some((e.as_str(), b.as_str()))
}

fn phis(block: &Block) -> impl Iterator<Item = (&str, &[(BlockId, String)])> {
    block.instructions.iter().filter_map(|i| match i {
        Instruction::Phi { output, sources } => Some((output.as_str(), sources.as_slice())),
        _ => None,
    })
}

fn end_phi<'b>(block: &'b Block, carried: &str) -> Option<&'b str> {
    phis(block)
        .find(|(_, sources)| sources.iter().any(|(_, s)| s == carried))
        .map(|(out, _)| out)
}

/// Whether some index of a write moves with the loop's induction variable.
fn indexed_by_iter(
    function: &TypedFunction,
    loop_block: &Block,
    iter: &str,
    indices: &[String],
) -> bool {
    let defs: HashMap<&str, &Instruction> = loop_block
        .instructions
        .iter()
        .flat_map(|i| i.outputs().into_iter().map(move |o| (o, i)))
        .collect();
    let ctx = AffineContext {
        function,
        defs: &defs,
        iter,
    };
    indices
        .iter()
        .any(|i| ctx.eval(i).is_some_and(|a| a.coeff != 0))
}

#[derive(Debug, Clone)]
struct Traced {
    kind: ReductionKind,
    initial: String,
    final_name: String,
    loop_names: Vec<String>,
}

/// Follow the loop phi `phi` of `levels[0]` down to its construction and
/// back out to the final end phi. `None` when the chain has another shape.
fn trace(
    function: &TypedFunction,
    levels: &[Level],
    phi: &str,
) -> Result<Option<Traced>, LowerError> {
    let body = &function.body;
    let Some((first, inner_levels)) = levels.split_first() else {
        return Ok(None);
    };
    let Some((initial, back)) = phis(body.block(first.loop_block)?)
        .find(|(out, _)| *out == phi)
        .and_then(|(_, sources)| split_phi(sources, first.for_block))
    else {
        return Ok(None);
    };
    let initial = initial.to_string();
    let mut loop_names = vec![phi.to_string()];
    let mut backs = vec![back.to_string()];
    let mut current = phi.to_string();

    for level in inner_levels {
        let found = phis(body.block(level.loop_block)?).find_map(|(out, sources)| {
            split_phi(sources, level.for_block)
                .filter(|(entry, _)| *entry == current)
                .map(|(_, back)| (out.to_string(), back.to_string()))
        });
        let Some((out, back)) = found else {
            return Ok(None);
        };
        loop_names.push(out.clone());
        backs.push(back);
        current = out;
    }

    let inner = levels[levels.len() - 1];
    let mut users = Vec::new();
    for b in body.owned_closure(inner.loop_block)? {
        for instr in &body.block(b)?.instructions {
            let read = match instr {
                Instruction::SimpleGet { matrix, .. }
                | Instruction::MatrixGet { matrix, .. }
                | Instruction::GetOrFirst { matrix, .. } => *matrix == current,
                _ => false,
            };
            // Reads of a matrix being built do not break the chain; the
            // dependence check judges them.
            if !read && instr.inputs().contains(&current.as_str()) {
                users.push((b, instr));
            }
        }
    }
    let [(user_block, construction)] = users.as_slice() else {
        return Ok(None);
    };
    if *user_block != inner.loop_block {
        return Ok(None);
    }
    let loop_block = body.block(inner.loop_block)?;
    let (kind, mut value) = match construction {
        Instruction::Call {
            outputs,
            callee,
            inputs,
        } => {
            let ([out], [a, b]) = (outputs.as_slice(), inputs.as_slice()) else {
                return Ok(None);
            };
            if a == b {
                return Ok(None);
            }
            let kind = match callee.as_str() {
                "plus" => ReductionKind::Sum,
                "min" => ReductionKind::Min,
                "max" => ReductionKind::Max,
                _ => return Ok(None),
            };
            (kind, out.clone())
        }
        Instruction::SimpleSet {
            output,
            matrix,
            indices,
            value,
        } if *matrix == current && *value != current => {
            let Some(iter) = iter_output(body, inner.loop_block)? else {
                return Ok(None);
            };
            if !indexed_by_iter(function, loop_block, &iter, indices) {
                return Ok(None);
            }
            (ReductionKind::MatrixSet, output.clone())
        }
        _ => return Ok(None),
    };
    let ty = function.type_of(phi)?;
    if kind.is_scalar() == ty.is_matrix() {
        return Ok(None);
    }
    loop_names.push(value.clone());
    for instr in &loop_block.instructions {
        if let Instruction::ParallelCopy { copies } = instr {
            if let Some((d, _)) = copies.iter().find(|(_, s)| *s == value) {
                value = d.clone();
                loop_names.push(value.clone());
            }
        }
    }
    if backs[backs.len() - 1] != value {
        return Ok(None);
    }

    for k in (1..levels.len()).rev() {
        let Some(e) = end_phi(body.block(levels[k].end_block)?, &backs[k]) else {
            return Ok(None);
        };
        if backs[k - 1] != e {
            return Ok(None);
        }
        loop_names.push(e.to_string());
    }
    let Some(final_name) = end_phi(body.block(first.end_block)?, &backs[0]) else {
        return Ok(None);
    };
    Ok(Some(Traced {
        kind,
        initial,
        final_name: final_name.to_string(),
        loop_names,
    }))
}

// ── Nest validation ─────────────────────────────────────────────────────────

fn validate_nest(
    function: &TypedFunction,
    loops: &[BlockId],
) -> Result<Vec<NestLevel>, LowerError> {
    if loops.is_empty() || loops.len() > 3 {
        return Err(LowerError::Unsupported(format!(
            "parallel nest of depth {} (1 to 3 loops supported)",
            loops.len()
        )));
    }
    let body = &function.body;
    let mut nest: Vec<NestLevel> = Vec::with_capacity(loops.len());
    for &b in loops {
        let Some(Instruction::For {
            start,
            interval,
            end,
            loop_block,
            end_block,
        }) = body.block(b)?.ending()
        else {
            return Err(LowerError::malformed(
                "parallel nest",
                format!("block {b} does not end in a for loop"),
            ));
        };
        if let Some(parent) = nest.last() {
            if parent.loop_block != b {
                return Err(LowerError::malformed(
                    "parallel nest",
                    format!(
                        "loop of block {b} is not the last instruction of the enclosing loop body"
                    ),
                ));
            }
        }
        let unit = function
            .type_of(interval)?
            .constant_value()
            .and_then(|c| c.as_i64())
            == Some(1);
        if !unit {
            return Err(LowerError::Unsupported(format!(
                "parallel loop in block {b} needs the constant interval 1"
            )));
        }
        nest.push(NestLevel {
            for_block: b,
            start: start.clone(),
            interval: interval.clone(),
            end: end.clone(),
            loop_block: *loop_block,
            end_block: *end_block,
            iter: iter_output(body, *loop_block)?,
        });
    }
    for level in &nest[1..] {
        let ok = body.block(level.end_block)?.instructions.iter().all(|i| {
            matches!(
                i,
                Instruction::Phi { .. } | Instruction::Line(_) | Instruction::Comment(_)
            )
        });
        if !ok {
            return Err(LowerError::malformed(
                "parallel nest",
                format!("inner loop end block {} holds code between the loops", level.end_block),
            ));
        }
    }
    Ok(nest)
}

fn last_line(block: &Block) -> Option<u32> {
    block.instructions.iter().rev().find_map(|i| match i {
        Instruction::Line(n) => Some(*n),
        _ => None,
    })
}

// ── Kernel body extraction ──────────────────────────────────────────────────

/// Device-side type of a host variable.
fn device_type(ty: &VarType) -> VarType {
    match ty {
        VarType::Matrix(m) => {
            let mut m = m.clone();
            m.storage = if m.known_numel().is_some() {
                Storage::Buffer
            } else {
                Storage::Sized
            };
            VarType::Matrix(m)
        }
        other => other.clone(),
    }
}

struct Extracted {
    body: FunctionBody,
    imports: Vec<String>,
}

fn extract(
    function: &TypedFunction,
    nest: &[NestLevel],
    accumulators: &HashSet<String>,
) -> Result<Extracted, LowerError> {
    let body = &function.body;
    let inner = &nest[nest.len() - 1];
    let closure = body.owned_closure(inner.loop_block)?;
    let map: HashMap<BlockId, BlockId> = closure
        .iter()
        .enumerate()
        .map(|(k, b)| (*b, BlockId(k as u32)))
        .collect();
    let remap = |b: BlockId| map.get(&b).copied().unwrap_or(b);
    let copy = |instr: &Instruction| {
        let mut instr = instr.clone();
        instr.remap_blocks(&remap);
        instr
    };

    let mut entry = Vec::new();
    for level in nest {
        let instrs = &body.block(level.loop_block)?.instructions;
        let own = if level.loop_block == inner.loop_block {
            instrs.as_slice()
        } else {
            &instrs[..instrs.len().saturating_sub(1)]
        };
        entry.extend(
            own.iter()
                .filter(|i| !matches!(i, Instruction::Phi { .. }))
                .map(copy),
        );
    }
    let mut blocks = vec![Block::new(entry)];
    for b in &closure[1..] {
        blocks.push(Block::new(body.block(*b)?.instructions.iter().map(copy).collect()));
    }

    let mut defined = HashSet::new();
    let mut used: IndexSet<String> = IndexSet::new();
    for level in nest {
        let constant = function.type_of(&level.start)?.constant_value().is_some();
        if !constant {
            used.insert(level.start.clone());
        }
    }
    for block in &blocks {
        for instr in &block.instructions {
            used.extend(instr.inputs().into_iter().map(str::to_string));
            defined.extend(instr.outputs().into_iter().map(str::to_string));
        }
    }
    let imports: Vec<String> = used
        .into_iter()
        .filter(|n| !defined.contains(n) && !accumulators.contains(n))
        .collect();

    let mut inits: Vec<Instruction> = imports
        .iter()
        .map(|name| Instruction::Initialization { name: name.clone() })
        .collect();
    inits.append(&mut blocks[0].instructions);
    blocks[0].instructions = inits;
    Ok(Extracted {
        body: FunctionBody::new(blocks),
        imports,
    })
}

// ── Local reductions and schedule choice ────────────────────────────────────

fn discover_local(kernel: &TypedFunction) -> Result<Vec<LocalReduction>, LowerError> {
    let body = &kernel.body;
    let mut found = Vec::new();
    for b in body.block_ids() {
        let Some(Instruction::For {
            interval,
            loop_block,
            end_block,
            ..
        }) = body.block(b)?.ending()
        else {
            continue;
        };
        let block = body.block(*loop_block)?;
        if block.instructions.iter().any(|i| !i.owned_blocks().is_empty()) {
            continue;
        }
        let unit = kernel
            .type_of(interval)?
            .constant_value()
            .and_then(|c| c.as_i64())
            == Some(1);
        if !unit {
            continue;
        }
        let level = [Level {
            for_block: b,
            loop_block: *loop_block,
            end_block: *end_block,
        }];
        let mut sites = Vec::new();
        let mut all = true;
        for (phi, _) in phis(block) {
            match trace(kernel, &level, phi)? {
                Some(t) if t.kind.is_scalar() => sites.push(LocalSite {
                    kind: t.kind,
                    phi: phi.to_string(),
                    elem: kernel.type_of(phi)?.elem(),
                }),
                _ => all = false,
            }
        }
        if all && !sites.is_empty() {
            found.push(LocalReduction {
                loop_block: *loop_block,
                sites,
            });
        }
    }
    Ok(found)
}

/// Whether every instruction outside the local loops is bookkeeping.
fn work_is_local(kernel: &TypedFunction, locals: &[LocalReduction]) -> Result<bool, LowerError> {
    let body = &kernel.body;
    let mut inside = HashSet::new();
    for l in locals {
        inside.extend(body.owned_closure(l.loop_block)?);
    }
    let local_loops: HashSet<BlockId> = locals.iter().map(|l| l.loop_block).collect();
    for b in body.block_ids().filter(|b| !inside.contains(b)) {
        for instr in &body.block(b)?.instructions {
            let trivial = match instr {
                Instruction::For { loop_block, .. } => local_loops.contains(loop_block),
                Instruction::Call { callee, .. } => crate::ops::is_pure(callee),
                Instruction::Branch { .. }
                | Instruction::While { .. }
                | Instruction::MatrixGet { .. }
                | Instruction::MatrixSet { .. } => false,
                _ => true,
            };
            if !trivial {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Plan the kernel for one descriptor of `function`.
#[instrument(skip_all, fields(function = %function.name, kernel = id.0))]
pub fn plan_nest(
    function: &TypedFunction,
    descriptor: &ParallelLoopDescriptor,
    options: &CodegenOptions,
    id: KernelId,
) -> Result<KernelPlan, LowerError> {
    let nest = validate_nest(function, &descriptor.loops)?;
    let depth = nest.len();
    let levels: Vec<Level> = nest.iter().map(NestLevel::level).collect();
    let line = last_line(function.body.block(nest[0].for_block)?);
    let mut diagnostics = Vec::new();

    let mut reductions = Vec::new();
    let outer_phis: Vec<String> = phis(function.body.block(nest[0].loop_block)?)
        .map(|(o, _)| o.to_string())
        .collect();
    for phi in &outer_phis {
        if let Some(t) = trace(function, &levels, phi)? {
            reductions.push(PlannedReduction {
                kind: t.kind,
                elem: function.type_of(phi)?.elem(),
                initial: t.initial,
                final_name: t.final_name,
                loop_names: t.loop_names,
            });
        }
    }
    for decl in &descriptor.reductions {
        let matches = reductions.iter().any(|r| {
            r.kind == decl.kind && r.initial == decl.initial && r.final_name == decl.final_name
        });
        if !matches {
            return Err(LowerError::malformed(
                "reduction",
                format!(
                    "{} reduction `{}` -> `{}` does not follow the loop nest",
                    decl.kind, decl.initial, decl.final_name
                ),
            ));
        }
    }

    let mut ignored = HashSet::new();
    for r in &reductions {
        ignored.extend(r.loop_names.iter().cloned());
        ignored.insert(r.final_name.clone());
    }
    let inner = &nest[depth - 1];
    let lineage = MatrixLineage::build(function);
    if let DependenceVerdict::Dependent(reason) =
        analyze_loop(function, inner.loop_block, inner.end_block, &lineage, &ignored)?
    {
        diagnostics.push(
            Diagnostic::new(
                DiagLevel::Warning,
                line,
                format!("parallel loop in block {} may carry a dependence", nest[0].for_block),
            )
            .with_code(diag::PARALLEL_LOOP_DEPENDENCE)
            .with_cause(reason.to_string(), None)
            .with_hint(
                "the loop is parallelized as requested; results may differ from sequential execution",
            ),
        );
    }

    let accumulators: HashSet<String> = reductions
        .iter()
        .filter(|r| r.kind.is_scalar())
        .flat_map(|r| r.loop_names.iter().chain([&r.initial, &r.final_name]).cloned())
        .collect();
    let extracted = extract(function, &nest, &accumulators)?;
    let name = format!("{}_{}", function.name.replace('$', ""), id);
    let kernel = TypedFunction {
        name: name.clone(),
        params: Vec::new(),
        outputs: Vec::new(),
        types: function
            .types
            .iter()
            .map(|(n, t)| (n.clone(), device_type(t)))
            .collect(),
        parallel: Vec::new(),
        body: extracted.body,
    };

    let settings = &descriptor.settings;
    let mut local_reductions = match settings.schedule {
        None | Some(ScheduleKind::Cooperative) | Some(ScheduleKind::SubgroupCooperative) => {
            discover_local(&kernel)?
        }
        Some(_) => Vec::new(),
    };
    let schedule = match settings.schedule {
        Some(kind) => kind,
        None => {
            let cooperative = options.try_cooperative
                && depth == 1
                && !local_reductions.is_empty()
                && work_is_local(&kernel, &local_reductions)?;
            if cooperative {
                if options.prefer_subgroup {
                    ScheduleKind::SubgroupCooperative
                } else {
                    ScheduleKind::Cooperative
                }
            } else {
                if options.try_cooperative && !local_reductions.is_empty() {
                    diagnostics.push(Diagnostic::info(
                        diag::SCHEDULE_FALLBACK,
                        line,
                        "cooperative schedule not applicable; using direct",
                    ));
                }
                ScheduleKind::Direct
            }
        }
    };
    if !schedule.is_cooperative() {
        local_reductions.clear();
    }
    if schedule.is_cooperative() && depth != 1 {
        return Err(LowerError::UnsupportedSchedule {
            schedule: schedule.name().into(),
            feature: format!("{depth}-dimensional nests"),
        });
    }

    let local_sizes: Vec<SizeRef> = (0..depth)
        .map(|d| {
            settings.local_sizes.get(d).cloned().unwrap_or(if d == 0 {
                SizeRef::Const(options.default_local_size)
            } else {
                SizeRef::Const(1)
            })
        })
        .collect();
    let params: Vec<SizeRef> = (0..depth)
        .map(|d| settings.schedule_params.get(d).cloned().unwrap_or(SizeRef::Const(1)))
        .collect();
    if schedule == ScheduleKind::SubgroupCooperative && options.warp_fallback {
        let sg = u64::from(options.sub_group_size);
        let fits = local_sizes[0]
            .constant()
            .is_some_and(|n| sg > 0 && n > 0 && n % sg == 0);
        if !fits {
            return Err(LowerError::Unsupported(format!(
                "warp-emulated subgroups need a constant work-group size that is a multiple of {sg}, got {}",
                local_sizes[0]
            )));
        }
    }

    let strategies = if settings.reduction_strategies.is_empty() {
        options.reduction_strategies.clone()
    } else {
        settings.reduction_strategies.clone()
    };
    let local_strategies = if settings.local_reduction_strategies.is_empty() {
        options.local_reduction_strategies.clone()
    } else {
        settings.local_reduction_strategies.clone()
    };

    debug!(
        %name,
        %schedule,
        depth,
        reductions = reductions.len(),
        local = local_reductions.len(),
        imports = extracted.imports.len(),
        "kernel planned"
    );
    Ok(KernelPlan {
        id,
        name,
        host: function.name.clone(),
        nest,
        schedule,
        params,
        local_sizes,
        reductions,
        local_reductions,
        kernel,
        imports: extracted.imports,
        strategies,
        local_strategies,
        line,
        diagnostics,
    })
}

/// Plan every descriptor of `function`, allocating kernel ids in order.
pub fn plan_function(
    function: &TypedFunction,
    options: &CodegenOptions,
    ids: &mut IdAllocator,
) -> Result<Vec<KernelPlan>, LowerError> {
    function
        .parallel
        .iter()
        .map(|d| plan_nest(function, d, options, ids.alloc_kernel()))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::ssa::TypedProgram;

    fn program(source: &str) -> TypedProgram {
        let result = parse(source);
        assert!(result.errors.is_empty(), "parse errors: {:?}", result.errors);
        result.program.unwrap()
    }

    fn plan(source: &str, options: &CodegenOptions) -> Result<KernelPlan, LowerError> {
        let program = program(source);
        let f = &program.functions[0];
        plan_nest(f, &f.parallel[0], options, KernelId(0))
    }

    const SCALE: &str = "\
function scale(A$1, n$1) -> (B$3)
  types {
    A$1: double[?]
    n$1: int32
    B$1: double[?]
    B$2: double[?]
    B$3: double[?]
    B$4: double[?]
    $one: int32(1)
    $two: double(2.0)
    i$1: int32
    $a: double
    $b: double
  }
  parallel #0
  block #0 {
    A$1 = arg 0
    n$1 = arg 1
    B$1 = call zeros(n$1)
    $one = 1
    $two = 2.0
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    B$2 = phi #0:B$1, #1:B$4
    i$1 = iter
    $a = simple_get A$1[i$1]
    $b = call times($a, $two)
    B$4 = simple_set B$2[i$1] = $b
  }
  block #2 {
    B$3 = phi #0:B$1, #1:B$4
  }
end
";

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

    #[test]
    fn elementwise_nest_becomes_matrix_set_reduction() {
        let plan = plan(SCALE, &CodegenOptions::default()).unwrap();
        assert_eq!(plan.name, "scale_0");
        assert_eq!(plan.schedule, ScheduleKind::Direct);
        assert_eq!(plan.reductions.len(), 1);
        let r = &plan.reductions[0];
        assert_eq!(r.kind, ReductionKind::MatrixSet);
        assert_eq!(r.initial, "B$1");
        assert_eq!(r.final_name, "B$3");
        assert_eq!(r.loop_names, vec!["B$2", "B$4"]);
        assert_eq!(plan.imports, vec!["A$1", "$two", "B$2"]);
        assert!(plan.diagnostics.is_empty());
        assert_eq!(plan.local_sizes, vec![SizeRef::Const(128)]);
    }

    #[test]
    fn kernel_body_starts_with_initializations() {
        let plan = plan(SCALE, &CodegenOptions::default()).unwrap();
        let entry = &plan.kernel.body.blocks[0].instructions;
        assert_eq!(entry[0], Instruction::Initialization { name: "A$1".into() });
        assert_eq!(entry[2], Instruction::Initialization { name: "B$2".into() });
        assert!(entry.iter().all(|i| !matches!(i, Instruction::Phi { .. })));
        assert!(matches!(
            plan.kernel.type_of("A$1").unwrap().as_matrix().map(|m| m.storage),
            Some(Storage::Sized)
        ));
    }

    #[test]
    fn sum_reduction_is_traced_and_validated() {
        let plan = plan(SUM, &CodegenOptions::default()).unwrap();
        assert_eq!(plan.reductions.len(), 1);
        assert_eq!(plan.reductions[0].kind, ReductionKind::Sum);
        assert_eq!(plan.reductions[0].loop_names, vec!["s$2", "s$3"]);
        // Accumulator names never become kernel inputs.
        assert_eq!(plan.imports, vec!["A$1"]);
    }

    #[test]
    fn descriptor_reduction_must_match_the_nest() {
        let src = SUM.replace("reduce sum(s$1 -> s$4)", "reduce max(s$1 -> s$4)");
        let err = plan(&src, &CodegenOptions::default()).unwrap_err();
        assert!(matches!(err, LowerError::Malformed { what: "reduction", .. }), "{err}");
    }

    #[test]
    fn shifted_write_warns_but_still_plans() {
        let src = "\
function shift(A$1, n$1) -> (A$3)
  types {
    A$1: double[?]
    n$1: int32
    A$2: double[?]
    A$3: double[?]
    A$4: double[?]
    $one: int32(1)
    $two: int32(2)
    i$1: int32
    $k: int32
    $v: double
  }
  parallel #0
  block #0 {
    A$1 = arg 0
    n$1 = arg 1
    $one = 1
    $two = 2
    for $two, $one, n$1 loop #1 end #2
  }
  block #1 {
    A$2 = phi #0:A$1, #1:A$4
    i$1 = iter
    $k = call minus(i$1, $one)
    $v = simple_get A$2[$k]
    A$4 = simple_set A$2[i$1] = $v
  }
  block #2 {
    A$3 = phi #0:A$1, #1:A$4
  }
end
";
        let plan = plan(src, &CodegenOptions::default()).unwrap();
        assert_eq!(plan.diagnostics.len(), 1);
        let d = &plan.diagnostics[0];
        assert_eq!(d.level, DiagLevel::Warning);
        assert_eq!(d.code, Some(diag::PARALLEL_LOOP_DEPENDENCE));
    }

    #[test]
    fn non_unit_interval_is_unsupported() {
        let src = SCALE.replace("for $one, $one, n$1", "for $one, n$1, n$1");
        let err = plan(&src, &CodegenOptions::default()).unwrap_err();
        assert!(matches!(err, LowerError::Unsupported(_)), "{err}");
    }

    const ROW_SUMS: &str = "\
function rows(A$1, m$1, n$1) -> (R$3)
  types {
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
  }
  parallel #0
  block #0 {
    A$1 = arg 0
    m$1 = arg 1
    n$1 = arg 2
    R$1 = call zeros(m$1)
    $one = 1
    for $one, $one, m$1 loop #1 end #2
  }
  block #1 {
    R$2 = phi #0:R$1, #1:R$4
    i$1 = iter
    s$1 = 0.0
    for $one, $one, n$1 loop #3 end #4
  }
  block #2 {
    R$3 = phi #0:R$1, #1:R$4
  }
  block #3 {
    s$2 = phi #1:s$1, #3:s$3
    j$1 = iter
    $a = simple_get A$1[i$1, j$1]
    s$3 = call plus(s$2, $a)
  }
  block #4 {
    s$4 = phi #1:s$1, #3:s$3
    R$4 = simple_set R$2[i$1] = s$4
  }
end
";

    #[test]
    fn auto_picks_cooperative_for_local_reductions() {
        let options = CodegenOptions {
            try_cooperative: true,
            ..CodegenOptions::default()
        };
        let plan = plan(ROW_SUMS, &options).unwrap();
        assert_eq!(plan.schedule, ScheduleKind::Cooperative);
        assert_eq!(plan.local_reductions.len(), 1);
        assert_eq!(plan.local_reductions[0].sites[0].phi, "s$2");

        let plan = self::plan(ROW_SUMS, &CodegenOptions::default()).unwrap();
        assert_eq!(plan.schedule, ScheduleKind::Direct);
        assert!(plan.local_reductions.is_empty());
    }

    #[test]
    fn warp_fallback_needs_a_multiple_of_the_subgroup_size() {
        let options = CodegenOptions {
            try_cooperative: true,
            prefer_subgroup: true,
            warp_fallback: true,
            sub_group_size: 48,
            ..CodegenOptions::default()
        };
        let err = plan(ROW_SUMS, &options).unwrap_err();
        assert!(matches!(err, LowerError::Unsupported(_)), "{err}");

        let options = CodegenOptions {
            sub_group_size: 32,
            ..options
        };
        let plan = plan(ROW_SUMS, &options).unwrap();
        assert_eq!(plan.schedule, ScheduleKind::SubgroupCooperative);
    }

    #[test]
    fn cooperative_rejects_deep_nests() {
        let src = "\
function grid(A$1, m$1, n$1) -> (A$3)
  types {
    A$1: double[?, ?]
    m$1: int32
    n$1: int32
    A$2: double[?, ?]
    A$3: double[?, ?]
    A$4: double[?, ?]
    A$5: double[?, ?]
    A$6: double[?, ?]
    $one: int32(1)
    $z: double(0.0)
    i$1: int32
    j$1: int32
  }
  parallel #0, #1 schedule(cooperative)
  block #0 {
    A$1 = arg 0
    m$1 = arg 1
    n$1 = arg 2
    $one = 1
    $z = 0.0
    for $one, $one, m$1 loop #1 end #2
  }
  block #1 {
    A$2 = phi #0:A$1, #4:A$5
    i$1 = iter
    for $one, $one, n$1 loop #3 end #4
  }
  block #2 {
    A$3 = phi #0:A$1, #4:A$5
  }
  block #3 {
    A$4 = phi #1:A$2, #3:A$6
    j$1 = iter
    A$6 = simple_set A$4[i$1, j$1] = $z
  }
  block #4 {
    A$5 = phi #1:A$2, #3:A$6
  }
end
";
        let err = plan(src, &CodegenOptions::default()).unwrap_err();
        assert!(matches!(err, LowerError::UnsupportedSchedule { .. }), "{err}");

        let src = src.replace(" schedule(cooperative)", "");
        let plan = plan(&src, &CodegenOptions::default()).unwrap();
        assert_eq!(plan.depth(), 2);
        assert_eq!(plan.reductions[0].loop_names, vec!["A$2", "A$4", "A$6", "A$5"]);
        assert_eq!(plan.reductions[0].final_name, "A$3");
        assert_eq!(plan.dimension(0), 1);
    }
}
