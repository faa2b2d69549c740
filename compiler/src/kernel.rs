// kernel.rs — OpenCL kernel generation from kernel plans
//
// Allocates and names the extracted kernel body, turns imports into kernel
// arguments, emits reduction strategies and positioning builtins, lowers the
// body with the parallel rule overrides and wraps it in the planned
// schedule. Also builds the host launch table entry for the replaced loop.
//
// Preconditions: `plan` came from `plan::plan_nest` on a function of
//                `program`.
// Postconditions: kernel arguments, launch arguments and the launcher
//                 prototype follow one order: imports, task counts, schedule
//                 values, reduction results.
// Failure modes: `LowerError` from allocation, strategy choice or lowering;
//                `Unsupported` when the kernel needs a newer OpenCL version
//                than allowed.
// Side effects: lowers helper instances into the shared `InstanceSet`.

use std::collections::HashSet;
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::alloc::{allocate_with, ForcedGroup, VariableNames};
use crate::codegen::{render_opencl_unit, render_type, reserved_names, CodegenOptions, Target};
use crate::diag::Diagnostic;
use crate::error::LowerError;
use crate::id::{BlockId, KernelId};
use crate::instances::InstanceSet;
use crate::lir::{BarrierScope, BinOp, CExpr, CFunction, CParam, CStmt, CType, Fence};
use crate::lower::{
    ctype, declarations, final_types, literal, lower_chain, lower_nested, mismatch, ForRule,
    GetOrFirstRule, LowerEnv, LowerState, LoweringRule, MatrixGetRule, MatrixSetRule, RuleTable,
    SimpleGetRule, SimpleSetRule, SizedNames,
};
use crate::plan::KernelPlan;
use crate::reduce::{choose_global, choose_local, identity, ReductionSite, StrategyContext};
use crate::schedule::{self, PosVar, Positioning, ScheduleKind, ScheduleShape, SubgroupMode};
use crate::ssa::{InstrTag, Instruction, ReductionKind, SizeRef, TypedProgram};
use crate::types::{AddressSpace, NumericKind, VarType};

// ── Versions and argument roles ─────────────────────────────────────────────

/// OpenCL C language version. Ordered; a kernel requires the maximum over
/// the features it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "2.0")]
    V2_0,
}

impl ClVersion {
    pub const ALL: [ClVersion; 4] = [
        ClVersion::V1_0,
        ClVersion::V1_1,
        ClVersion::V1_2,
        ClVersion::V2_0,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            ClVersion::V1_0 => "1.0",
            ClVersion::V1_1 => "1.1",
            ClVersion::V1_2 => "1.2",
            ClVersion::V2_0 => "2.0",
        }
    }
}

impl fmt::Display for ClVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of slots a local reduction buffer needs per work-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalSlots {
    One,
    SubGroups,
    LocalSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ArgumentRole {
    /// Imported raw buffer.
    Data,
    /// Imported element count.
    Numel,
    /// Imported size of dimension `dim` (0-based).
    Dim { dim: usize },
    /// Imported scalar value.
    Value,
    /// Task count of dimension `dim`.
    NumTasks { dim: usize },
    GlobalPerWorkItemBuffer { kind: String },
    GlobalPerWorkGroupBuffer { kind: String },
    LocalReductionBuffer { kind: String, slots: LocalSlots },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelArgument {
    pub name: String,
    #[serde(flatten)]
    pub role: ArgumentRole,
    /// Host SSA name the argument derives from.
    pub source: String,
    #[serde(rename = "type")]
    pub c_type: String,
}

// ── Launches ────────────────────────────────────────────────────────────────

/// One argument of the host-side launcher call.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchArg {
    Value(String),
    Data(String),
    Numel(String),
    Dim { matrix: String, dim: usize },
    /// `end - start + 1` of one nest level.
    NumTasks { start: String, end: String },
    ReductionInitial(String),
    /// Address the launcher stores the combined result to.
    ReductionResult(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchInfo {
    pub kernel: String,
    pub args: Vec<LaunchArg>,
    /// `void <kernel>_launch(...)`, defined by the host runtime.
    pub prototype: CFunction,
}

/// Launches of one host function, keyed by the block holding the replaced
/// outermost `For`.
pub type LaunchTable = IndexMap<BlockId, LaunchInfo>;

fn round_up(n: u64, to: u64) -> u64 {
    if to == 0 {
        return n;
    }
    n.div_ceil(to) * to
}

/// Global work size per dimension for concrete task counts.
pub fn launch_geometry(
    schedule: ScheduleKind,
    num_tasks: &[u64],
    local_sizes: &[u64],
    params: &[u64],
) -> Vec<u64> {
    num_tasks
        .iter()
        .enumerate()
        .map(|(d, &n)| {
            let l = local_sizes.get(d).copied().unwrap_or(1).max(1);
            let p = params.get(d).copied().unwrap_or(1).max(1);
            match schedule {
                ScheduleKind::Direct
                | ScheduleKind::Cooperative
                | ScheduleKind::SubgroupCooperative => round_up(n, l),
                ScheduleKind::CoarseSequential | ScheduleKind::CoarseRotation => {
                    round_up(n.div_ceil(p), l)
                }
                ScheduleKind::FixedWorkGroupsSequential
                | ScheduleKind::FixedWorkGroupsRotation => p * l,
            }
        })
        .collect()
}

// ── Kernel lowering context ─────────────────────────────────────────────────

/// Combine code of one distributed loop.
#[derive(Debug, Clone)]
pub struct LocalLoop {
    /// Accumulators reset to the identity on every lane but the first.
    pub identities: Vec<(String, CExpr)>,
    pub combine: Vec<CStmt>,
}

/// Read-only kernel context seen by the parallel rules.
#[derive(Debug, Clone)]
pub struct KernelEnv {
    pub schedule: ScheduleKind,
    pub mode: SubgroupMode,
    /// Induction variable of each nest level: dimension and start name.
    pub dims: IndexMap<String, (usize, String)>,
    pub local_loops: IndexMap<BlockId, LocalLoop>,
    /// Lane id and lane count of distributed loops.
    pub lane: Option<(CExpr, CExpr)>,
    /// Test selecting the lane that performs shared stores.
    pub leader: Option<CExpr>,
    pub set_barrier: Option<CStmt>,
}

impl KernelEnv {
    fn warp(&self) -> bool {
        self.schedule == ScheduleKind::SubgroupCooperative
            && matches!(self.mode, SubgroupMode::Warp(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct KernelState {
    /// Depth of distributed loops around the current instruction.
    pub distributed: usize,
}

// ── Parallel rules ──────────────────────────────────────────────────────────

/// `i = (T)task_id{d} + start` for the induction variable of a nest level.
pub struct ParallelIterRule;

impl LoweringRule for ParallelIterRule {
    fn name(&self) -> &'static str {
        "parallel_iter"
    }

    fn accepts(&self, instr: &Instruction, env: &LowerEnv<'_>, _state: &LowerState<'_>) -> bool {
        matches!(instr, Instruction::Iter { output }
            if env.kernel.is_some_and(|k| k.dims.contains_key(output)))
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Iter { output } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        let Some((d, start)) = env.kernel.and_then(|k| k.dims.get(output)) else {
            return Err(mismatch(self.name(), instr));
        };
        let id = CExpr::cast(ctype(env.ty(output)?)?, CExpr::var(schedule::task_id(*d)));
        out.push(CStmt::assign(
            env.name(output)?,
            CExpr::bin(BinOp::Add, id, env.value(start)?),
        ));
        Ok(())
    }
}

/// Spreads a local-reduction loop over the lanes of a cooperative task and
/// combines the lane accumulators afterwards.
pub struct CooperativeForRule;

impl LoweringRule for CooperativeForRule {
    fn name(&self) -> &'static str {
        "cooperative_for"
    }

    fn accepts(&self, instr: &Instruction, env: &LowerEnv<'_>, _state: &LowerState<'_>) -> bool {
        matches!(instr, Instruction::For { loop_block, .. }
            if env.kernel.is_some_and(|k| k.local_loops.contains_key(loop_block)))
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::For {
            start,
            end,
            loop_block,
            end_block,
            ..
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let Some(kernel) = env.kernel else {
            return Err(mismatch(self.name(), instr));
        };
        let (Some(local), Some((lane, lanes))) = (kernel.local_loops.get(loop_block), &kernel.lane)
        else {
            return Err(mismatch(self.name(), instr));
        };

        let resets: Vec<CStmt> = local
            .identities
            .iter()
            .map(|(acc, id)| CStmt::assign(acc.clone(), id.clone()))
            .collect();
        if !resets.is_empty() {
            out.push(CStmt::if_then(
                CExpr::bin(BinOp::Ne, lane.clone(), CExpr::Int(0)),
                resets,
            ));
        }

        let iter = ForRule::induction_var(env, state, *loop_block, start)?;
        let ty = ctype(env.ty(start)?)?;
        let init = CStmt::assign(
            iter.clone(),
            CExpr::bin(BinOp::Add, env.value(start)?, CExpr::cast(ty.clone(), lane.clone())),
        );
        let cond = CExpr::bin(BinOp::Le, CExpr::var(&iter), env.value(end)?);
        let step = CStmt::increment(iter.clone(), CExpr::cast(ty, lanes.clone()));

        if let Some(k) = state.kernel.as_mut() {
            k.distributed += 1;
        }
        let body = lower_nested(*loop_block, env, state);
        if let Some(k) = state.kernel.as_mut() {
            k.distributed -= 1;
        }
        out.push(CStmt::for_loop(init, cond, step, body?));
        out.extend(local.combine.iter().cloned());
        lower_chain(*end_block, env, state, out)
    }
}

/// Stores of cooperative schedules: one lane writes, then a global fence.
pub struct GatedSetRule;

impl LoweringRule for GatedSetRule {
    fn name(&self) -> &'static str {
        "gated_set"
    }

    fn accepts(&self, _instr: &Instruction, env: &LowerEnv<'_>, _state: &LowerState<'_>) -> bool {
        env.kernel.is_some_and(|k| k.schedule.is_cooperative())
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Some(kernel) = env.kernel else {
            return Err(mismatch(self.name(), instr));
        };
        let mut store = Vec::new();
        match instr {
            Instruction::SimpleSet { .. } => SimpleSetRule.apply(instr, env, state, &mut store)?,
            Instruction::MatrixSet { .. } => MatrixSetRule.apply(instr, env, state, &mut store)?,
            _ => return Err(mismatch(self.name(), instr)),
        }
        let distributed = state.kernel.as_ref().is_some_and(|k| k.distributed > 0);
        let mut cond = if distributed { None } else { kernel.leader.clone() };
        if kernel.warp() {
            let in_range = CExpr::var(schedule::IN_TASK_RANGE);
            cond = Some(match cond {
                Some(c) => CExpr::bin(BinOp::And, c, in_range),
                None => in_range,
            });
        }
        match cond {
            Some(c) => out.push(CStmt::if_then(c, store)),
            None => out.extend(store),
        }
        if !distributed {
            out.extend(kernel.set_barrier.clone());
        }
        Ok(())
    }
}

/// Warp-emulated subgroups run out-of-range lanes; their reads yield zero.
pub struct RangeGuardedReadRule;

impl LoweringRule for RangeGuardedReadRule {
    fn name(&self) -> &'static str {
        "range_guarded_read"
    }

    fn accepts(&self, _instr: &Instruction, env: &LowerEnv<'_>, _state: &LowerState<'_>) -> bool {
        env.kernel.is_some_and(KernelEnv::warp)
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let output = match instr {
            Instruction::SimpleGet { output, .. }
            | Instruction::MatrixGet { output, .. }
            | Instruction::GetOrFirst { output, .. } => output,
            _ => return Err(mismatch(self.name(), instr)),
        };
        let mut read = Vec::new();
        match instr {
            Instruction::SimpleGet { .. } => SimpleGetRule.apply(instr, env, state, &mut read)?,
            Instruction::MatrixGet { .. } => MatrixGetRule.apply(instr, env, state, &mut read)?,
            _ => GetOrFirstRule.apply(instr, env, state, &mut read)?,
        }
        let name = env.name(output)?;
        let zero = identity(ReductionKind::Sum, env.ty(output)?.elem());
        for stmt in read {
            out.push(match stmt {
                CStmt::Assign {
                    target: CExpr::Var(t),
                    value,
                } if t == name => CStmt::Assign {
                    target: CExpr::Var(t),
                    value: CExpr::ternary(CExpr::var(schedule::IN_TASK_RANGE), value, zero.clone()),
                },
                other => other,
            });
        }
        Ok(())
    }
}

/// Imports arrive as kernel arguments; known constants that were not
/// inlined are materialized.
pub struct InitializationRule;

impl LoweringRule for InitializationRule {
    fn name(&self) -> &'static str {
        "initialization"
    }

    fn accepts(&self, _instr: &Instruction, env: &LowerEnv<'_>, _state: &LowerState<'_>) -> bool {
        env.kernel.is_some()
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Initialization { name } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        if let Some(c) = env.ty(name)?.constant_value() {
            if !env.is_inlined(name)? {
                out.push(CStmt::assign(env.name(name)?, literal(c)));
            }
        }
        Ok(())
    }
}

/// Kernel bodies: base rules plus the parallel overrides.
pub fn parallel_rules() -> RuleTable {
    RuleTable::base()
        .with_override(InstrTag::Iter, Box::new(ParallelIterRule))
        .with_override(InstrTag::For, Box::new(CooperativeForRule))
        .with_override(InstrTag::SimpleSet, Box::new(GatedSetRule))
        .with_override(InstrTag::MatrixSet, Box::new(GatedSetRule))
        .with_override(InstrTag::SimpleGet, Box::new(RangeGuardedReadRule))
        .with_override(InstrTag::MatrixGet, Box::new(RangeGuardedReadRule))
        .with_override(InstrTag::GetOrFirst, Box::new(RangeGuardedReadRule))
        .with_override(InstrTag::Initialization, Box::new(InitializationRule))
}

// ── Generated kernels ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ReductionBinding {
    pub kind: ReductionKind,
    pub initial: String,
    pub final_name: String,
    pub strategy: &'static str,
}

#[derive(Debug, Clone)]
pub struct GeneratedKernel {
    pub id: KernelId,
    pub name: String,
    pub host: String,
    pub launch_block: BlockId,
    pub function: CFunction,
    pub arguments: Vec<KernelArgument>,
    pub version: ClVersion,
    pub extensions: Vec<String>,
    /// Instance keys of the helpers the kernel calls, callees first.
    pub helpers: Vec<String>,
    pub launch: LaunchInfo,
    pub schedule: ScheduleKind,
    pub local_sizes: Vec<SizeRef>,
    pub params: Vec<SizeRef>,
    pub reductions: Vec<ReductionBinding>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct ManifestReduction<'a> {
    kind: &'static str,
    initial: &'a str,
    #[serde(rename = "final")]
    final_name: &'a str,
    strategy: &'static str,
}

#[derive(Serialize)]
struct KernelManifest<'a> {
    name: &'a str,
    host: &'a str,
    launcher: &'a str,
    schedule: ScheduleKind,
    version: ClVersion,
    extensions: &'a [String],
    local_sizes: Vec<String>,
    schedule_params: Vec<String>,
    arguments: &'a [KernelArgument],
    reductions: Vec<ManifestReduction<'a>>,
}

impl GeneratedKernel {
    /// OpenCL program text: pragmas, helpers, kernel.
    pub fn source(&self, instances: &InstanceSet) -> String {
        let helpers: Vec<&CFunction> = self
            .helpers
            .iter()
            .filter_map(|k| instances.get(k))
            .map(|i| &i.function)
            .collect();
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        render_opencl_unit(&extensions, &helpers, &self.function)
    }

    /// Launcher-facing description of the kernel.
    pub fn manifest(&self) -> serde_json::Value {
        let manifest = KernelManifest {
            name: &self.name,
            host: &self.host,
            launcher: &self.launch.prototype.name,
            schedule: self.schedule,
            version: self.version,
            extensions: &self.extensions,
            local_sizes: self.local_sizes.iter().map(ToString::to_string).collect(),
            schedule_params: self.params.iter().map(ToString::to_string).collect(),
            arguments: &self.arguments,
            reductions: self
                .reductions
                .iter()
                .map(|r| ManifestReduction {
                    kind: r.kind.name(),
                    initial: &r.initial,
                    final_name: &r.final_name,
                    strategy: r.strategy,
                })
                .collect(),
        };
        serde_json::to_value(manifest).unwrap_or(serde_json::Value::Null)
    }
}

// ── Generation ──────────────────────────────────────────────────────────────

struct Arguments {
    params: Vec<CParam>,
    arguments: Vec<KernelArgument>,
    launch: Vec<LaunchArg>,
    prototype: Vec<CParam>,
}

impl Arguments {
    fn push(&mut self, param: CParam, role: ArgumentRole, source: &str) {
        self.arguments.push(KernelArgument {
            name: param.name.clone(),
            role,
            source: source.to_string(),
            c_type: render_type(&param.ty, Target::OpenCl),
        });
        self.params.push(param);
    }

    fn launch(&mut self, arg: LaunchArg, ty: CType, name: String) {
        self.launch.push(arg);
        self.prototype.push(CParam::new(ty, name));
    }
}

fn size_expr(size: &SizeRef, var: Option<&String>) -> CExpr {
    match (size, var) {
        (SizeRef::Const(n), _) => CExpr::Int(*n as i64),
        (SizeRef::Var(_), Some(name)) => CExpr::var(name),
        (SizeRef::Var(v), None) => CExpr::var(v),
    }
}

fn constant_of(ty: &VarType) -> Option<i64> {
    ty.constant_value().and_then(|c| c.as_i64())
}

fn has_double(ty: &CType) -> bool {
    ty.elem() == Some(NumericKind::Double)
}

/// Generate the kernel for `plan`.
#[instrument(skip_all, fields(kernel = %plan.name))]
pub fn generate_kernel(
    plan: &KernelPlan,
    program: &TypedProgram,
    options: &CodegenOptions,
    instances: &mut InstanceSet,
) -> Result<GeneratedKernel, LowerError> {
    let host = program
        .function(&plan.host)
        .ok_or_else(|| LowerError::UnknownCallee(plan.host.clone()))?;
    let kernel = &plan.kernel;
    let depth = plan.depth();
    let name = instances.reserve_name(&plan.name);

    // Accumulators start at the identity and the launcher folds the initial
    // value, so an extra copy recorded here has no use site in the kernel.
    let forced: Vec<ForcedGroup> = plan
        .reductions
        .iter()
        .map(|r| ForcedGroup {
            anchor: r.loop_names[0].clone(),
            names: r.loop_names[1..].to_vec(),
            initial: r.initial.clone(),
        })
        .collect();
    let alloc = allocate_with(kernel, &forced)?;
    let mut reserved = reserved_names(Target::OpenCl, options);
    reserved.extend(schedule::reserved_names());
    let mut names = VariableNames::assign(&alloc, &reserved);
    let emitted = |names: &VariableNames, ssa: &str| -> Result<String, LowerError> {
        names
            .try_final_name(ssa)
            .map(str::to_string)
            .ok_or_else(|| LowerError::malformed("kernel", format!("`{ssa}` was never allocated")))
    };

    // Imports, task counts and schedule values.
    let mut args = Arguments {
        params: Vec::new(),
        arguments: Vec::new(),
        launch: Vec::new(),
        prototype: Vec::new(),
    };
    let mut sized = IndexMap::new();
    let mut seen = HashSet::new();
    let size_ty = CType::Scalar(NumericKind::UInt64);
    for import in &plan.imports {
        let ty = kernel.type_of(import)?;
        if ty.constant_value().is_some() {
            continue;
        }
        let param = emitted(&names, import)?;
        if !seen.insert(param.clone()) {
            continue;
        }
        match ty.as_matrix() {
            Some(m) => {
                let cty = ctype(ty)?;
                args.push(CParam::new(cty.clone(), param.clone()), ArgumentRole::Data, import);
                args.launch(
                    LaunchArg::Data(import.clone()),
                    CType::Pointer(AddressSpace::Global, m.elem),
                    param.clone(),
                );
                if m.known_numel().is_none() {
                    let extra = SizedNames::reserve(&mut names, &param, m.rank());
                    for p in extra.params(size_ty.clone()) {
                        let role = if p.name == extra.numel {
                            ArgumentRole::Numel
                        } else {
                            let dim = extra.dims.iter().position(|d| *d == p.name).unwrap_or(0);
                            ArgumentRole::Dim { dim }
                        };
                        let launch = match role {
                            ArgumentRole::Dim { dim } => LaunchArg::Dim {
                                matrix: import.clone(),
                                dim,
                            },
                            _ => LaunchArg::Numel(import.clone()),
                        };
                        args.launch(launch, CType::SizeT, p.name.clone());
                        args.push(p, role, import);
                    }
                    sized.insert(param, extra);
                }
            }
            None => {
                let cty = ctype(ty)?;
                args.push(CParam::new(cty.clone(), param.clone()), ArgumentRole::Value, import);
                args.launch(LaunchArg::Value(import.clone()), ctype(host.type_of(import)?)?, param);
            }
        }
    }
    for d in 0..depth {
        let level = &plan.nest[depth - 1 - d];
        let n = schedule::num_tasks(d);
        args.push(
            CParam::new(size_ty.clone(), n.clone()),
            ArgumentRole::NumTasks { dim: d },
            &level.end,
        );
        args.launch(
            LaunchArg::NumTasks {
                start: level.start.clone(),
                end: level.end.clone(),
            },
            CType::SizeT,
            n,
        );
    }
    let mut factor_vars = IndexMap::new();
    for (d, p) in plan.params.iter().enumerate() {
        if let SizeRef::Var(v) = p {
            if plan.schedule.takes_factor() {
                let param = names.fresh(&format!("factor{d}"));
                args.push(CParam::new(size_ty.clone(), param.clone()), ArgumentRole::Value, v);
                args.launch(LaunchArg::Value(v.clone()), CType::SizeT, param.clone());
                factor_vars.insert(d, param);
            } else {
                args.launch(LaunchArg::Value(v.clone()), CType::SizeT, format!("work_groups{d}"));
            }
        }
    }
    for (d, l) in plan.local_sizes.iter().enumerate() {
        if let SizeRef::Var(v) = l {
            args.launch(LaunchArg::Value(v.clone()), CType::SizeT, format!("local_size{d}"));
        }
    }

    // Reduction strategies.
    let mode = if options.warp_fallback {
        SubgroupMode::Warp(options.sub_group_size)
    } else {
        SubgroupMode::Hardware
    };
    let mut pos = Positioning::new(mode);
    let local_size0 = plan.local_sizes.first().and_then(SizeRef::constant);
    let mut version = ClVersion::V1_0;
    let mut extensions: IndexSet<String> = IndexSet::new();
    let mut init = Vec::new();
    let mut finalize = Vec::new();
    let mut bindings = Vec::new();
    let mut results = Vec::new();
    for r in &plan.reductions {
        let site = ReductionSite {
            kind: r.kind,
            accumulator: emitted(&names, &r.loop_names[0])?,
            elem: r.elem,
            source: r.final_name.clone(),
        };
        let strategy = choose_global(&plan.strategies, r.kind, plan.schedule)?;
        let mut ctx = StrategyContext {
            schedule: plan.schedule,
            depth,
            pos: &mut pos,
            names: &mut names,
            local_size0,
        };
        let code = strategy.emit(&site, &mut ctx)?;
        debug!(reduction = %r.final_name, strategy = code.strategy, "global reduction");
        version = version.max(code.version);
        extensions.extend(code.extensions.iter().map(|e| e.to_string()));
        init.extend(code.init);
        finalize.extend(code.finalize);
        for p in code.params {
            args.push(p.param, p.role, &p.source);
        }
        if r.kind.is_scalar() {
            results.push((r, site.accumulator.clone()));
        }
        bindings.push(ReductionBinding {
            kind: r.kind,
            initial: r.initial.clone(),
            final_name: r.final_name.clone(),
            strategy: code.strategy,
        });
    }
    for (r, acc) in results {
        let elem = CType::Scalar(r.elem);
        args.launch(
            LaunchArg::ReductionInitial(r.initial.clone()),
            elem.clone(),
            format!("{acc}_initial"),
        );
        args.launch(
            LaunchArg::ReductionResult(r.final_name.clone()),
            CType::Ref(Box::new(elem)),
            format!("{acc}_result"),
        );
    }

    let mut local_loops = IndexMap::new();
    for l in &plan.local_reductions {
        let mut identities = Vec::new();
        let mut combine = Vec::new();
        for site in &l.sites {
            let acc = emitted(&names, &site.phi)?;
            let rs = ReductionSite {
                kind: site.kind,
                accumulator: acc.clone(),
                elem: site.elem,
                source: site.phi.clone(),
            };
            let strategy =
                choose_local(&plan.local_strategies, site.kind, plan.schedule, mode, local_size0)?;
            let mut ctx = StrategyContext {
                schedule: plan.schedule,
                depth,
                pos: &mut pos,
                names: &mut names,
                local_size0,
            };
            let code = strategy.emit(&rs, &mut ctx)?;
            debug!(accumulator = %acc, strategy = code.strategy, "local reduction");
            version = version.max(code.version);
            extensions.extend(code.extensions.iter().map(|e| e.to_string()));
            combine.extend(code.combine);
            for p in code.params {
                args.push(p.param, p.role, &p.source);
            }
            identities.push((acc, identity(site.kind, site.elem)));
        }
        local_loops.insert(l.loop_block, LocalLoop { identities, combine });
    }

    // Cooperative lanes and leaders.
    let lane = match plan.schedule {
        _ if local_loops.is_empty() => None,
        ScheduleKind::Cooperative => {
            Some((pos.get(PosVar::LocalId(0)), pos.get(PosVar::LocalSize(0))))
        }
        ScheduleKind::SubgroupCooperative => Some((
            pos.get(PosVar::SubGroupLocalId),
            pos.get(PosVar::SubGroupSize),
        )),
        _ => None,
    };
    let has_sets = kernel.body.blocks.iter().any(|b| {
        b.instructions
            .iter()
            .any(|i| matches!(i, Instruction::SimpleSet { .. } | Instruction::MatrixSet { .. }))
    });
    let (leader, set_barrier) = match plan.schedule {
        ScheduleKind::Cooperative if has_sets => (
            Some(CExpr::bin(BinOp::Eq, pos.get(PosVar::LocalId(0)), CExpr::Int(0))),
            Some(CStmt::Barrier {
                scope: BarrierScope::WorkGroup,
                fence: Fence::Global,
            }),
        ),
        ScheduleKind::SubgroupCooperative if has_sets => {
            let scope = match mode {
                SubgroupMode::Hardware => BarrierScope::SubGroup,
                SubgroupMode::Warp(_) => BarrierScope::WorkGroup,
            };
            (
                Some(CExpr::bin(BinOp::Eq, pos.get(PosVar::SubGroupLocalId), CExpr::Int(0))),
                Some(CStmt::Barrier {
                    scope,
                    fence: Fence::Global,
                }),
            )
        }
        _ => (None, None),
    };

    let dims: IndexMap<String, (usize, String)> = plan
        .nest
        .iter()
        .enumerate()
        .filter_map(|(k, level)| {
            level
                .iter
                .clone()
                .map(|it| (it, (plan.dimension(k), level.start.clone())))
        })
        .collect();
    let kenv = KernelEnv {
        schedule: plan.schedule,
        mode,
        dims,
        local_loops,
        lane,
        leader,
        set_barrier,
    };

    // Body.
    let types = final_types(kernel, &names);
    let rules = parallel_rules();
    let env = LowerEnv {
        function: kernel,
        program,
        names: &names,
        final_types: &types,
        sized: &sized,
        options,
        target: Target::OpenCl,
        rules: &rules,
        kernel: Some(&kenv),
        launches: None,
    };
    let mut state = LowerState::new(instances);
    state.kernel = Some(KernelState::default());
    let mut lowered = Vec::new();
    lower_chain(BlockId::ENTRY, &env, &mut state, &mut lowered)?;

    let exact: Vec<bool> = (0..depth)
        .map(|d| {
            let level = &plan.nest[depth - 1 - d];
            let start = host.raw_type(&level.start).and_then(constant_of);
            let end = host.raw_type(&level.end).and_then(constant_of);
            match (start, end, plan.local_sizes.get(d).and_then(SizeRef::constant)) {
                (Some(s), Some(e), Some(l)) if e >= s && l > 0 => ((e - s + 1) as u64) % l == 0,
                _ => false,
            }
        })
        .collect();
    let shape = ScheduleShape {
        kind: plan.schedule,
        depth,
        factors: plan
            .params
            .iter()
            .enumerate()
            .map(|(d, p)| size_expr(p, factor_vars.get(&d)))
            .collect(),
        exact,
    };
    let scheduled = schedule::emit(&shape, &mut pos, lowered);

    let mut body = pos.declarations();
    body.extend(init);
    body.extend(scheduled);
    body.extend(finalize);
    let skip: HashSet<String> = args.params.iter().map(|p| p.name.clone()).collect();
    let decls = declarations(&body, &skip, &state.locals, &types)?;
    let positions = pos.declarations().len();
    let mut full: Vec<CStmt> = body.drain(..positions).collect();
    full.extend(decls);
    full.extend(body);

    // Version, extensions and attributes.
    let helpers: Vec<String> = state
        .instances
        .closure(&state.called)
        .iter()
        .map(|i| i.key.clone())
        .collect();
    let uses_double = args.params.iter().any(|p| has_double(&p.ty))
        || types.values().any(|t| t.elem() == NumericKind::Double)
        || state.locals.values().any(has_double)
        || helpers.iter().filter_map(|k| state.instances.get(k)).any(|i| {
            has_double(&i.function.ret) || i.function.params.iter().any(|p| has_double(&p.ty))
        });
    let mut ordered = IndexSet::new();
    if uses_double {
        ordered.insert("cl_khr_fp64".to_string());
    }
    if pos.uses_hardware_subgroups() {
        version = version.max(ClVersion::V2_0);
        extensions.insert("cl_khr_subgroups".to_string());
    }
    ordered.extend(extensions);
    if let Some(max) = options.max_cl_version {
        if version > max {
            return Err(LowerError::Unsupported(format!(
                "kernel `{name}` needs OpenCL {version}, above the allowed {max}"
            )));
        }
    }
    let constant_sizes: Option<Vec<u64>> = plan.local_sizes.iter().map(SizeRef::constant).collect();
    let attributes = match constant_sizes {
        Some(sizes) => {
            let at = |d: usize| sizes.get(d).copied().unwrap_or(1);
            vec![format!("reqd_work_group_size({}, {}, {})", at(0), at(1), at(2))]
        }
        None => Vec::new(),
    };

    let mut diagnostics = plan.diagnostics.clone();
    diagnostics.append(&mut state.diagnostics);
    let function = CFunction {
        qualifiers: vec!["__kernel".into()],
        attributes,
        ret: CType::Void,
        name: name.clone(),
        params: args.params,
        body: full,
    };
    let launch = LaunchInfo {
        kernel: name.clone(),
        args: args.launch,
        prototype: CFunction {
            qualifiers: Vec::new(),
            attributes: Vec::new(),
            ret: CType::Void,
            name: format!("{name}_launch"),
            params: args.prototype,
            body: Vec::new(),
        },
    };
    debug!(
        %name,
        arguments = args.arguments.len(),
        %version,
        helpers = helpers.len(),
        "kernel generated"
    );
    Ok(GeneratedKernel {
        id: plan.id,
        name,
        host: plan.host.clone(),
        launch_block: plan.launch_block(),
        function,
        arguments: args.arguments,
        version,
        extensions: ordered.into_iter().collect(),
        helpers,
        launch,
        schedule: plan.schedule,
        local_sizes: plan.local_sizes.clone(),
        params: plan.params.clone(),
        reductions: bindings,
        diagnostics,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::render_function;
    use crate::lir::count_barriers;
    use crate::parser::parse;
    use crate::plan::plan_nest;

    fn generate(
        source: &str,
        options: &CodegenOptions,
    ) -> Result<(GeneratedKernel, InstanceSet), LowerError> {
        let result = parse(source);
        assert!(result.errors.is_empty(), "parse errors: {:?}", result.errors);
        let program = result.program.unwrap();
        let f = &program.functions[0];
        let plan = plan_nest(f, &f.parallel[0], options, KernelId(0))?;
        let mut instances = InstanceSet::new();
        let kernel = generate_kernel(&plan, &program, options, &mut instances)?;
        Ok((kernel, instances))
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
    fn elementwise_kernel_signature_and_body() {
        let (k, _) = generate(SCALE, &CodegenOptions::default()).unwrap();
        let text = render_function(&k.function, Target::OpenCl);
        assert!(
            text.starts_with(
                "__kernel __attribute__((reqd_work_group_size(128, 1, 1))) void scale_0(__global double* A, ulong A_numel, ulong A_dim1, __global double* B, ulong B_numel, ulong B_dim1, ulong num_tasks0) {\n"
            ),
            "{text}"
        );
        assert!(text.contains("size_t global_id0 = get_global_id(0);"), "{text}");
        assert!(text.contains("if (task_id0 < num_tasks0) {"), "{text}");
        assert!(text.contains("i = (int)task_id0 + 1;"), "{text}");
        assert!(text.contains("B[i - 1] = b;"), "{text}");
        assert_eq!(k.extensions, vec!["cl_khr_fp64"]);
        assert_eq!(k.version, ClVersion::V1_0);
        assert_eq!(k.reductions[0].strategy, "matrix_set");
    }

    #[test]
    fn launch_arguments_follow_kernel_order() {
        let (k, _) = generate(SCALE, &CodegenOptions::default()).unwrap();
        assert_eq!(
            k.launch.args,
            vec![
                LaunchArg::Data("A$1".into()),
                LaunchArg::Numel("A$1".into()),
                LaunchArg::Dim {
                    matrix: "A$1".into(),
                    dim: 0
                },
                LaunchArg::Data("B$2".into()),
                LaunchArg::Numel("B$2".into()),
                LaunchArg::Dim {
                    matrix: "B$2".into(),
                    dim: 0
                },
                LaunchArg::NumTasks {
                    start: "$one".into(),
                    end: "n$1".into()
                },
            ]
        );
        assert_eq!(k.launch.prototype.name, "scale_0_launch");
        let roles: Vec<&ArgumentRole> = k.arguments.iter().map(|a| &a.role).collect();
        assert_eq!(roles[0], &ArgumentRole::Data);
        assert_eq!(roles[2], &ArgumentRole::Dim { dim: 0 });
        assert_eq!(roles[6], &ArgumentRole::NumTasks { dim: 0 });
    }

    #[test]
    fn sum_kernel_writes_partials_then_fences_once() {
        let (k, _) = generate(SUM, &CodegenOptions::default()).unwrap();
        let text = render_function(&k.function, Target::OpenCl);
        assert!(text.contains("s = 0.0;"), "{text}");
        assert!(text.contains("s = s + a;"), "{text}");
        assert!(text.contains("s_partial[global_id0] = s;"), "{text}");
        assert_eq!(count_barriers(&k.function.body), 1);
        assert_eq!(k.reductions[0].strategy, "per_work_item");
        assert_eq!(
            k.launch.args[k.launch.args.len() - 2..],
            [
                LaunchArg::ReductionInitial("s$1".into()),
                LaunchArg::ReductionResult("s$4".into()),
            ]
        );
        let last = k.arguments.last().unwrap();
        assert_eq!(last.name, "s_partial");
        assert_eq!(last.source, "s$4");
    }

    #[test]
    fn manifest_serializes_roles() {
        let (k, _) = generate(SUM, &CodegenOptions::default()).unwrap();
        let m = k.manifest();
        assert_eq!(m["name"], "total_0");
        assert_eq!(m["launcher"], "total_0_launch");
        assert_eq!(m["schedule"], "direct");
        assert_eq!(m["version"], "1.0");
        let last = m["arguments"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["role"], "global_per_work_item_buffer");
        assert_eq!(last["kind"], "sum");
        assert_eq!(last["type"], "__global double*");
        assert_eq!(m["reductions"][0]["final"], "s$4");
    }

    #[test]
    fn version_cap_rejects_work_group_builtins() {
        let options = CodegenOptions {
            reduction_strategies: vec![crate::reduce::GlobalStrategyKind::WorkGroupBuiltin],
            max_cl_version: Some(ClVersion::V1_2),
            ..CodegenOptions::default()
        };
        let err = generate(SUM, &options).unwrap_err();
        assert!(matches!(err, LowerError::Unsupported(_)), "{err}");

        let options = CodegenOptions {
            max_cl_version: None,
            ..options
        };
        let (k, _) = generate(SUM, &options).unwrap();
        assert_eq!(k.version, ClVersion::V2_0);
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
    fn cooperative_kernel_distributes_inner_loop() {
        let options = CodegenOptions {
            try_cooperative: true,
            ..CodegenOptions::default()
        };
        let (k, _) = generate(ROW_SUMS, &options).unwrap();
        assert_eq!(k.schedule, ScheduleKind::Cooperative);
        let text = render_function(&k.function, Target::OpenCl);
        assert!(text.contains("if (local_id0 != 0) {"), "{text}");
        assert!(
            text.contains("for (j = 1 + (int)local_id0; j <= n; j += (int)local_size0) {"),
            "{text}"
        );
        assert!(text.contains("if (local_id0 == 0) {"), "{text}");
        assert!(text.contains("barrier(CLK_GLOBAL_MEM_FENCE);"), "{text}");
        assert!(k
            .arguments
            .iter()
            .any(|a| matches!(a.role, ArgumentRole::LocalReductionBuffer { .. })));
    }

    #[test]
    fn hardware_subgroups_require_cl2() {
        let options = CodegenOptions {
            try_cooperative: true,
            prefer_subgroup: true,
            ..CodegenOptions::default()
        };
        let (k, _) = generate(ROW_SUMS, &options).unwrap();
        assert_eq!(k.schedule, ScheduleKind::SubgroupCooperative);
        assert_eq!(k.version, ClVersion::V2_0);
        assert!(k.extensions.contains(&"cl_khr_subgroups".to_string()));
        let text = render_function(&k.function, Target::OpenCl);
        assert!(text.contains("sub_group_reduce_add(s)"), "{text}");
        assert!(text.contains("sub_group_barrier(CLK_GLOBAL_MEM_FENCE);"), "{text}");
    }

    #[test]
    fn warp_fallback_guards_reads_and_writes() {
        let options = CodegenOptions {
            try_cooperative: true,
            prefer_subgroup: true,
            warp_fallback: true,
            ..CodegenOptions::default()
        };
        let (k, _) = generate(ROW_SUMS, &options).unwrap();
        assert_eq!(k.version, ClVersion::V1_0);
        assert!(!k.extensions.contains(&"cl_khr_subgroups".to_string()));
        let text = render_function(&k.function, Target::OpenCl);
        assert!(text.contains("size_t sub_group_size = 32;"), "{text}");
        assert!(text.contains("a = in_task_range ? "), "{text}");
        assert!(text.contains("if ((sub_group_local_id == 0) && in_task_range) {"), "{text}");
        assert!(!text.contains("sub_group_barrier"), "{text}");
    }

    #[test]
    fn geometry_per_schedule() {
        assert_eq!(launch_geometry(ScheduleKind::Direct, &[100], &[32], &[1]), vec![128]);
        assert_eq!(launch_geometry(ScheduleKind::Cooperative, &[3], &[64], &[1]), vec![64]);
        assert_eq!(launch_geometry(ScheduleKind::CoarseSequential, &[100], &[8], &[4]), vec![32]);
        assert_eq!(
            launch_geometry(ScheduleKind::FixedWorkGroupsRotation, &[1000, 7], &[16, 1], &[2, 3]),
            vec![32, 3]
        );
        assert_eq!(ClVersion::from_name("1.2"), Some(ClVersion::V1_2));
        assert!(ClVersion::V1_2 < ClVersion::V2_0);
    }
}
