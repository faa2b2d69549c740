// reduce.rs — Global and local reduction strategies for generated kernels
//
// A global reduction combines one accumulator per work-item into partial
// results the host folds together with the reduction's initial value. A local
// reduction combines the lanes of one cooperative task and broadcasts the
// result back to every lane. Strategies are tried in ranked order; the first
// that applies to the reduction kind and schedule wins.
//
// Preconditions: accumulators are declared kernel variables of `elem` type.
// Postconditions: every emitted global finalization ends with exactly one
//                 `CLK_GLOBAL_MEM_FENCE` barrier executed by all work-items.
// Failure modes: `NoReductionStrategy` when no ranked strategy applies.
// Side effects: reserves helper names in `VariableNames`; records builtins in
//               `Positioning`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alloc::VariableNames;
use crate::codegen::Target;
use crate::error::LowerError;
use crate::kernel::{ArgumentRole, ClVersion, LocalSlots};
use crate::lir::{BarrierScope, BinOp, CExpr, CParam, CStmt, CType, Fence};
use crate::ops;
use crate::schedule::{PosVar, Positioning, ScheduleKind, SubgroupMode};
use crate::ssa::ReductionKind;
use crate::types::{AddressSpace, NumericKind};

// ── Strategy kinds ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStrategyKind {
    PerWorkItem,
    LocalMemory,
    WorkGroupBuiltin,
    MatrixSet,
}

impl GlobalStrategyKind {
    pub const ALL: [GlobalStrategyKind; 4] = [
        GlobalStrategyKind::PerWorkItem,
        GlobalStrategyKind::LocalMemory,
        GlobalStrategyKind::WorkGroupBuiltin,
        GlobalStrategyKind::MatrixSet,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            GlobalStrategyKind::PerWorkItem => "per_work_item",
            GlobalStrategyKind::LocalMemory => "local_memory",
            GlobalStrategyKind::WorkGroupBuiltin => "work_group_builtin",
            GlobalStrategyKind::MatrixSet => "matrix_set",
        }
    }
}

impl fmt::Display for GlobalStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStrategyKind {
    Simple,
    Interleaved,
    SubGroupBuiltin,
    WarpLocalMemory,
}

impl LocalStrategyKind {
    pub const ALL: [LocalStrategyKind; 4] = [
        LocalStrategyKind::Simple,
        LocalStrategyKind::Interleaved,
        LocalStrategyKind::SubGroupBuiltin,
        LocalStrategyKind::WarpLocalMemory,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            LocalStrategyKind::Simple => "simple",
            LocalStrategyKind::Interleaved => "interleaved",
            LocalStrategyKind::SubGroupBuiltin => "sub_group_builtin",
            LocalStrategyKind::WarpLocalMemory => "warp_local_memory",
        }
    }
}

impl fmt::Display for LocalStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Shared helpers ──────────────────────────────────────────────────────────

/// Starting value of an accumulator of `kind`.
pub fn identity(kind: ReductionKind, elem: NumericKind) -> CExpr {
    match kind {
        ReductionKind::Sum | ReductionKind::MatrixSet => {
            if elem.is_float() {
                CExpr::Float(0.0)
            } else {
                CExpr::Int(0)
            }
        }
        ReductionKind::Min => extreme(elem, true),
        ReductionKind::Max => extreme(elem, false),
    }
}

fn extreme(elem: NumericKind, largest: bool) -> CExpr {
    if elem.is_float() {
        return CExpr::Float(if largest { f64::INFINITY } else { f64::NEG_INFINITY });
    }
    let (max, min): (i64, i64) = match elem {
        NumericKind::Int8 => (i8::MAX as i64, i8::MIN as i64),
        NumericKind::Int16 => (i16::MAX as i64, i16::MIN as i64),
        NumericKind::Int32 => (i32::MAX as i64, i32::MIN as i64),
        NumericKind::Int64 => (i64::MAX, i64::MIN),
        NumericKind::UInt8 => (u8::MAX as i64, 0),
        NumericKind::UInt16 => (u16::MAX as i64, 0),
        NumericKind::UInt32 => (u32::MAX as i64, 0),
        NumericKind::Bool => (1, 0),
        NumericKind::UInt64 => {
            return if largest {
                CExpr::Raw(elem.max_literal().into())
            } else {
                CExpr::Int(0)
            };
        }
        NumericKind::Single | NumericKind::Double => unreachable!("handled above"),
    };
    match (largest, min) {
        (true, _) => CExpr::Int(max),
        // The most negative literal is not expressible directly in C.
        (false, m) if m < 0 => CExpr::bin(BinOp::Sub, CExpr::Int(m + 1), CExpr::Int(1)),
        (false, m) => CExpr::Int(m),
    }
}

/// `a ⊕ b` for a scalar reduction kind.
pub fn combine(kind: ReductionKind, a: CExpr, b: CExpr, elem: NumericKind) -> CExpr {
    match kind {
        ReductionKind::Min => ops::min_max(false, a, b, elem, Target::OpenCl),
        ReductionKind::Max => ops::min_max(true, a, b, elem, Target::OpenCl),
        ReductionKind::Sum | ReductionKind::MatrixSet => CExpr::bin(BinOp::Add, a, b),
    }
}

/// Suffix of the OpenCL `*_reduce_<op>` builtins.
fn builtin_op(kind: ReductionKind) -> &'static str {
    match kind {
        ReductionKind::Min => "min",
        ReductionKind::Max => "max",
        ReductionKind::Sum | ReductionKind::MatrixSet => "add",
    }
}

fn eq_zero(e: CExpr) -> CExpr {
    CExpr::bin(BinOp::Eq, e, CExpr::Int(0))
}

fn barrier(scope: BarrierScope, fence: Fence) -> CStmt {
    CStmt::Barrier { scope, fence }
}

/// `acc = acc ⊕ buf[base + k]` for `k` in `1..count`.
fn fold_slots(
    site: &ReductionSite,
    buffer: &str,
    base: Option<CExpr>,
    count: CExpr,
    names: &mut VariableNames,
) -> CStmt {
    let k = names.fresh("slot");
    let index = match base {
        Some(b) => CExpr::bin(BinOp::Add, b, CExpr::var(&k)),
        None => CExpr::var(&k),
    };
    let acc = CExpr::var(&site.accumulator);
    CStmt::for_loop(
        CStmt::decl(CType::SizeT, k.clone(), Some(CExpr::Int(1))),
        CExpr::bin(BinOp::Lt, CExpr::var(&k), count),
        CStmt::increment(k.clone(), CExpr::Int(1)),
        vec![CStmt::assign(
            &site.accumulator,
            combine(site.kind, acc, CExpr::index(CExpr::var(buffer), index), site.elem),
        )],
    )
}

// ── Sites, contexts and results ─────────────────────────────────────────────

/// One reduction as seen by the kernel generator.
#[derive(Debug, Clone)]
pub struct ReductionSite {
    pub kind: ReductionKind,
    /// Emitted name of the kernel accumulator (or data buffer for
    /// `matrix_set`).
    pub accumulator: String,
    pub elem: NumericKind,
    /// SSA name the host binds the result to.
    pub source: String,
}

pub struct StrategyContext<'a> {
    pub schedule: ScheduleKind,
    pub depth: usize,
    pub pos: &'a mut Positioning,
    pub names: &'a mut VariableNames,
    /// Constant size of local dimension 0, when known.
    pub local_size0: Option<u64>,
}

/// A kernel parameter contributed by a strategy.
#[derive(Debug, Clone)]
pub struct StrategyParam {
    pub param: CParam,
    pub role: ArgumentRole,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct ReductionCode {
    pub strategy: &'static str,
    pub params: Vec<StrategyParam>,
    pub init: Vec<CStmt>,
    pub finalize: Vec<CStmt>,
    pub version: ClVersion,
    pub extensions: Vec<&'static str>,
}

impl ReductionCode {
    fn new(strategy: &'static str) -> Self {
        Self {
            strategy,
            params: Vec::new(),
            init: Vec::new(),
            finalize: Vec::new(),
            version: ClVersion::V1_0,
            extensions: Vec::new(),
        }
    }

    fn buffer(
        &mut self,
        names: &mut VariableNames,
        site: &ReductionSite,
        space: AddressSpace,
        suffix: &str,
        role: ArgumentRole,
    ) -> String {
        let name = names.fresh(&format!("{}_{suffix}", site.accumulator));
        self.params.push(StrategyParam {
            param: CParam::new(CType::Pointer(space, site.elem), name.clone()),
            role,
            source: site.source.clone(),
        });
        name
    }

    fn start_at_identity(&mut self, site: &ReductionSite) {
        self.init
            .push(CStmt::assign(&site.accumulator, identity(site.kind, site.elem)));
    }
}

// ── Global strategies ───────────────────────────────────────────────────────

pub trait ReductionStrategy: Sync {
    fn kind(&self) -> GlobalStrategyKind;
    fn applies_to(&self, kind: ReductionKind, schedule: ScheduleKind) -> bool;
    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<ReductionCode, LowerError>;
}

struct PerWorkItem;

impl ReductionStrategy for PerWorkItem {
    fn kind(&self) -> GlobalStrategyKind {
        GlobalStrategyKind::PerWorkItem
    }

    fn applies_to(&self, kind: ReductionKind, schedule: ScheduleKind) -> bool {
        kind.is_scalar() && !schedule.is_cooperative()
    }

    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<ReductionCode, LowerError> {
        let mut code = ReductionCode::new(self.kind().name());
        let buf = code.buffer(
            ctx.names,
            site,
            AddressSpace::Global,
            "partial",
            ArgumentRole::GlobalPerWorkItemBuffer {
                kind: site.kind.name().into(),
            },
        );
        code.start_at_identity(site);
        let slot = ctx.pos.global_linear_id(ctx.depth);
        code.finalize.push(CStmt::Assign {
            target: CExpr::index(CExpr::var(buf), slot),
            value: CExpr::var(&site.accumulator),
        });
        code.finalize
            .push(barrier(BarrierScope::WorkGroup, Fence::Global));
        Ok(code)
    }
}

struct LocalMemory;

impl ReductionStrategy for LocalMemory {
    fn kind(&self) -> GlobalStrategyKind {
        GlobalStrategyKind::LocalMemory
    }

    fn applies_to(&self, kind: ReductionKind, _schedule: ScheduleKind) -> bool {
        kind.is_scalar()
    }

    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<ReductionCode, LowerError> {
        let mut code = ReductionCode::new(self.kind().name());
        let slots = match ctx.schedule {
            ScheduleKind::Cooperative => LocalSlots::One,
            ScheduleKind::SubgroupCooperative => LocalSlots::SubGroups,
            _ => LocalSlots::LocalSize,
        };
        let local = code.buffer(
            ctx.names,
            site,
            AddressSpace::Local,
            "local",
            ArgumentRole::LocalReductionBuffer {
                kind: site.kind.name().into(),
                slots,
            },
        );
        let groups = code.buffer(
            ctx.names,
            site,
            AddressSpace::Global,
            "groups",
            ArgumentRole::GlobalPerWorkGroupBuffer {
                kind: site.kind.name().into(),
            },
        );
        code.start_at_identity(site);

        let acc = CExpr::var(&site.accumulator);
        let (writer, slot, count) = match ctx.schedule {
            ScheduleKind::Cooperative => (
                Some(eq_zero(ctx.pos.get(PosVar::LocalId(0)))),
                CExpr::Int(0),
                CExpr::Int(1),
            ),
            ScheduleKind::SubgroupCooperative => (
                Some(eq_zero(ctx.pos.get(PosVar::SubGroupLocalId))),
                ctx.pos.get(PosVar::SubGroupId),
                ctx.pos.get(PosVar::NumSubGroups),
            ),
            _ => (
                None,
                ctx.pos.local_linear_id(ctx.depth),
                ctx.pos.local_linear_size(ctx.depth),
            ),
        };
        let write = CStmt::Assign {
            target: CExpr::index(CExpr::var(&local), slot),
            value: acc.clone(),
        };
        code.finalize.push(match writer {
            Some(cond) => CStmt::if_then(cond, vec![write]),
            None => write,
        });
        code.finalize
            .push(barrier(BarrierScope::WorkGroup, Fence::Local));

        let leader = eq_zero(ctx.pos.local_linear_id(ctx.depth));
        let group = ctx.pos.group_linear_id(ctx.depth);
        let fold = vec![
            CStmt::assign(
                &site.accumulator,
                CExpr::index(CExpr::var(&local), CExpr::Int(0)),
            ),
            fold_slots(site, &local, None, count, ctx.names),
            CStmt::Assign {
                target: CExpr::index(CExpr::var(&groups), group),
                value: acc,
            },
        ];
        code.finalize.push(CStmt::if_then(leader, fold));
        code.finalize
            .push(barrier(BarrierScope::WorkGroup, Fence::Global));
        Ok(code)
    }
}

struct WorkGroupBuiltin;

impl ReductionStrategy for WorkGroupBuiltin {
    fn kind(&self) -> GlobalStrategyKind {
        GlobalStrategyKind::WorkGroupBuiltin
    }

    fn applies_to(&self, kind: ReductionKind, schedule: ScheduleKind) -> bool {
        kind.is_scalar() && !schedule.is_cooperative()
    }

    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<ReductionCode, LowerError> {
        let mut code = ReductionCode::new(self.kind().name());
        code.version = ClVersion::V2_0;
        let groups = code.buffer(
            ctx.names,
            site,
            AddressSpace::Global,
            "groups",
            ArgumentRole::GlobalPerWorkGroupBuffer {
                kind: site.kind.name().into(),
            },
        );
        code.start_at_identity(site);
        let acc = CExpr::var(&site.accumulator);
        code.finalize.push(CStmt::assign(
            &site.accumulator,
            CExpr::call(
                format!("work_group_reduce_{}", builtin_op(site.kind)),
                vec![acc.clone()],
            ),
        ));
        let leader = eq_zero(ctx.pos.local_linear_id(ctx.depth));
        let group = ctx.pos.group_linear_id(ctx.depth);
        code.finalize.push(CStmt::if_then(
            leader,
            vec![CStmt::Assign {
                target: CExpr::index(CExpr::var(groups), group),
                value: acc,
            }],
        ));
        code.finalize
            .push(barrier(BarrierScope::WorkGroup, Fence::Global));
        Ok(code)
    }
}

/// Element-wise writes land in the imported buffer directly.
struct InPlaceMatrixSet;

impl ReductionStrategy for InPlaceMatrixSet {
    fn kind(&self) -> GlobalStrategyKind {
        GlobalStrategyKind::MatrixSet
    }

    fn applies_to(&self, kind: ReductionKind, _schedule: ScheduleKind) -> bool {
        kind == ReductionKind::MatrixSet
    }

    fn emit(
        &self,
        _site: &ReductionSite,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<ReductionCode, LowerError> {
        Ok(ReductionCode::new(self.kind().name()))
    }
}

pub fn global_strategy(kind: GlobalStrategyKind) -> &'static dyn ReductionStrategy {
    match kind {
        GlobalStrategyKind::PerWorkItem => &PerWorkItem,
        GlobalStrategyKind::LocalMemory => &LocalMemory,
        GlobalStrategyKind::WorkGroupBuiltin => &WorkGroupBuiltin,
        GlobalStrategyKind::MatrixSet => &InPlaceMatrixSet,
    }
}

/// First ranked strategy applicable to `kind` under `schedule`.
pub fn choose_global(
    ranked: &[GlobalStrategyKind],
    kind: ReductionKind,
    schedule: ScheduleKind,
) -> Result<&'static dyn ReductionStrategy, LowerError> {
    ranked
        .iter()
        .map(|k| global_strategy(*k))
        .find(|s| s.applies_to(kind, schedule))
        .ok_or_else(|| LowerError::NoReductionStrategy {
            scope: "global",
            kind: kind.name().into(),
            schedule: schedule.name().into(),
        })
}

// ── Local strategies ────────────────────────────────────────────────────────

/// Code combining one accumulator across the lanes of a cooperative task.
#[derive(Debug, Clone)]
pub struct LocalReductionCode {
    pub strategy: &'static str,
    pub params: Vec<StrategyParam>,
    pub combine: Vec<CStmt>,
    pub version: ClVersion,
    pub extensions: Vec<&'static str>,
}

pub trait LocalReductionStrategy: Sync {
    fn kind(&self) -> LocalStrategyKind;
    fn applies_to(
        &self,
        kind: ReductionKind,
        schedule: ScheduleKind,
        mode: SubgroupMode,
        local_size0: Option<u64>,
    ) -> bool;
    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<LocalReductionCode, LowerError>;
}

fn scratch(site: &ReductionSite, names: &mut VariableNames) -> (String, StrategyParam) {
    let name = names.fresh(&format!("{}_scratch", site.accumulator));
    let param = StrategyParam {
        param: CParam::new(CType::Pointer(AddressSpace::Local, site.elem), name.clone()),
        role: ArgumentRole::LocalReductionBuffer {
            kind: site.kind.name().into(),
            slots: LocalSlots::LocalSize,
        },
        source: site.source.clone(),
    };
    (name, param)
}

fn local_code(
    strategy: &'static str,
    params: Vec<StrategyParam>,
    combine: Vec<CStmt>,
) -> LocalReductionCode {
    LocalReductionCode {
        strategy,
        params,
        combine,
        version: ClVersion::V1_0,
        extensions: Vec::new(),
    }
}

/// Every lane stores its value, lane 0 folds, every lane reads the result.
struct SimpleFold;

impl LocalReductionStrategy for SimpleFold {
    fn kind(&self) -> LocalStrategyKind {
        LocalStrategyKind::Simple
    }

    fn applies_to(
        &self,
        kind: ReductionKind,
        schedule: ScheduleKind,
        _mode: SubgroupMode,
        _ls: Option<u64>,
    ) -> bool {
        kind.is_scalar() && schedule == ScheduleKind::Cooperative
    }

    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<LocalReductionCode, LowerError> {
        let (buf, param) = scratch(site, ctx.names);
        let lid = ctx.pos.get(PosVar::LocalId(0));
        let size = ctx.pos.get(PosVar::LocalSize(0));
        let acc = CExpr::var(&site.accumulator);
        let body = vec![
            CStmt::Assign {
                target: CExpr::index(CExpr::var(&buf), lid.clone()),
                value: acc,
            },
            barrier(BarrierScope::WorkGroup, Fence::Local),
            CStmt::if_then(
                eq_zero(lid),
                vec![
                    fold_slots(site, &buf, None, size, ctx.names),
                    CStmt::Assign {
                        target: CExpr::index(CExpr::var(&buf), CExpr::Int(0)),
                        value: CExpr::var(&site.accumulator),
                    },
                ],
            ),
            barrier(BarrierScope::WorkGroup, Fence::Local),
            CStmt::assign(
                &site.accumulator,
                CExpr::index(CExpr::var(&buf), CExpr::Int(0)),
            ),
            barrier(BarrierScope::WorkGroup, Fence::Local),
        ];
        Ok(local_code(self.kind().name(), vec![param], body))
    }
}

/// Pairwise tree over a power-of-two work-group.
struct InterleavedTree;

impl LocalReductionStrategy for InterleavedTree {
    fn kind(&self) -> LocalStrategyKind {
        LocalStrategyKind::Interleaved
    }

    fn applies_to(
        &self,
        kind: ReductionKind,
        schedule: ScheduleKind,
        _mode: SubgroupMode,
        local_size0: Option<u64>,
    ) -> bool {
        kind.is_scalar()
            && schedule == ScheduleKind::Cooperative
            && local_size0.is_some_and(|n| n.is_power_of_two())
    }

    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<LocalReductionCode, LowerError> {
        let Some(size) = ctx.local_size0 else {
            return Err(LowerError::Unsupported(
                "interleaved reduction needs a constant local size".into(),
            ));
        };
        let (buf, param) = scratch(site, ctx.names);
        let lid = ctx.pos.get(PosVar::LocalId(0));
        let stride = ctx.names.fresh("stride");
        let at = |i: CExpr| CExpr::index(CExpr::var(&buf), i);
        let body = vec![
            CStmt::Assign {
                target: at(lid.clone()),
                value: CExpr::var(&site.accumulator),
            },
            barrier(BarrierScope::WorkGroup, Fence::Local),
            CStmt::for_loop(
                CStmt::decl(CType::SizeT, stride.clone(), Some(CExpr::Int((size / 2) as i64))),
                CExpr::bin(BinOp::Gt, CExpr::var(&stride), CExpr::Int(0)),
                CStmt::assign(
                    stride.clone(),
                    CExpr::bin(BinOp::Div, CExpr::var(&stride), CExpr::Int(2)),
                ),
                vec![
                    CStmt::if_then(
                        CExpr::bin(BinOp::Lt, lid.clone(), CExpr::var(&stride)),
                        vec![CStmt::Assign {
                            target: at(lid.clone()),
                            value: combine(
                                site.kind,
                                at(lid.clone()),
                                at(CExpr::bin(BinOp::Add, lid.clone(), CExpr::var(&stride))),
                                site.elem,
                            ),
                        }],
                    ),
                    barrier(BarrierScope::WorkGroup, Fence::Local),
                ],
            ),
            CStmt::assign(&site.accumulator, at(CExpr::Int(0))),
            barrier(BarrierScope::WorkGroup, Fence::Local),
        ];
        Ok(local_code(self.kind().name(), vec![param], body))
    }
}

struct SubGroupBuiltin;

impl LocalReductionStrategy for SubGroupBuiltin {
    fn kind(&self) -> LocalStrategyKind {
        LocalStrategyKind::SubGroupBuiltin
    }

    fn applies_to(
        &self,
        kind: ReductionKind,
        schedule: ScheduleKind,
        mode: SubgroupMode,
        _ls: Option<u64>,
    ) -> bool {
        kind.is_scalar()
            && schedule == ScheduleKind::SubgroupCooperative
            && mode == SubgroupMode::Hardware
    }

    fn emit(
        &self,
        site: &ReductionSite,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<LocalReductionCode, LowerError> {
        let call = CExpr::call(
            format!("sub_group_reduce_{}", builtin_op(site.kind)),
            vec![CExpr::var(&site.accumulator)],
        );
        let mut code = local_code(
            self.kind().name(),
            Vec::new(),
            vec![CStmt::assign(&site.accumulator, call)],
        );
        code.version = ClVersion::V2_0;
        code.extensions.push("cl_khr_subgroups");
        Ok(code)
    }
}

/// Emulated subgroups: each subgroup leader folds its lanes' slots.
struct WarpLocalMemory;

impl LocalReductionStrategy for WarpLocalMemory {
    fn kind(&self) -> LocalStrategyKind {
        LocalStrategyKind::WarpLocalMemory
    }

    fn applies_to(
        &self,
        kind: ReductionKind,
        schedule: ScheduleKind,
        mode: SubgroupMode,
        _ls: Option<u64>,
    ) -> bool {
        kind.is_scalar()
            && schedule == ScheduleKind::SubgroupCooperative
            && matches!(mode, SubgroupMode::Warp(_))
    }

    fn emit(
        &self,
        site: &ReductionSite,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<LocalReductionCode, LowerError> {
        let (buf, param) = scratch(site, ctx.names);
        let lid = ctx.pos.get(PosVar::LocalId(0));
        let lane = ctx.pos.get(PosVar::SubGroupLocalId);
        let sg = ctx.pos.get(PosVar::SubGroupId);
        let sgs = ctx.pos.get(PosVar::SubGroupSize);
        let first = CExpr::bin(BinOp::Mul, sg, sgs.clone());
        let at = |i: CExpr| CExpr::index(CExpr::var(&buf), i);
        let body = vec![
            CStmt::Assign {
                target: at(lid.clone()),
                value: CExpr::var(&site.accumulator),
            },
            barrier(BarrierScope::WorkGroup, Fence::Local),
            CStmt::if_then(
                eq_zero(lane),
                vec![
                    fold_slots(site, &buf, Some(lid.clone()), sgs, ctx.names),
                    CStmt::Assign {
                        target: at(lid),
                        value: CExpr::var(&site.accumulator),
                    },
                ],
            ),
            barrier(BarrierScope::WorkGroup, Fence::Local),
            CStmt::assign(&site.accumulator, at(first)),
            barrier(BarrierScope::WorkGroup, Fence::Local),
        ];
        Ok(local_code(self.kind().name(), vec![param], body))
    }
}

pub fn local_strategy(kind: LocalStrategyKind) -> &'static dyn LocalReductionStrategy {
    match kind {
        LocalStrategyKind::Simple => &SimpleFold,
        LocalStrategyKind::Interleaved => &InterleavedTree,
        LocalStrategyKind::SubGroupBuiltin => &SubGroupBuiltin,
        LocalStrategyKind::WarpLocalMemory => &WarpLocalMemory,
    }
}

pub fn choose_local(
    ranked: &[LocalStrategyKind],
    kind: ReductionKind,
    schedule: ScheduleKind,
    mode: SubgroupMode,
    local_size0: Option<u64>,
) -> Result<&'static dyn LocalReductionStrategy, LowerError> {
    ranked
        .iter()
        .map(|k| local_strategy(*k))
        .find(|s| s.applies_to(kind, schedule, mode, local_size0))
        .ok_or_else(|| LowerError::NoReductionStrategy {
            scope: "local",
            kind: kind.name().into(),
            schedule: schedule.name().into(),
        })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::VariableAllocation;
    use crate::codegen::{render_expr, render_stmt};
    use crate::lir::count_barriers;
    use std::collections::HashSet;

    fn site(kind: ReductionKind) -> ReductionSite {
        ReductionSite {
            kind,
            accumulator: "acc".into(),
            elem: NumericKind::Double,
            source: "acc$4".into(),
        }
    }

    fn names() -> VariableNames {
        let mut alloc = VariableAllocation::new();
        alloc.add_isolated("acc$1");
        VariableNames::assign(&alloc, &HashSet::new())
    }

    fn render(stmts: &[CStmt]) -> String {
        let mut out = String::new();
        for s in stmts {
            render_stmt(&mut out, s, 0, Target::OpenCl);
        }
        out
    }

    #[test]
    fn identities_match_kinds() {
        assert_eq!(identity(ReductionKind::Sum, NumericKind::Double), CExpr::Float(0.0));
        assert_eq!(identity(ReductionKind::Sum, NumericKind::Int32), CExpr::Int(0));
        assert_eq!(
            render_expr(&identity(ReductionKind::Max, NumericKind::Int32), Target::OpenCl),
            "-2147483647 - 1"
        );
        assert_eq!(
            render_expr(&identity(ReductionKind::Min, NumericKind::Double), Target::OpenCl),
            "INFINITY"
        );
    }

    #[test]
    fn ranked_choice_skips_inapplicable_strategies() {
        let ranked = [GlobalStrategyKind::PerWorkItem, GlobalStrategyKind::LocalMemory];
        let s = choose_global(&ranked, ReductionKind::Sum, ScheduleKind::Cooperative).unwrap();
        assert_eq!(s.kind(), GlobalStrategyKind::LocalMemory);
        let s = choose_global(&ranked, ReductionKind::Sum, ScheduleKind::Direct).unwrap();
        assert_eq!(s.kind(), GlobalStrategyKind::PerWorkItem);
    }

    #[test]
    fn local_reduction_under_direct_is_rejected() {
        let err = choose_local(
            &LocalStrategyKind::ALL,
            ReductionKind::Sum,
            ScheduleKind::Direct,
            SubgroupMode::Hardware,
            Some(64),
        )
        .err()
        .expect("no local strategy applies to direct");
        assert_eq!(
            err.to_string(),
            "no local reduction strategy supports sum reductions under schedule(direct)"
        );
    }

    #[test]
    fn interleaved_requires_power_of_two() {
        let s = local_strategy(LocalStrategyKind::Interleaved);
        assert!(s.applies_to(
            ReductionKind::Sum,
            ScheduleKind::Cooperative,
            SubgroupMode::Hardware,
            Some(64)
        ));
        assert!(!s.applies_to(
            ReductionKind::Sum,
            ScheduleKind::Cooperative,
            SubgroupMode::Hardware,
            Some(48)
        ));
        assert!(!s.applies_to(
            ReductionKind::Sum,
            ScheduleKind::Cooperative,
            SubgroupMode::Hardware,
            None
        ));
    }

    #[test]
    fn per_work_item_writes_global_slot() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let mut names = names();
        let mut ctx = StrategyContext {
            schedule: ScheduleKind::Direct,
            depth: 1,
            pos: &mut pos,
            names: &mut names,
            local_size0: Some(4),
        };
        let code = PerWorkItem.emit(&site(ReductionKind::Sum), &mut ctx).unwrap();
        assert_eq!(code.params.len(), 1);
        assert_eq!(code.params[0].param.name, "acc_partial");
        assert_eq!(render(&code.init), "acc = 0.0;\n");
        assert_eq!(
            render(&code.finalize),
            "acc_partial[global_id0] = acc;\nbarrier(CLK_GLOBAL_MEM_FENCE);\n"
        );
    }

    #[test]
    fn local_memory_has_one_global_fence() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let mut names = names();
        let mut ctx = StrategyContext {
            schedule: ScheduleKind::Direct,
            depth: 1,
            pos: &mut pos,
            names: &mut names,
            local_size0: Some(4),
        };
        let code = LocalMemory.emit(&site(ReductionKind::Max), &mut ctx).unwrap();
        let globals = code
            .finalize
            .iter()
            .filter(|s| matches!(s, CStmt::Barrier { fence: Fence::Global, .. }))
            .count();
        assert_eq!(globals, 1);
        assert_eq!(count_barriers(&code.finalize), 2);
        let text = render(&code.finalize);
        assert!(text.contains("acc = fmax(acc, acc_local[slot]);"), "{text}");
        assert!(text.contains("acc_groups[group_id0] = acc;"), "{text}");
    }

    #[test]
    fn simple_fold_broadcasts_after_three_barriers() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let mut names = names();
        let mut ctx = StrategyContext {
            schedule: ScheduleKind::Cooperative,
            depth: 1,
            pos: &mut pos,
            names: &mut names,
            local_size0: Some(8),
        };
        let code = SimpleFold.emit(&site(ReductionKind::Sum), &mut ctx).unwrap();
        assert_eq!(count_barriers(&code.combine), 3);
        let text = render(&code.combine);
        assert!(text.ends_with("acc = acc_scratch[0];\nbarrier(CLK_LOCAL_MEM_FENCE);\n"), "{text}");
    }

    #[test]
    fn sub_group_builtin_requires_version_two() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let mut names = names();
        let mut ctx = StrategyContext {
            schedule: ScheduleKind::SubgroupCooperative,
            depth: 1,
            pos: &mut pos,
            names: &mut names,
            local_size0: None,
        };
        let code = SubGroupBuiltin.emit(&site(ReductionKind::Min), &mut ctx).unwrap();
        assert_eq!(code.version, ClVersion::V2_0);
        assert_eq!(code.extensions, vec!["cl_khr_subgroups"]);
        assert_eq!(render(&code.combine), "acc = sub_group_reduce_min(acc);\n");
    }
}
