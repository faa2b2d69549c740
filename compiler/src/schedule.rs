// schedule.rs — Work distribution schedules for generated kernels
//
// Maps logical task ids of a parallel loop nest onto OpenCL work-items.
// Each `ScheduleKind` wraps the lowered loop body in the loops and guards
// that compute `task_id{d}` and keep it below `num_tasks{d}`.
//
// Preconditions: cooperative and subgroup schedules receive 1-D nests.
// Postconditions: every task id in `[0, num_tasks)` is visited by exactly one
//                 work-item, or by every work-item of exactly one
//                 work-group / subgroup for the cooperative kinds.
// Failure modes: none here; the planner validates schedule and nest shape.
// Side effects: records used builtins in `Positioning`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lir::{BinOp, CExpr, CStmt, CType};
use crate::types::NumericKind;

// ── Schedule kinds ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Direct,
    Cooperative,
    SubgroupCooperative,
    CoarseSequential,
    CoarseRotation,
    FixedWorkGroupsSequential,
    FixedWorkGroupsRotation,
}

impl ScheduleKind {
    pub const ALL: [ScheduleKind; 7] = [
        ScheduleKind::Direct,
        ScheduleKind::Cooperative,
        ScheduleKind::SubgroupCooperative,
        ScheduleKind::CoarseSequential,
        ScheduleKind::CoarseRotation,
        ScheduleKind::FixedWorkGroupsSequential,
        ScheduleKind::FixedWorkGroupsRotation,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        ScheduleKind::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScheduleKind::Direct => "direct",
            ScheduleKind::Cooperative => "cooperative",
            ScheduleKind::SubgroupCooperative => "subgroup_cooperative",
            ScheduleKind::CoarseSequential => "coarse_sequential",
            ScheduleKind::CoarseRotation => "coarse_rotation",
            ScheduleKind::FixedWorkGroupsSequential => "fixed_work_groups_sequential",
            ScheduleKind::FixedWorkGroupsRotation => "fixed_work_groups_rotation",
        }
    }

    /// Whole work-groups (or subgroups) execute each task together.
    pub fn is_cooperative(self) -> bool {
        matches!(
            self,
            ScheduleKind::Cooperative | ScheduleKind::SubgroupCooperative
        )
    }

    /// Coarse schedules take a per-dimension coarsening factor.
    pub fn takes_factor(self) -> bool {
        matches!(
            self,
            ScheduleKind::CoarseSequential | ScheduleKind::CoarseRotation
        )
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Positioning variables ───────────────────────────────────────────────────

/// A work-item position builtin, declared once at the top of the kernel.
/// Variant order is declaration order; derived values come after their
/// inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PosVar {
    GlobalId(u8),
    LocalId(u8),
    GroupId(u8),
    GlobalSize(u8),
    LocalSize(u8),
    NumGroups(u8),
    SubGroupSize,
    NumSubGroups,
    SubGroupId,
    SubGroupLocalId,
}

impl PosVar {
    pub fn name(self) -> String {
        match self {
            PosVar::GlobalId(d) => format!("global_id{d}"),
            PosVar::LocalId(d) => format!("local_id{d}"),
            PosVar::GroupId(d) => format!("group_id{d}"),
            PosVar::GlobalSize(d) => format!("global_size{d}"),
            PosVar::LocalSize(d) => format!("local_size{d}"),
            PosVar::NumGroups(d) => format!("num_groups{d}"),
            PosVar::SubGroupSize => "sub_group_size".into(),
            PosVar::NumSubGroups => "num_subgroups".into(),
            PosVar::SubGroupId => "sub_group_id".into(),
            PosVar::SubGroupLocalId => "sub_group_local_id".into(),
        }
    }
}

/// How subgroup positions are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgroupMode {
    /// `cl_khr_subgroups` builtins.
    Hardware,
    /// Derived from `local_id0` with a constant subgroup size.
    Warp(u32),
}

#[derive(Debug, Clone)]
pub struct Positioning {
    used: BTreeSet<PosVar>,
    mode: SubgroupMode,
}

impl Positioning {
    pub fn new(mode: SubgroupMode) -> Self {
        Self {
            used: BTreeSet::new(),
            mode,
        }
    }

    pub fn mode(&self) -> SubgroupMode {
        self.mode
    }

    pub fn uses(&self, v: PosVar) -> bool {
        self.used.contains(&v)
    }

    pub fn uses_hardware_subgroups(&self) -> bool {
        self.mode == SubgroupMode::Hardware
            && self.used.iter().any(|v| {
                matches!(
                    v,
                    PosVar::SubGroupSize
                        | PosVar::NumSubGroups
                        | PosVar::SubGroupId
                        | PosVar::SubGroupLocalId
                )
            })
    }

    pub fn get(&mut self, v: PosVar) -> CExpr {
        if let SubgroupMode::Warp(_) = self.mode {
            match v {
                PosVar::NumSubGroups => {
                    self.used.insert(PosVar::LocalSize(0));
                    self.used.insert(PosVar::SubGroupSize);
                }
                PosVar::SubGroupId | PosVar::SubGroupLocalId => {
                    self.used.insert(PosVar::LocalId(0));
                    self.used.insert(PosVar::SubGroupSize);
                }
                _ => {}
            }
        }
        self.used.insert(v);
        CExpr::Var(v.name())
    }

    fn init(&self, v: PosVar) -> CExpr {
        let builtin = |name: &str, d: u8| CExpr::call(name, vec![CExpr::Int(d as i64)]);
        match (v, self.mode) {
            (PosVar::GlobalId(d), _) => builtin("get_global_id", d),
            (PosVar::LocalId(d), _) => builtin("get_local_id", d),
            (PosVar::GroupId(d), _) => builtin("get_group_id", d),
            (PosVar::GlobalSize(d), _) => builtin("get_global_size", d),
            (PosVar::LocalSize(d), _) => builtin("get_local_size", d),
            (PosVar::NumGroups(d), _) => builtin("get_num_groups", d),
            (PosVar::SubGroupSize, SubgroupMode::Hardware) => {
                CExpr::call("get_sub_group_size", vec![])
            }
            (PosVar::NumSubGroups, SubgroupMode::Hardware) => {
                CExpr::call("get_num_sub_groups", vec![])
            }
            (PosVar::SubGroupId, SubgroupMode::Hardware) => CExpr::call("get_sub_group_id", vec![]),
            (PosVar::SubGroupLocalId, SubgroupMode::Hardware) => {
                CExpr::call("get_sub_group_local_id", vec![])
            }
            (PosVar::SubGroupSize, SubgroupMode::Warp(size)) => CExpr::Int(size as i64),
            (PosVar::NumSubGroups, SubgroupMode::Warp(_)) => CExpr::bin(
                BinOp::Div,
                CExpr::Var(PosVar::LocalSize(0).name()),
                CExpr::Var(PosVar::SubGroupSize.name()),
            ),
            (PosVar::SubGroupId, SubgroupMode::Warp(_)) => CExpr::bin(
                BinOp::Div,
                CExpr::Var(PosVar::LocalId(0).name()),
                CExpr::Var(PosVar::SubGroupSize.name()),
            ),
            (PosVar::SubGroupLocalId, SubgroupMode::Warp(_)) => CExpr::bin(
                BinOp::Rem,
                CExpr::Var(PosVar::LocalId(0).name()),
                CExpr::Var(PosVar::SubGroupSize.name()),
            ),
        }
    }

    /// Declarations of every used builtin, in canonical order.
    pub fn declarations(&self) -> Vec<CStmt> {
        self.used
            .iter()
            .map(|v| CStmt::decl(CType::SizeT, v.name(), Some(self.init(*v))))
            .collect()
    }

    fn linear(&mut self, depth: usize, id: fn(u8) -> PosVar, size: fn(u8) -> PosVar) -> CExpr {
        let mut expr = self.get(id(0));
        let mut stride: Option<CExpr> = None;
        for d in 1..depth as u8 {
            let prev = self.get(size(d - 1));
            stride = Some(match stride {
                None => prev,
                Some(s) => CExpr::bin(BinOp::Mul, s, prev),
            });
            let term = CExpr::bin(
                BinOp::Mul,
                self.get(id(d)),
                stride.clone().unwrap_or(CExpr::Int(1)),
            );
            expr = CExpr::bin(BinOp::Add, expr, term);
        }
        expr
    }

    pub fn global_linear_id(&mut self, depth: usize) -> CExpr {
        self.linear(depth, PosVar::GlobalId, PosVar::GlobalSize)
    }

    pub fn local_linear_id(&mut self, depth: usize) -> CExpr {
        self.linear(depth, PosVar::LocalId, PosVar::LocalSize)
    }

    pub fn group_linear_id(&mut self, depth: usize) -> CExpr {
        self.linear(depth, PosVar::GroupId, PosVar::NumGroups)
    }

    pub fn local_linear_size(&mut self, depth: usize) -> CExpr {
        let mut expr = self.get(PosVar::LocalSize(0));
        for d in 1..depth as u8 {
            expr = CExpr::bin(BinOp::Mul, expr, self.get(PosVar::LocalSize(d)));
        }
        expr
    }
}

/// Identifiers introduced by schedules and positioning; emitted variable
/// names must avoid them.
pub fn reserved_names() -> Vec<String> {
    let mut names = Vec::new();
    for d in 0..3u8 {
        for v in [
            PosVar::GlobalId(d),
            PosVar::LocalId(d),
            PosVar::GroupId(d),
            PosVar::GlobalSize(d),
            PosVar::LocalSize(d),
            PosVar::NumGroups(d),
        ] {
            names.push(v.name());
        }
        for prefix in [
            "task_id",
            "num_tasks",
            "distribution_id",
            "tasks_per_segment",
            "task_start",
            "task_end",
        ] {
            names.push(format!("{prefix}{d}"));
        }
    }
    for v in [
        PosVar::SubGroupSize,
        PosVar::NumSubGroups,
        PosVar::SubGroupId,
        PosVar::SubGroupLocalId,
    ] {
        names.push(v.name());
    }
    names.push(IN_TASK_RANGE.into());
    names.push(SUBGROUP_ABSOLUTE_ID.into());
    names
}

pub const IN_TASK_RANGE: &str = "in_task_range";
const SUBGROUP_ABSOLUTE_ID: &str = "subgroup_absolute_id";

pub fn task_id(d: usize) -> String {
    format!("task_id{d}")
}

pub fn num_tasks(d: usize) -> String {
    format!("num_tasks{d}")
}

// ── Emission ────────────────────────────────────────────────────────────────

/// Inputs of one schedule emission.
#[derive(Debug, Clone)]
pub struct ScheduleShape {
    pub kind: ScheduleKind,
    pub depth: usize,
    /// Coarsening factor per dimension (coarse schedules only).
    pub factors: Vec<CExpr>,
    /// Dimensions whose task count is a proven multiple of the work-group
    /// size; `direct` omits their bound check.
    pub exact: Vec<bool>,
}

fn size(e: CExpr) -> CExpr {
    CExpr::cast(CType::SizeT, e)
}

fn lt(a: CExpr, b: CExpr) -> CExpr {
    CExpr::bin(BinOp::Lt, a, b)
}

fn mul(a: CExpr, b: CExpr) -> CExpr {
    CExpr::bin(BinOp::Mul, a, b)
}

fn add(a: CExpr, b: CExpr) -> CExpr {
    CExpr::bin(BinOp::Add, a, b)
}

fn min(a: CExpr, b: CExpr) -> CExpr {
    CExpr::call("min", vec![a, b])
}

fn declare_task_ids(depth: usize) -> Vec<CStmt> {
    (0..depth)
        .map(|d| CStmt::decl(CType::SizeT, task_id(d), None))
        .collect()
}

/// `for (task_id = from; task_id < to; task_id += step) { body }`
fn task_loop(d: usize, from: CExpr, to: CExpr, step: CExpr, body: Vec<CStmt>) -> CStmt {
    CStmt::for_loop(
        CStmt::assign(task_id(d), from),
        lt(CExpr::var(task_id(d)), to),
        CStmt::increment(task_id(d), step),
        body,
    )
}

/// Wrap `body` so that it runs once per task id.
pub fn emit(shape: &ScheduleShape, pos: &mut Positioning, body: Vec<CStmt>) -> Vec<CStmt> {
    let n = |d: usize| CExpr::var(num_tasks(d));
    match shape.kind {
        ScheduleKind::Direct => {
            let mut out = Vec::new();
            let mut guard: Option<CExpr> = None;
            for d in 0..shape.depth {
                out.push(CStmt::decl(
                    CType::SizeT,
                    task_id(d),
                    Some(pos.get(PosVar::GlobalId(d as u8))),
                ));
                if !shape.exact.get(d).copied().unwrap_or(false) {
                    let check = lt(CExpr::var(task_id(d)), n(d));
                    guard = Some(match guard {
                        None => check,
                        Some(g) => CExpr::bin(BinOp::And, g, check),
                    });
                }
            }
            match guard {
                Some(cond) => out.push(CStmt::if_then(cond, body)),
                None => out.extend(body),
            }
            out
        }
        ScheduleKind::Cooperative => {
            let mut out = declare_task_ids(1);
            let group = pos.get(PosVar::GroupId(0));
            let local_size = pos.get(PosVar::LocalSize(0));
            let from = mul(group.clone(), local_size.clone());
            let to = min(mul(add(group, CExpr::Int(1)), local_size), size(n(0)));
            out.push(task_loop(0, from, to, CExpr::Int(1), body));
            out
        }
        ScheduleKind::SubgroupCooperative => {
            let mut out = declare_task_ids(1);
            let group = pos.get(PosVar::GroupId(0));
            let per_group = pos.get(PosVar::NumSubGroups);
            let sg = pos.get(PosVar::SubGroupId);
            let sg_size = pos.get(PosVar::SubGroupSize);
            out.push(CStmt::decl(
                CType::SizeT,
                SUBGROUP_ABSOLUTE_ID,
                Some(add(mul(group, per_group), sg)),
            ));
            let abs = CExpr::var(SUBGROUP_ABSOLUTE_ID);
            let from = mul(abs.clone(), sg_size.clone());
            let end = mul(add(abs, CExpr::Int(1)), sg_size);
            match pos.mode() {
                SubgroupMode::Hardware => {
                    out.push(task_loop(0, from, min(end, size(n(0))), CExpr::Int(1), body));
                }
                SubgroupMode::Warp(_) => {
                    let mut guarded = vec![CStmt::decl(
                        CType::Scalar(NumericKind::Int32),
                        IN_TASK_RANGE,
                        Some(lt(CExpr::var(task_id(0)), n(0))),
                    )];
                    guarded.extend(body);
                    out.push(task_loop(0, from, end, CExpr::Int(1), guarded));
                }
            }
            out
        }
        ScheduleKind::CoarseSequential | ScheduleKind::CoarseRotation => {
            let mut out = declare_task_ids(shape.depth);
            let mut inner = body;
            for d in 0..shape.depth {
                let factor = shape.factors.get(d).cloned().unwrap_or(CExpr::Int(1));
                let dist = format!("distribution_id{d}");
                let gid = pos.get(PosVar::GlobalId(d as u8));
                let id = if shape.kind == ScheduleKind::CoarseSequential {
                    add(mul(gid, factor.clone()), CExpr::var(&dist))
                } else {
                    add(gid, mul(CExpr::var(&dist), pos.get(PosVar::GlobalSize(d as u8))))
                };
                inner = vec![CStmt::for_loop(
                    CStmt::decl(CType::SizeT, dist.clone(), Some(CExpr::Int(0))),
                    lt(CExpr::var(&dist), factor),
                    CStmt::increment(dist.clone(), CExpr::Int(1)),
                    vec![
                        CStmt::assign(task_id(d), id),
                        CStmt::if_then(lt(CExpr::var(task_id(d)), n(d)), inner),
                    ],
                )];
            }
            out.extend(inner);
            out
        }
        ScheduleKind::FixedWorkGroupsSequential => {
            let mut out = declare_task_ids(shape.depth);
            let mut inner = body;
            let mut setup = Vec::new();
            for d in 0..shape.depth {
                let gsize = pos.get(PosVar::GlobalSize(d as u8));
                let gid = pos.get(PosVar::GlobalId(d as u8));
                let tps = format!("tasks_per_segment{d}");
                let start = format!("task_start{d}");
                let end = format!("task_end{d}");
                setup.push(CStmt::decl(
                    CType::SizeT,
                    tps.clone(),
                    Some(CExpr::bin(
                        BinOp::Div,
                        add(size(n(d)), CExpr::bin(BinOp::Sub, gsize.clone(), CExpr::Int(1))),
                        gsize,
                    )),
                ));
                setup.push(CStmt::decl(
                    CType::SizeT,
                    start.clone(),
                    Some(mul(gid, CExpr::var(&tps))),
                ));
                setup.push(CStmt::decl(
                    CType::SizeT,
                    end.clone(),
                    Some(min(add(CExpr::var(&start), CExpr::var(&tps)), size(n(d)))),
                ));
                inner = vec![task_loop(
                    d,
                    CExpr::var(&start),
                    CExpr::var(&end),
                    CExpr::Int(1),
                    inner,
                )];
            }
            out.extend(setup);
            out.extend(inner);
            out
        }
        ScheduleKind::FixedWorkGroupsRotation => {
            let mut out = declare_task_ids(shape.depth);
            let mut inner = body;
            for d in 0..shape.depth {
                let gid = pos.get(PosVar::GlobalId(d as u8));
                let gsize = pos.get(PosVar::GlobalSize(d as u8));
                inner = vec![task_loop(d, gid, n(d), gsize, inner)];
            }
            out.extend(inner);
            out
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{render_stmt, Target};

    fn render(stmts: &[CStmt]) -> String {
        let mut out = String::new();
        for s in stmts {
            render_stmt(&mut out, s, 0, Target::OpenCl);
        }
        out
    }

    fn shape(kind: ScheduleKind) -> ScheduleShape {
        ScheduleShape {
            kind,
            depth: 1,
            factors: vec![CExpr::Int(4)],
            exact: vec![false],
        }
    }

    #[test]
    fn names_roundtrip() {
        for kind in ScheduleKind::ALL {
            assert_eq!(ScheduleKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ScheduleKind::from_name("auto"), None);
    }

    #[test]
    fn direct_guard_is_omitted_for_exact_dimensions() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let mut s = shape(ScheduleKind::Direct);
        s.exact = vec![true];
        let out = emit(&s, &mut pos, vec![CStmt::Break]);
        assert_eq!(render(&out), "size_t task_id0 = global_id0;\nbreak;\n");

        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let out = emit(&shape(ScheduleKind::Direct), &mut pos, vec![CStmt::Break]);
        assert_eq!(
            render(&out),
            "size_t task_id0 = global_id0;\nif (task_id0 < num_tasks0) {\n    break;\n}\n"
        );
    }

    #[test]
    fn cooperative_loop_bounds() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let out = emit(&shape(ScheduleKind::Cooperative), &mut pos, vec![]);
        assert_eq!(
            render(&out),
            "size_t task_id0;\nfor (task_id0 = group_id0 * local_size0; task_id0 < min((group_id0 + 1) * local_size0, (size_t)num_tasks0); task_id0++) {\n}\n"
        );
        assert!(pos.uses(PosVar::GroupId(0)));
        assert!(!pos.uses(PosVar::GlobalId(0)));
    }

    #[test]
    fn warp_positions_derive_from_local_id() {
        let mut pos = Positioning::new(SubgroupMode::Warp(32));
        pos.get(PosVar::SubGroupLocalId);
        let decls = render(&pos.declarations());
        assert_eq!(
            decls,
            "size_t local_id0 = get_local_id(0);\nsize_t sub_group_size = 32;\nsize_t sub_group_local_id = local_id0 % sub_group_size;\n"
        );
        assert!(!pos.uses_hardware_subgroups());
    }

    #[test]
    fn linear_ids_combine_dimensions() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let e = pos.global_linear_id(2);
        assert_eq!(
            crate::codegen::render_expr(&e, Target::OpenCl),
            "global_id0 + (global_id1 * global_size0)"
        );
    }

    #[test]
    fn coarse_rotation_strides_by_global_size() {
        let mut pos = Positioning::new(SubgroupMode::Hardware);
        let out = emit(&shape(ScheduleKind::CoarseRotation), &mut pos, vec![]);
        let text = render(&out);
        assert!(text.contains(
            "for (size_t distribution_id0 = 0; distribution_id0 < 4; distribution_id0++) {"
        ));
        assert!(text.contains("task_id0 = global_id0 + (distribution_id0 * global_size0);"));
        assert!(text.contains("if (task_id0 < num_tasks0) {"));
    }
}
