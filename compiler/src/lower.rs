// lower.rs — Instruction lowering: typed SSA blocks to LIR statements
//
// A rule table keyed by `InstrTag` picks one lowering rule per instruction.
// Every tag has a base rule (an exhaustive match); tables may register
// override rules ahead of it, which is how host launch sites and the
// kernel-only constructs are handled. Blocks are not labels: construct rules
// lower their owned blocks recursively and then splice the end-block chain
// into the same statement list.
//
// Preconditions: the function has been allocated; every SSA name read or
//                written has a type.
// Postconditions: emitted indices are 0-based; side-effecting statements of a
//                 block keep their order.
// Failure modes: `LowerError` for shape violations and unsupported features;
//                optimization findings are pushed to `LowerState::diagnostics`.
// Side effects: may lower auxiliary instances into the shared `InstanceSet`.

use std::collections::{BTreeMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, instrument, trace};

use crate::alloc::{allocate, VariableNames};
use crate::codegen::{reserved_names, CodegenOptions, Target};
use crate::depend::{analyze_loop, DependenceVerdict};
use crate::diag::{self, DiagCode, Diagnostic};
use crate::error::LowerError;
use crate::id::BlockId;
use crate::instances::InstanceSet;
use crate::kernel::{KernelEnv, KernelState, LaunchArg, LaunchTable};
use crate::lir::{referenced_vars, BinOp, CExpr, CFunction, CParam, CStmt, CType};
use crate::liveness::iter_output;
use crate::ops::{self, OpArg, OpKind};
use crate::seqcopy::sequentialize;
use crate::ssa::{Builtin, InstrTag, Instruction, Operand, TypedFunction, TypedProgram};
use crate::types::{AddressSpace, Constant, MatrixType, NumericKind, Storage, VarType};

// ── Types and literals ──────────────────────────────────────────────────────

/// Target type of a variable.
pub fn ctype(ty: &VarType) -> Result<CType, LowerError> {
    Ok(match ty {
        VarType::Scalar(s) => CType::Scalar(s.kind),
        VarType::Matrix(m) => match m.storage {
            Storage::Dynamic => CType::Matrix(m.elem),
            Storage::Static => match m.known_numel() {
                Some(n) => CType::Array(m.elem, n),
                None => {
                    return Err(LowerError::Unsupported(format!(
                        "static matrix of unknown shape `{ty}`"
                    )))
                }
            },
            Storage::Buffer | Storage::Sized => CType::Pointer(AddressSpace::Global, m.elem),
        },
    })
}

pub fn literal(c: Constant) -> CExpr {
    match c {
        Constant::Int(v) => CExpr::Int(v),
        Constant::Float(v) => CExpr::Float(v),
    }
}

/// `mat_<elem>_<op>` runtime helper name.
pub fn runtime(elem: NumericKind, op: &str) -> String {
    format!("mat_{}_{op}", elem.mangle())
}

fn memcpy(dst: CExpr, src: CExpr, m: &MatrixType) -> Result<CStmt, LowerError> {
    let n = m.known_numel().ok_or_else(|| {
        LowerError::Unsupported("copy of a static matrix of unknown shape".into())
    })?;
    Ok(CStmt::Expr(CExpr::call(
        "memcpy",
        vec![
            dst,
            src,
            CExpr::Raw(format!("{n} * sizeof({})", m.elem.c_name())),
        ],
    )))
}

/// Extra size arguments accompanying a `sized` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedNames {
    pub numel: String,
    pub dims: Vec<String>,
}

impl SizedNames {
    pub fn reserve(names: &mut VariableNames, base: &str, rank: usize) -> Self {
        Self {
            numel: names.fresh(&format!("{base}_numel")),
            dims: (1..=rank)
                .map(|k| names.fresh(&format!("{base}_dim{k}")))
                .collect(),
        }
    }

    pub fn params(&self, ty: CType) -> Vec<CParam> {
        std::iter::once(&self.numel)
            .chain(&self.dims)
            .map(|n| CParam::new(ty.clone(), n.clone()))
            .collect()
    }
}

/// Type of each emitted variable, taken from the first typed member of its
/// group.
pub fn final_types(function: &TypedFunction, names: &VariableNames) -> IndexMap<String, VarType> {
    let mut types = IndexMap::new();
    for (ssa, ty) in &function.types {
        if let Some(name) = names.try_final_name(ssa) {
            types.entry(name.to_string()).or_insert_with(|| ty.clone());
        }
    }
    types
}

// ── Environment and state ───────────────────────────────────────────────────

/// Read-only context shared by every rule while one function is lowered.
pub struct LowerEnv<'a> {
    pub function: &'a TypedFunction,
    pub program: &'a TypedProgram,
    pub names: &'a VariableNames,
    pub final_types: &'a IndexMap<String, VarType>,
    pub sized: &'a IndexMap<String, SizedNames>,
    pub options: &'a CodegenOptions,
    pub target: Target,
    pub rules: &'a RuleTable,
    pub kernel: Option<&'a KernelEnv>,
    pub launches: Option<&'a LaunchTable>,
}

impl<'a> LowerEnv<'a> {
    pub fn name(&self, ssa: &str) -> Result<&'a str, LowerError> {
        self.names
            .try_final_name(ssa)
            .ok_or_else(|| {
                LowerError::malformed("variable", format!("`{ssa}` was never allocated"))
            })
    }

    pub fn ty(&self, ssa: &str) -> Result<&'a VarType, LowerError> {
        self.function.type_of(ssa)
    }

    pub fn var(&self, ssa: &str) -> Result<CExpr, LowerError> {
        Ok(CExpr::var(self.name(ssa)?))
    }

    /// A known constant alone in its group is inlined instead of stored.
    pub fn is_inlined(&self, ssa: &str) -> Result<bool, LowerError> {
        Ok(self.ty(ssa)?.constant_value().is_some() && self.names.group_size(ssa) <= 1)
    }

    pub fn value(&self, ssa: &str) -> Result<CExpr, LowerError> {
        let ty = self.ty(ssa)?;
        match ty.constant_value() {
            Some(c) if self.names.group_size(ssa) <= 1 => Ok(literal(c)),
            _ => self.var(ssa),
        }
    }

    pub fn matrix(&self, ssa: &str) -> Result<&'a MatrixType, LowerError> {
        self.ty(ssa)?
            .as_matrix()
            .ok_or_else(|| {
                LowerError::malformed("matrix access", format!("`{ssa}` is not a matrix"))
            })
    }

    fn sized_names(&self, ssa: &str) -> Result<&'a SizedNames, LowerError> {
        let name = self.name(ssa)?;
        self.sized
            .get(name)
            .ok_or_else(|| {
                LowerError::Unsupported(format!("sized matrix `{ssa}` has no size arguments"))
            })
    }

    /// Element `index` (0-based, linear) of `ssa`.
    pub fn element(&self, ssa: &str, index: CExpr) -> Result<CExpr, LowerError> {
        let base = self.var(ssa)?;
        Ok(match self.matrix(ssa)?.storage {
            Storage::Dynamic => CExpr::index(CExpr::field(base, "data"), index),
            _ => CExpr::index(base, index),
        })
    }

    /// `index - 1`, with integral constants folded and float indices cast.
    pub fn zero_based(&self, index: &str) -> Result<CExpr, LowerError> {
        let ty = self.ty(index)?;
        if self.is_inlined(index)? {
            if let Some(n) = ty.constant_value().and_then(Constant::as_i64) {
                return Ok(CExpr::Int(n - 1));
            }
        }
        let e = CExpr::minus_one(self.value(index)?);
        Ok(if ty.elem().is_float() {
            CExpr::cast(CType::SizeT, e)
        } else {
            e
        })
    }

    /// Column-major linear index of a 1-based index list.
    pub fn linear_index(&self, ssa: &str, indices: &[String]) -> Result<CExpr, LowerError> {
        let Some((last, rest)) = indices.split_last() else {
            return Err(LowerError::malformed(
                "matrix access",
                format!("`{ssa}` indexed without indices"),
            ));
        };
        let mut acc = self.zero_based(last)?;
        for (k, idx) in rest.iter().enumerate().rev() {
            acc = CExpr::bin(
                BinOp::Add,
                self.zero_based(idx)?,
                CExpr::bin(BinOp::Mul, self.dim(ssa, k)?, acc),
            );
        }
        Ok(acc)
    }

    pub fn numel(&self, ssa: &str) -> Result<CExpr, LowerError> {
        let m = self.matrix(ssa)?;
        if let Some(n) = m.known_numel() {
            return Ok(CExpr::Int(n as i64));
        }
        match m.storage {
            Storage::Dynamic => Ok(CExpr::field(self.var(ssa)?, "numel")),
            Storage::Sized => Ok(CExpr::var(&self.sized_names(ssa)?.numel)),
            Storage::Static | Storage::Buffer => Err(LowerError::Unsupported(format!(
                "element count of `{ssa}` is not known"
            ))),
        }
    }

    /// Size of dimension `k` (0-based).
    pub fn dim(&self, ssa: &str, k: usize) -> Result<CExpr, LowerError> {
        let m = self.matrix(ssa)?;
        match m.shape.get(k) {
            None => return Ok(CExpr::Int(1)),
            Some(Some(n)) => return Ok(CExpr::Int(*n as i64)),
            Some(None) => {}
        }
        match m.storage {
            Storage::Dynamic => Ok(CExpr::index(
                CExpr::field(self.var(ssa)?, "dims"),
                CExpr::Int(k as i64),
            )),
            Storage::Sized => Ok(CExpr::var(&self.sized_names(ssa)?.dims[k])),
            Storage::Static | Storage::Buffer => Err(LowerError::Unsupported(format!(
                "dimension {} of `{ssa}` is not known",
                k + 1
            ))),
        }
    }

    /// Arguments passing `ssa` to a generated function.
    pub fn call_args(&self, ssa: &str) -> Result<Vec<CExpr>, LowerError> {
        match self.ty(ssa)?.as_matrix() {
            Some(m) if m.storage == Storage::Sized => {
                let sized = self.sized_names(ssa)?;
                let mut args = vec![self.var(ssa)?, CExpr::var(&sized.numel)];
                args.extend(sized.dims.iter().map(CExpr::var));
                Ok(args)
            }
            _ => Ok(vec![self.value(ssa)?]),
        }
    }
}

/// Mutable state threaded through the rules of one function.
pub struct LowerState<'i> {
    /// Block whose instructions are currently being lowered.
    pub block: BlockId,
    /// Line of the last `Line` marker.
    pub line: Option<u32>,
    pub diagnostics: Vec<Diagnostic>,
    /// Temporaries introduced by lowering, declared with the function.
    pub locals: IndexMap<String, CType>,
    temps: HashSet<String>,
    pub instances: &'i mut InstanceSet,
    /// Keys of the instances this function calls.
    pub called: IndexSet<String>,
    pub kernel: Option<KernelState>,
}

impl<'i> LowerState<'i> {
    pub fn new(instances: &'i mut InstanceSet) -> Self {
        Self {
            block: BlockId::ENTRY,
            line: None,
            diagnostics: Vec::new(),
            locals: IndexMap::new(),
            temps: HashSet::new(),
            instances,
            called: IndexSet::new(),
            kernel: None,
        }
    }

    /// A name unused by the allocation and by earlier temporaries.
    pub fn fresh_temp(&mut self, env: &LowerEnv<'_>, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 1;
        while env.names.is_used(&candidate) || !self.temps.insert(candidate.clone()) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        candidate
    }

    pub fn fresh_local(&mut self, env: &LowerEnv<'_>, base: &str, ty: CType) -> String {
        let name = self.fresh_temp(env, base);
        self.locals.insert(name.clone(), ty);
        name
    }

    pub fn note(&mut self, code: DiagCode, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::info(code, self.line, message));
    }
}

// ── Rules and dispatch ──────────────────────────────────────────────────────

pub trait LoweringRule {
    fn name(&self) -> &'static str;

    /// Base rules are selected by tag and accept unconditionally.
    fn accepts(&self, _instr: &Instruction, _env: &LowerEnv<'_>, _state: &LowerState<'_>) -> bool {
        true
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError>;
}

/// Override rules per tag, tried in registration order before the base rule.
#[derive(Default)]
pub struct RuleTable {
    overrides: BTreeMap<InstrTag, Vec<Box<dyn LoweringRule>>>,
}

impl RuleTable {
    /// Base rules only.
    pub fn base() -> Self {
        Self::default()
    }

    /// Host functions: parallel nests become kernel launches.
    pub fn sequential() -> Self {
        Self::base().with_override(InstrTag::For, Box::new(HostLaunchRule))
    }

    pub fn with_override(mut self, tag: InstrTag, rule: Box<dyn LoweringRule>) -> Self {
        self.overrides.entry(tag).or_default().push(rule);
        self
    }

    pub fn select<'r>(
        &'r self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &LowerState<'_>,
    ) -> &'r dyn LoweringRule {
        self.overrides
            .get(&instr.tag())
            .and_then(|rules| rules.iter().find(|r| r.accepts(instr, env, state)))
            .map(|r| r.as_ref())
            .unwrap_or_else(|| base_rule(instr.tag()))
    }

    /// Names of the override rules registered for `tag`.
    pub fn override_names(&self, tag: InstrTag) -> Vec<&'static str> {
        self.overrides
            .get(&tag)
            .map(|rules| rules.iter().map(|r| r.name()).collect())
            .unwrap_or_default()
    }
}

fn base_rule(tag: InstrTag) -> &'static dyn LoweringRule {
    match tag {
        InstrTag::Argument => &ArgumentRule,
        InstrTag::Assignment => &AssignmentRule,
        InstrTag::Builtin => &BuiltinRule,
        InstrTag::Comment => &CommentRule,
        InstrTag::Line => &LineRule,
        InstrTag::Call => &CallRule,
        InstrTag::MatrixGet => &MatrixGetRule,
        InstrTag::MatrixSet => &MatrixSetRule,
        InstrTag::SimpleGet => &SimpleGetRule,
        InstrTag::SimpleSet => &SimpleSetRule,
        InstrTag::GetOrFirst => &GetOrFirstRule,
        InstrTag::Branch => &BranchRule,
        InstrTag::For => &ForRule,
        InstrTag::Iter => &IterRule,
        InstrTag::While => &WhileRule,
        InstrTag::Phi => &PhiRule,
        InstrTag::ParallelCopy => &ParallelCopyRule,
        InstrTag::Break => &BreakRule,
        InstrTag::Initialization => &SequentialInitializationRule,
    }
}

pub(crate) fn mismatch(rule: &str, instr: &Instruction) -> LowerError {
    LowerError::malformed("dispatch", format!("rule `{rule}` cannot lower `{instr}`"))
}

pub fn lower_instruction(
    instr: &Instruction,
    env: &LowerEnv<'_>,
    state: &mut LowerState<'_>,
    out: &mut Vec<CStmt>,
) -> Result<(), LowerError> {
    let rule = env.rules.select(instr, env, state);
    trace!(rule = rule.name(), %instr, "lower");
    rule.apply(instr, env, state, out)
}

/// Lower `block` and, through construct rules, the chain that follows it.
pub fn lower_chain(
    block: BlockId,
    env: &LowerEnv<'_>,
    state: &mut LowerState<'_>,
    out: &mut Vec<CStmt>,
) -> Result<(), LowerError> {
    for instr in &env.function.body.block(block)?.instructions {
        state.block = block;
        lower_instruction(instr, env, state, out)?;
    }
    Ok(())
}

pub fn lower_nested(
    block: BlockId,
    env: &LowerEnv<'_>,
    state: &mut LowerState<'_>,
) -> Result<Vec<CStmt>, LowerError> {
    let mut out = Vec::new();
    lower_chain(block, env, state, &mut out)?;
    Ok(out)
}

// ── Simple rules ────────────────────────────────────────────────────────────

pub struct ArgumentRule;

impl LoweringRule for ArgumentRule {
    fn name(&self) -> &'static str {
        "argument"
    }

    fn apply(
        &self,
        _: &Instruction,
        _: &LowerEnv<'_>,
        _: &mut LowerState<'_>,
        _: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        Ok(())
    }
}

pub struct AssignmentRule;

impl LoweringRule for AssignmentRule {
    fn name(&self) -> &'static str {
        "assignment"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Assignment { output, input } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        if env.is_inlined(output)? {
            return Ok(());
        }
        let target = env.name(output)?;
        let value = match input {
            Operand::Int(v) => CExpr::Int(*v),
            Operand::Float(v) => CExpr::Float(*v),
            Operand::Var(src) => {
                if !env.is_inlined(src)? && env.name(src)? == target {
                    return Ok(());
                }
                match env.ty(output)?.as_matrix() {
                    Some(m) if m.storage == Storage::Dynamic => {
                        CExpr::call(runtime(m.elem, "copy"), vec![env.var(src)?])
                    }
                    Some(m) if m.storage == Storage::Static => {
                        out.push(memcpy(CExpr::var(target), env.var(src)?, m)?);
                        return Ok(());
                    }
                    Some(_) => {
                        return Err(LowerError::Unsupported(format!(
                            "copying buffer matrix `{src}` into `{output}`"
                        )))
                    }
                    None => env.value(src)?,
                }
            }
        };
        out.push(CStmt::assign(target, value));
        Ok(())
    }
}

pub struct BuiltinRule;

impl LoweringRule for BuiltinRule {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Builtin { output, which } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        if env.is_inlined(output)? {
            return Ok(());
        }
        let value = match which {
            Builtin::Pi => CExpr::Float(std::f64::consts::PI),
            Builtin::True => CExpr::Int(1),
            Builtin::False => CExpr::Int(0),
            Builtin::Nargin => CExpr::Int(env.function.params.len() as i64),
        };
        out.push(CStmt::assign(env.name(output)?, value));
        Ok(())
    }
}

pub struct CommentRule;

impl LoweringRule for CommentRule {
    fn name(&self) -> &'static str {
        "comment"
    }

    fn apply(
        &self,
        instr: &Instruction,
        _: &LowerEnv<'_>,
        _: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Comment(text) = instr else {
            return Err(mismatch(self.name(), instr));
        };
        out.push(CStmt::Comment(text.clone()));
        Ok(())
    }
}

pub struct LineRule;

impl LoweringRule for LineRule {
    fn name(&self) -> &'static str {
        "line"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Line(n) = instr else {
            return Err(mismatch(self.name(), instr));
        };
        state.line = Some(*n);
        if env.options.line_comments {
            out.push(CStmt::Comment(format!("line {n}")));
        }
        Ok(())
    }
}

pub struct IterRule;

impl LoweringRule for IterRule {
    fn name(&self) -> &'static str {
        "iter"
    }

    /// The loop header assigns the induction variable.
    fn apply(
        &self,
        _: &Instruction,
        _: &LowerEnv<'_>,
        _: &mut LowerState<'_>,
        _: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        Ok(())
    }
}

pub struct BreakRule;

impl LoweringRule for BreakRule {
    fn name(&self) -> &'static str {
        "break"
    }

    fn apply(
        &self,
        _: &Instruction,
        _: &LowerEnv<'_>,
        _: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        out.push(CStmt::Break);
        Ok(())
    }
}

pub struct SequentialInitializationRule;

impl LoweringRule for SequentialInitializationRule {
    fn name(&self) -> &'static str {
        "initialization"
    }

    fn apply(
        &self,
        _: &Instruction,
        _: &LowerEnv<'_>,
        _: &mut LowerState<'_>,
        _: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        Err(LowerError::ParallelOnly(InstrTag::Initialization))
    }
}

pub struct PhiRule;

impl LoweringRule for PhiRule {
    fn name(&self) -> &'static str {
        "phi"
    }

    /// No code: allocation already merged every input into the output's
    /// group.
    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        _out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Phi { output, sources } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        let output_name = env.name(output)?;
        for (_, input) in sources {
            let input_name = env.name(input)?;
            if input_name != output_name {
                return Err(LowerError::PhiNameMismatch {
                    output: output.clone(),
                    output_name: output_name.to_string(),
                    input: input.clone(),
                    input_name: input_name.to_string(),
                });
            }
        }
        Ok(())
    }
}

pub struct ParallelCopyRule;

impl LoweringRule for ParallelCopyRule {
    fn name(&self) -> &'static str {
        "pcopy"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::ParallelCopy { copies } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        let mut moves = Vec::new();
        let mut constants = Vec::new();
        for (dst, src) in copies {
            if env.is_inlined(dst)? {
                continue;
            }
            let d = env.name(dst)?.to_string();
            if env.is_inlined(src)? {
                constants.push((d, env.value(src)?));
            } else {
                moves.push((d, env.name(src)?.to_string()));
            }
        }

        let mut temps = Vec::new();
        let sequence = sequentialize(&moves, || {
            let t = state.fresh_temp(env, "swap");
            temps.push(t.clone());
            t
        });
        for (dst, src) in sequence {
            let ty = env.final_types.get(&src).or_else(|| {
                // A temporary's type is the type of what it saves.
                env.final_types.get(&dst)
            });
            if temps.contains(&dst) && !state.locals.contains_key(&dst) {
                let Some(ty) = ty else {
                    return Err(LowerError::MissingType(src));
                };
                state.locals.insert(dst.clone(), ctype(ty)?);
            }
            match ty.and_then(VarType::as_matrix) {
                Some(m) if m.storage == Storage::Static => {
                    out.push(memcpy(CExpr::var(dst), CExpr::var(src), m)?);
                }
                _ => out.push(CStmt::assign(dst, CExpr::var(src))),
            }
        }
        for (dst, value) in constants {
            out.push(CStmt::assign(dst, value));
        }
        Ok(())
    }
}

// ── Calls ───────────────────────────────────────────────────────────────────

/// Whether `function`'s single output is the C return value.
pub fn returns_single(function: &TypedFunction) -> Result<bool, LowerError> {
    match function.outputs.as_slice() {
        [only] => Ok(match function.type_of(only)? {
            VarType::Scalar(_) => true,
            VarType::Matrix(m) => m.storage == Storage::Dynamic,
        }),
        _ => Ok(false),
    }
}

pub struct CallRule;

impl CallRule {
    fn operator(
        &self,
        op: OpKind,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Call {
            outputs,
            callee,
            inputs,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let [output] = outputs.as_slice() else {
            return Err(LowerError::malformed(
                "call",
                format!("operator `{callee}` produces exactly one output"),
            ));
        };
        if env.is_inlined(output)? {
            return Ok(());
        }
        let out_ty = env.ty(output)?;
        let value = match op {
            OpKind::Numel => match inputs.as_slice() {
                [m] => env.numel(m)?,
                _ => return Err(LowerError::malformed("call", "`numel` takes 1 input")),
            },
            OpKind::Size => {
                let [m, k] = inputs.as_slice() else {
                    return Err(LowerError::malformed("call", "`size` takes 2 inputs"));
                };
                let known = env.ty(k)?.constant_value().and_then(Constant::as_i64);
                match known {
                    Some(k) if k >= 1 => env.dim(m, (k - 1) as usize)?,
                    _ if env.matrix(m)?.storage == Storage::Dynamic => CExpr::index(
                        CExpr::field(env.var(m)?, "dims"),
                        env.zero_based(k)?,
                    ),
                    _ => {
                        return Err(LowerError::Unsupported(format!(
                            "size of `{m}` along a dimension unknown at compile time"
                        )))
                    }
                }
            }
            OpKind::Zeros => match out_ty.as_matrix() {
                None if out_ty.elem().is_float() => CExpr::Float(0.0),
                None => CExpr::Int(0),
                Some(m) if m.storage == Storage::Dynamic => {
                    let mut args = vec![CExpr::Int(inputs.len() as i64)];
                    for d in inputs {
                        args.push(env.value(d)?);
                    }
                    CExpr::call(runtime(m.elem, "zeros"), args)
                }
                Some(_) => {
                    return Err(LowerError::Unsupported(format!(
                        "`zeros` into non-dynamic matrix `{output}`"
                    )))
                }
            },
            _ => {
                let args = inputs
                    .iter()
                    .map(|i| {
                        Ok(OpArg {
                            expr: env.value(i)?,
                            ty: env.ty(i)?,
                        })
                    })
                    .collect::<Result<Vec<_>, LowerError>>()?;
                ops::scalar_expr(callee, op, args, out_ty, env.target)?
            }
        };
        out.push(CStmt::assign(env.name(output)?, value));
        Ok(())
    }
}

impl LoweringRule for CallRule {
    fn name(&self) -> &'static str {
        "call"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Call {
            outputs,
            callee,
            inputs,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        if let Some(op) = ops::lookup(callee) {
            return self.operator(op, instr, env, out);
        }
        let function = env
            .program
            .function(callee)
            .ok_or_else(|| LowerError::UnknownCallee(callee.clone()))?;
        if function.params.len() != inputs.len() || function.outputs.len() != outputs.len() {
            return Err(LowerError::malformed(
                "call",
                format!(
                    "`{callee}` takes {} inputs and {} outputs, called with {} and {}",
                    function.params.len(),
                    function.outputs.len(),
                    inputs.len(),
                    outputs.len()
                ),
            ));
        }
        let arg_types = inputs
            .iter()
            .map(|i| env.ty(i).cloned())
            .collect::<Result<Vec<_>, LowerError>>()?;
        let instance = state
            .instances
            .request(env.program, env.options, function, &arg_types, env.target)?;
        state.called.insert(instance.key.clone());

        let mut args = Vec::new();
        for i in inputs {
            args.extend(env.call_args(i)?);
        }
        if returns_single(function)? {
            let call = CExpr::call(instance.name, args);
            out.push(CStmt::assign(env.name(&outputs[0])?, call));
            return Ok(());
        }
        for o in outputs {
            args.push(match env.ty(o)?.as_matrix() {
                Some(m) if m.storage == Storage::Static => env.var(o)?,
                _ => CExpr::addr_of(env.var(o)?),
            });
        }
        out.push(CStmt::Expr(CExpr::call(instance.name, args)));
        Ok(())
    }
}

// ── Matrix access ───────────────────────────────────────────────────────────

/// `M[i, j, ...]` as a 0-based element read.
pub fn read_expr(
    env: &LowerEnv<'_>,
    matrix: &str,
    indices: &[String],
) -> Result<CExpr, LowerError> {
    env.element(matrix, env.linear_index(matrix, indices)?)
}

/// `if (out of bounds) kcc_index_error(line);`, or nothing when every index
/// is a constant proven in range.
fn bounds_check(
    env: &LowerEnv<'_>,
    state: &LowerState<'_>,
    matrix: &str,
    indices: &[String],
) -> Result<Option<CStmt>, LowerError> {
    let limits = if indices.len() == 1 {
        vec![env.numel(matrix)?]
    } else {
        (0..indices.len())
            .map(|k| env.dim(matrix, k))
            .collect::<Result<Vec<_>, _>>()?
    };
    let mut cond: Option<CExpr> = None;
    for (idx, limit) in indices.iter().zip(limits) {
        let known = env.ty(idx)?.constant_value().and_then(Constant::as_i64);
        if let (Some(i), Some(l)) = (known, limit.as_int()) {
            if (1..=l).contains(&i) {
                continue;
            }
        }
        let v = env.value(idx)?;
        let bad = CExpr::bin(
            BinOp::Or,
            CExpr::bin(BinOp::Lt, v.clone(), CExpr::Int(1)),
            CExpr::bin(BinOp::Gt, v, limit),
        );
        cond = Some(match cond {
            Some(c) => CExpr::bin(BinOp::Or, c, bad),
            None => bad,
        });
    }
    let line = i64::from(state.line.unwrap_or(0));
    Ok(cond.map(|c| {
        CStmt::if_then(
            c,
            vec![CStmt::Expr(CExpr::call("kcc_index_error", vec![CExpr::Int(line)]))],
        )
    }))
}

/// Whether constant indices provably fit the known shape of `m`.
fn fits_known_shape(
    env: &LowerEnv<'_>,
    m: &MatrixType,
    indices: &[String],
) -> Result<bool, LowerError> {
    let limits: Vec<Option<u64>> = if indices.len() == 1 {
        vec![m.known_numel()]
    } else {
        (0..indices.len())
            .map(|k| m.shape.get(k).copied().unwrap_or(Some(1)))
            .collect()
    };
    for (idx, limit) in indices.iter().zip(limits) {
        let known = env.ty(idx)?.constant_value().and_then(Constant::as_i64);
        match (known, limit) {
            (Some(i), Some(l)) if i >= 1 && i as u64 <= l => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

pub struct SimpleGetRule;

impl LoweringRule for SimpleGetRule {
    fn name(&self) -> &'static str {
        "simple_get"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::SimpleGet {
            output,
            matrix,
            indices,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        out.push(CStmt::assign(env.name(output)?, read_expr(env, matrix, indices)?));
        Ok(())
    }
}

pub struct MatrixGetRule;

impl LoweringRule for MatrixGetRule {
    fn name(&self) -> &'static str {
        "get"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::MatrixGet {
            output,
            matrix,
            indices,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        if env.target == Target::C {
            if let Some(check) = bounds_check(env, state, matrix, indices)? {
                out.push(check);
            }
        }
        out.push(CStmt::assign(env.name(output)?, read_expr(env, matrix, indices)?));
        Ok(())
    }
}

pub struct GetOrFirstRule;

impl LoweringRule for GetOrFirstRule {
    fn name(&self) -> &'static str {
        "get_or_first"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::GetOrFirst {
            output,
            matrix,
            index,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let idx = match env.matrix(matrix)?.known_numel() {
            Some(1) => CExpr::Int(0),
            Some(_) => env.zero_based(index)?,
            None => CExpr::ternary(
                CExpr::bin(BinOp::Eq, env.numel(matrix)?, CExpr::Int(1)),
                CExpr::Int(0),
                env.zero_based(index)?,
            ),
        };
        out.push(CStmt::assign(env.name(output)?, env.element(matrix, idx)?));
        Ok(())
    }
}

pub struct SimpleSetRule;

impl LoweringRule for SimpleSetRule {
    fn name(&self) -> &'static str {
        "simple_set"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        _state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::SimpleSet {
            output,
            matrix,
            indices,
            value,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        if env.names.group_of(output) != env.names.group_of(matrix) {
            return Err(LowerError::AllocationFailure {
                output: output.clone(),
                input: matrix.clone(),
            });
        }
        out.push(CStmt::Assign {
            target: read_expr(env, output, indices)?,
            value: env.value(value)?,
        });
        Ok(())
    }
}

pub struct MatrixSetRule;

impl LoweringRule for MatrixSetRule {
    fn name(&self) -> &'static str {
        "set"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::MatrixSet {
            output,
            matrix,
            indices,
            value,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let m = env.matrix(output)?;
        let same = env.names.group_of(output) == env.names.group_of(matrix);
        match m.storage {
            Storage::Dynamic => {
                if !same {
                    out.push(CStmt::assign(
                        env.name(output)?,
                        CExpr::call(runtime(m.elem, "copy"), vec![env.var(matrix)?]),
                    ));
                    state.note(
                        diag::SET_COPIES_INPUT,
                        format!("`{output}` copies `{matrix}` because the input is still live"),
                    );
                }
                if !fits_known_shape(env, m, indices)? {
                    let mut args = vec![env.var(output)?, CExpr::Int(indices.len() as i64)];
                    for idx in indices {
                        args.push(env.value(idx)?);
                    }
                    out.push(CStmt::Expr(CExpr::call(runtime(m.elem, "ensure"), args)));
                    state.note(
                        diag::SET_MAY_RESIZE,
                        format!("write to `{output}` may grow the matrix"),
                    );
                }
            }
            Storage::Static => {
                if !same {
                    out.push(memcpy(env.var(output)?, env.var(matrix)?, m)?);
                    state.note(
                        diag::SET_COPIES_INPUT,
                        format!("`{output}` copies `{matrix}` because the input is still live"),
                    );
                }
                if env.target == Target::C {
                    if let Some(check) = bounds_check(env, state, output, indices)? {
                        out.push(check);
                    }
                }
            }
            Storage::Buffer | Storage::Sized => {
                if !same {
                    return Err(LowerError::Unsupported(format!(
                        "`{output}` would need a copy of device buffer `{matrix}`"
                    )));
                }
            }
        }
        out.push(CStmt::Assign {
            target: read_expr(env, output, indices)?,
            value: env.value(value)?,
        });
        Ok(())
    }
}

// ── Control flow ────────────────────────────────────────────────────────────

pub struct BranchRule;

impl LoweringRule for BranchRule {
    fn name(&self) -> &'static str {
        "branch"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::Branch {
            condition,
            true_block,
            false_block,
            end_block,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let cond = env.value(condition)?;
        let then_body = lower_nested(*true_block, env, state)?;
        let else_body = lower_nested(*false_block, env, state)?;
        if !then_body.is_empty() || !else_body.is_empty() {
            out.push(CStmt::If {
                cond,
                then_body,
                else_body,
            });
        }
        lower_chain(*end_block, env, state, out)
    }
}

/// Runtime checks a `For` header needs for its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGuards {
    /// Sign unknown: pick the comparison direction at run time.
    pub sign_branch: bool,
    /// Interval may be zero: skip the loop when it is.
    pub zero_guard: bool,
    /// Known negative constant interval.
    pub descending: bool,
    /// Known zero interval: the loop never runs.
    pub never_runs: bool,
}

pub fn interval_guards(
    function: &TypedFunction,
    interval: &str,
) -> Result<IntervalGuards, LowerError> {
    let ty = function.type_of(interval)?;
    Ok(match ty.constant_value() {
        Some(c) => IntervalGuards {
            sign_branch: false,
            zero_guard: false,
            descending: c.is_negative(),
            never_runs: c.is_zero(),
        },
        None => IntervalGuards {
            sign_branch: ty.elem().is_signed(),
            zero_guard: true,
            descending: false,
            never_runs: false,
        },
    })
}

pub struct ForRule;

impl ForRule {
    /// Induction variable of the loop whose body is `loop_block`.
    pub fn induction_var(
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        loop_block: BlockId,
        start: &str,
    ) -> Result<String, LowerError> {
        match iter_output(&env.function.body, loop_block)? {
            Some(v) => Ok(env.name(&v)?.to_string()),
            None => {
                let ty = ctype(env.ty(start)?)?;
                Ok(state.fresh_local(env, "iter", ty))
            }
        }
    }

    fn independent(
        env: &LowerEnv<'_>,
        loop_block: BlockId,
        end_block: BlockId,
    ) -> Result<bool, LowerError> {
        if env.target != Target::C || env.options.ivdep.pragma().is_none() {
            return Ok(false);
        }
        let verdict =
            analyze_loop(env.function, loop_block, end_block, env.names, &HashSet::new())?;
        Ok(verdict == DependenceVerdict::Independent)
    }
}

impl LoweringRule for ForRule {
    fn name(&self) -> &'static str {
        "for"
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
            interval,
            end,
            loop_block,
            end_block,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let guards = interval_guards(env.function, interval)?;
        if guards.never_runs {
            debug!(%loop_block, "zero interval; loop elided");
            return lower_chain(*end_block, env, state, out);
        }
        let iter = Self::induction_var(env, state, *loop_block, start)?;
        let step = env.value(interval)?;
        let end_value = env.value(end)?;
        let init = CStmt::assign(iter.clone(), env.value(start)?);
        let increment = CStmt::increment(iter.clone(), step.clone());
        let independent = Self::independent(env, *loop_block, *end_block)?;
        let body = lower_nested(*loop_block, env, state)?;

        let mut header = Vec::new();
        let cond = if guards.sign_branch {
            let sign = state.fresh_local(env, "sign", ctype(env.ty(interval)?)?);
            header.push(CStmt::assign(
                sign.clone(),
                CExpr::ternary(
                    CExpr::bin(BinOp::Gt, step.clone(), CExpr::Int(0)),
                    CExpr::Int(1),
                    CExpr::Int(-1),
                ),
            ));
            state.note(
                diag::INTERVAL_SIGN_UNKNOWN,
                format!("sign of loop interval `{interval}` is chosen at run time"),
            );
            CExpr::bin(
                BinOp::Le,
                CExpr::bin(BinOp::Mul, CExpr::var(&iter), CExpr::var(&sign)),
                CExpr::bin(BinOp::Mul, end_value, CExpr::var(&sign)),
            )
        } else if guards.descending {
            CExpr::bin(BinOp::Ge, CExpr::var(&iter), end_value)
        } else {
            CExpr::bin(BinOp::Le, CExpr::var(&iter), end_value)
        };
        if independent {
            if let Some(pragma) = env.options.ivdep.pragma() {
                header.push(CStmt::Pragma(pragma.to_string()));
            }
        }
        header.push(CStmt::for_loop(init, cond, increment, body));

        if guards.zero_guard {
            state.note(
                diag::INTERVAL_MAY_BE_ZERO,
                format!("loop interval `{interval}` may be zero"),
            );
            out.push(CStmt::if_then(
                CExpr::bin(BinOp::Ne, step, CExpr::Int(0)),
                header,
            ));
        } else {
            out.extend(header);
        }
        lower_chain(*end_block, env, state, out)
    }
}

pub struct WhileRule;

impl LoweringRule for WhileRule {
    fn name(&self) -> &'static str {
        "while"
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::While {
            loop_block,
            end_block,
        } = instr
        else {
            return Err(mismatch(self.name(), instr));
        };
        let body = lower_nested(*loop_block, env, state)?;
        out.push(CStmt::While {
            cond: CExpr::Int(1),
            body,
        });
        lower_chain(*end_block, env, state, out)
    }
}

/// Replaces a planned parallel nest with a call to its kernel launcher.
pub struct HostLaunchRule;

impl LoweringRule for HostLaunchRule {
    fn name(&self) -> &'static str {
        "kernel_launch"
    }

    fn accepts(&self, _instr: &Instruction, env: &LowerEnv<'_>, state: &LowerState<'_>) -> bool {
        env.launches
            .is_some_and(|launches| launches.contains_key(&state.block))
    }

    fn apply(
        &self,
        instr: &Instruction,
        env: &LowerEnv<'_>,
        state: &mut LowerState<'_>,
        out: &mut Vec<CStmt>,
    ) -> Result<(), LowerError> {
        let Instruction::For { end_block, .. } = instr else {
            return Err(mismatch(self.name(), instr));
        };
        let Some(launch) = env.launches.and_then(|l| l.get(&state.block)) else {
            return Err(mismatch(self.name(), instr));
        };
        let mut args = Vec::with_capacity(launch.args.len());
        for arg in &launch.args {
            args.push(match arg {
                LaunchArg::Value(v) | LaunchArg::ReductionInitial(v) => env.value(v)?,
                LaunchArg::Data(m) => match env.matrix(m)?.storage {
                    Storage::Dynamic => CExpr::field(env.var(m)?, "data"),
                    _ => env.var(m)?,
                },
                LaunchArg::Numel(m) => env.numel(m)?,
                LaunchArg::Dim { matrix, dim } => env.dim(matrix, *dim)?,
                LaunchArg::NumTasks { start, end } => {
                    match (env.value(start)?.as_int(), env.value(end)?.as_int()) {
                        (Some(s), Some(e)) => CExpr::Int(e - s + 1),
                        _ => CExpr::bin(
                            BinOp::Add,
                            CExpr::bin(BinOp::Sub, env.value(end)?, env.value(start)?),
                            CExpr::Int(1),
                        ),
                    }
                }
                LaunchArg::ReductionResult(v) => CExpr::addr_of(env.var(v)?),
            });
        }
        debug!(kernel = %launch.kernel, block = %state.block, "loop replaced by launch");
        out.push(CStmt::Expr(CExpr::call(launch.prototype.name.clone(), args)));
        lower_chain(*end_block, env, state, out)
    }
}

// ── Functions ───────────────────────────────────────────────────────────────

/// Declarations for every variable `body` references that is not in `skip`.
pub fn declarations(
    body: &[CStmt],
    skip: &HashSet<String>,
    locals: &IndexMap<String, CType>,
    final_types: &IndexMap<String, VarType>,
) -> Result<Vec<CStmt>, LowerError> {
    let mut decls = Vec::new();
    for name in referenced_vars(body) {
        if skip.contains(&name) {
            continue;
        }
        if let Some(ty) = locals.get(&name) {
            decls.push(CStmt::decl(ty.clone(), name, None));
            continue;
        }
        let Some(ty) = final_types.get(&name) else {
            return Err(LowerError::malformed(
                "variable",
                format!("`{name}` is referenced but has no type"),
            ));
        };
        let cty = ctype(ty)?;
        let init = matches!(cty, CType::Matrix(_)).then(|| CExpr::Raw("NULL".into()));
        decls.push(CStmt::decl(cty, name, init));
    }
    Ok(decls)
}

#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub function: CFunction,
    /// Keys of the instances the function calls.
    pub dependencies: IndexSet<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Lower one function to a `CFunction` named `emitted_name`.
#[instrument(skip_all, fields(function = %function.name, target = target.name()))]
pub fn lower_function(
    function: &TypedFunction,
    program: &TypedProgram,
    options: &CodegenOptions,
    target: Target,
    emitted_name: &str,
    launches: Option<&LaunchTable>,
    instances: &mut InstanceSet,
) -> Result<LoweredFunction, LowerError> {
    let alloc = allocate(function)?;
    let mut names = VariableNames::assign(&alloc, &reserved_names(target, options));

    let mut params = Vec::new();
    let mut sized = IndexMap::new();
    for p in &function.params {
        let ty = function.type_of(p)?;
        let name = names
            .try_final_name(p)
            .ok_or_else(|| LowerError::MissingType(p.clone()))?
            .to_string();
        params.push(CParam::new(ctype(ty)?, name.clone()));
        if let Some(m) = ty.as_matrix().filter(|m| m.storage == Storage::Sized) {
            let extra = SizedNames::reserve(&mut names, &name, m.rank());
            params.extend(extra.params(CType::SizeT));
            sized.insert(name, extra);
        }
    }
    let returned = returns_single(function)?;
    let mut out_params = Vec::new();
    if !returned {
        for o in &function.outputs {
            let ty = function.type_of(o)?;
            if matches!(
                ty.as_matrix(),
                Some(m) if matches!(m.storage, Storage::Buffer | Storage::Sized)
            ) {
                return Err(LowerError::Unsupported(format!(
                    "device buffer `{o}` as a function output"
                )));
            }
            let base = names
                .try_final_name(o)
                .ok_or_else(|| LowerError::MissingType(o.clone()))?
                .to_string();
            let param = names.fresh(&format!("{base}_out"));
            params.push(CParam::new(CType::Ref(Box::new(ctype(ty)?)), param.clone()));
            out_params.push((o.clone(), param));
        }
    }

    let types = final_types(function, &names);
    let rules = RuleTable::sequential();
    let env = LowerEnv {
        function,
        program,
        names: &names,
        final_types: &types,
        sized: &sized,
        options,
        target,
        rules: &rules,
        kernel: None,
        launches,
    };
    let mut state = LowerState::new(instances);
    let mut body = Vec::new();
    if !function.body.blocks.is_empty() {
        lower_chain(BlockId::ENTRY, &env, &mut state, &mut body)?;
    }

    let ret = if returned {
        let o = &function.outputs[0];
        body.push(CStmt::Return(Some(env.value(o)?)));
        ctype(function.type_of(o)?)?
    } else {
        for (o, param) in &out_params {
            match function.type_of(o)?.as_matrix() {
                Some(m) if m.storage == Storage::Static => {
                    body.push(memcpy(CExpr::var(param), env.var(o)?, m)?);
                }
                _ => body.push(CStmt::Assign {
                    target: CExpr::Deref(Box::new(CExpr::var(param))),
                    value: env.value(o)?,
                }),
            }
        }
        CType::Void
    };

    let skip: HashSet<String> = params.iter().map(|p| p.name.clone()).collect();
    let mut full = declarations(&body, &skip, &state.locals, &types)?;
    full.extend(body);
    debug!(
        emitted = emitted_name,
        statements = full.len(),
        diagnostics = state.diagnostics.len(),
        "function lowered"
    );
    Ok(LoweredFunction {
        function: CFunction {
            qualifiers: Vec::new(),
            attributes: Vec::new(),
            ret,
            name: emitted_name.to_string(),
            params,
            body: full,
        },
        dependencies: state.called,
        diagnostics: state.diagnostics,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
