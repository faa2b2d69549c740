// ssa.rs — Typed SSA program model
//
// The input contract of the backend: functions made of blocks, blocks made of
// instructions. Control flow is a tree of block ownership: branch and loop
// instructions own the blocks they reference, and an owned "end" block
// continues the chain after the construct.
//
// Preconditions: every block index referenced by an instruction is owned by
//                exactly one instruction; every SSA name has one definition.
// Postconditions: none (types and queries only).
// Failure modes: missing types and blocks surface as `LowerError`.
// Side effects: none.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;

use crate::error::LowerError;
use crate::id::BlockId;
use crate::reduce::{GlobalStrategyKind, LocalStrategyKind};
use crate::schedule::ScheduleKind;
use crate::types::VarType;

// ── Instructions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Pi,
    True,
    False,
    Nargin,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Pi => "pi",
            Builtin::True => "true",
            Builtin::False => "false",
            Builtin::Nargin => "nargin",
        }
    }
}

/// One SSA instruction. Indices of get/set instructions are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Argument {
        output: String,
        index: usize,
    },
    Assignment {
        output: String,
        input: Operand,
    },
    Builtin {
        output: String,
        which: Builtin,
    },
    Comment(String),
    Line(u32),
    Call {
        outputs: Vec<String>,
        callee: String,
        inputs: Vec<String>,
    },
    MatrixGet {
        output: String,
        matrix: String,
        indices: Vec<String>,
    },
    MatrixSet {
        output: String,
        matrix: String,
        indices: Vec<String>,
        value: String,
    },
    SimpleGet {
        output: String,
        matrix: String,
        indices: Vec<String>,
    },
    SimpleSet {
        output: String,
        matrix: String,
        indices: Vec<String>,
        value: String,
    },
    GetOrFirst {
        output: String,
        matrix: String,
        index: String,
    },
    Branch {
        condition: String,
        true_block: BlockId,
        false_block: BlockId,
        end_block: BlockId,
    },
    For {
        start: String,
        interval: String,
        end: String,
        loop_block: BlockId,
        end_block: BlockId,
    },
    /// Induction value of the enclosing `For`; placed in its loop block.
    Iter {
        output: String,
    },
    While {
        loop_block: BlockId,
        end_block: BlockId,
    },
    Phi {
        output: String,
        sources: Vec<(BlockId, String)>,
    },
    /// Simultaneous copies, `(destination, source)`.
    ParallelCopy {
        copies: Vec<(String, String)>,
    },
    Break,
    /// Kernel-only: materializes an imported value.
    Initialization {
        name: String,
    },
}

/// Discriminant of `Instruction`, used as the dispatch key for lowering rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrTag {
    Argument,
    Assignment,
    Builtin,
    Comment,
    Line,
    Call,
    MatrixGet,
    MatrixSet,
    SimpleGet,
    SimpleSet,
    GetOrFirst,
    Branch,
    For,
    Iter,
    While,
    Phi,
    ParallelCopy,
    Break,
    Initialization,
}

impl InstrTag {
    pub const ALL: [InstrTag; 19] = [
        InstrTag::Argument,
        InstrTag::Assignment,
        InstrTag::Builtin,
        InstrTag::Comment,
        InstrTag::Line,
        InstrTag::Call,
        InstrTag::MatrixGet,
        InstrTag::MatrixSet,
        InstrTag::SimpleGet,
        InstrTag::SimpleSet,
        InstrTag::GetOrFirst,
        InstrTag::Branch,
        InstrTag::For,
        InstrTag::Iter,
        InstrTag::While,
        InstrTag::Phi,
        InstrTag::ParallelCopy,
        InstrTag::Break,
        InstrTag::Initialization,
    ];
}

impl fmt::Display for InstrTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrTag::Argument => "arg",
            InstrTag::Assignment => "assignment",
            InstrTag::Builtin => "builtin",
            InstrTag::Comment => "comment",
            InstrTag::Line => "line",
            InstrTag::Call => "call",
            InstrTag::MatrixGet => "get",
            InstrTag::MatrixSet => "set",
            InstrTag::SimpleGet => "simple_get",
            InstrTag::SimpleSet => "simple_set",
            InstrTag::GetOrFirst => "get_or_first",
            InstrTag::Branch => "branch",
            InstrTag::For => "for",
            InstrTag::Iter => "iter",
            InstrTag::While => "while",
            InstrTag::Phi => "phi",
            InstrTag::ParallelCopy => "pcopy",
            InstrTag::Break => "break",
            InstrTag::Initialization => "init",
        };
        f.write_str(name)
    }
}

/// Observable-effect class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Calls into program functions and validating reads or writes.
    SideEffect,
    Decorator,
    Line,
    Control,
}

impl Instruction {
    pub fn tag(&self) -> InstrTag {
        match self {
            Instruction::Argument { .. } => InstrTag::Argument,
            Instruction::Assignment { .. } => InstrTag::Assignment,
            Instruction::Builtin { .. } => InstrTag::Builtin,
            Instruction::Comment(_) => InstrTag::Comment,
            Instruction::Line(_) => InstrTag::Line,
            Instruction::Call { .. } => InstrTag::Call,
            Instruction::MatrixGet { .. } => InstrTag::MatrixGet,
            Instruction::MatrixSet { .. } => InstrTag::MatrixSet,
            Instruction::SimpleGet { .. } => InstrTag::SimpleGet,
            Instruction::SimpleSet { .. } => InstrTag::SimpleSet,
            Instruction::GetOrFirst { .. } => InstrTag::GetOrFirst,
            Instruction::Branch { .. } => InstrTag::Branch,
            Instruction::For { .. } => InstrTag::For,
            Instruction::Iter { .. } => InstrTag::Iter,
            Instruction::While { .. } => InstrTag::While,
            Instruction::Phi { .. } => InstrTag::Phi,
            Instruction::ParallelCopy { .. } => InstrTag::ParallelCopy,
            Instruction::Break => InstrTag::Break,
            Instruction::Initialization { .. } => InstrTag::Initialization,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Instruction::Comment(_) => Effect::Decorator,
            Instruction::Line(_) => Effect::Line,
            Instruction::Branch { .. }
            | Instruction::For { .. }
            | Instruction::While { .. }
            | Instruction::Break => Effect::Control,
            Instruction::MatrixGet { .. } | Instruction::MatrixSet { .. } => Effect::SideEffect,
            Instruction::Call { callee, .. } => {
                if crate::ops::is_pure(callee) {
                    Effect::None
                } else {
                    Effect::SideEffect
                }
            }
            _ => Effect::None,
        }
    }

    /// SSA names written by this instruction.
    pub fn outputs(&self) -> Vec<&str> {
        match self {
            Instruction::Argument { output, .. }
            | Instruction::Assignment { output, .. }
            | Instruction::Builtin { output, .. }
            | Instruction::MatrixGet { output, .. }
            | Instruction::MatrixSet { output, .. }
            | Instruction::SimpleGet { output, .. }
            | Instruction::SimpleSet { output, .. }
            | Instruction::GetOrFirst { output, .. }
            | Instruction::Iter { output }
            | Instruction::Phi { output, .. } => vec![output.as_str()],
            Instruction::Call { outputs, .. } => outputs.iter().map(String::as_str).collect(),
            Instruction::ParallelCopy { copies } => {
                copies.iter().map(|(d, _)| d.as_str()).collect()
            }
            Instruction::Initialization { name } => vec![name.as_str()],
            Instruction::Comment(_)
            | Instruction::Line(_)
            | Instruction::Branch { .. }
            | Instruction::For { .. }
            | Instruction::While { .. }
            | Instruction::Break => Vec::new(),
        }
    }

    /// SSA names read by this instruction. Phi inputs are included; liveness
    /// treats them as uses on the predecessor edge.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Instruction::Assignment {
                input: Operand::Var(v),
                ..
            } => vec![v.as_str()],
            Instruction::Call { inputs, .. } => inputs.iter().map(String::as_str).collect(),
            Instruction::MatrixGet {
                matrix, indices, ..
            }
            | Instruction::SimpleGet {
                matrix, indices, ..
            } => std::iter::once(matrix.as_str())
                .chain(indices.iter().map(String::as_str))
                .collect(),
            Instruction::MatrixSet {
                matrix,
                indices,
                value,
                ..
            }
            | Instruction::SimpleSet {
                matrix,
                indices,
                value,
                ..
            } => std::iter::once(matrix.as_str())
                .chain(indices.iter().map(String::as_str))
                .chain(std::iter::once(value.as_str()))
                .collect(),
            Instruction::GetOrFirst { matrix, index, .. } => vec![matrix.as_str(), index.as_str()],
            Instruction::Branch { condition, .. } => vec![condition.as_str()],
            Instruction::For {
                start,
                interval,
                end,
                ..
            } => vec![start.as_str(), interval.as_str(), end.as_str()],
            Instruction::Phi { sources, .. } => sources.iter().map(|(_, v)| v.as_str()).collect(),
            Instruction::ParallelCopy { copies } => {
                copies.iter().map(|(_, s)| s.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Blocks owned by this instruction, in emission order.
    pub fn owned_blocks(&self) -> Vec<BlockId> {
        match self {
            Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            } => vec![*true_block, *false_block, *end_block],
            Instruction::For {
                loop_block,
                end_block,
                ..
            }
            | Instruction::While {
                loop_block,
                end_block,
            } => vec![*loop_block, *end_block],
            _ => Vec::new(),
        }
    }

    /// Block continuing the chain after this construct, if it owns one.
    pub fn end_block(&self) -> Option<BlockId> {
        match self {
            Instruction::Branch { end_block, .. }
            | Instruction::For { end_block, .. }
            | Instruction::While { end_block, .. } => Some(*end_block),
            _ => None,
        }
    }

    /// Rewrite every block reference (owned blocks and phi predecessors).
    pub fn remap_blocks(&mut self, map: &impl Fn(BlockId) -> BlockId) {
        match self {
            Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            } => {
                *true_block = map(*true_block);
                *false_block = map(*false_block);
                *end_block = map(*end_block);
            }
            Instruction::For {
                loop_block,
                end_block,
                ..
            }
            | Instruction::While {
                loop_block,
                end_block,
            } => {
                *loop_block = map(*loop_block);
                *end_block = map(*end_block);
            }
            Instruction::Phi { sources, .. } => {
                for (block, _) in sources.iter_mut() {
                    *block = map(*block);
                }
            }
            _ => {}
        }
    }
}

// ── Blocks and bodies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// The last instruction, which is the one owning nested blocks if any.
    pub fn ending(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionBody {
    pub blocks: Vec<Block>,
}

impl FunctionBody {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn block(&self, id: BlockId) -> Result<&Block, LowerError> {
        self.blocks.get(id.index()).ok_or(LowerError::MissingBlock(id))
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Last block of the chain starting at `id`: follows end blocks of
    /// constructs that terminate each block.
    pub fn chain_end(&self, id: BlockId) -> Result<BlockId, LowerError> {
        let mut current = id;
        loop {
            match self.block(current)?.ending().and_then(Instruction::end_block) {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
    }

    /// All blocks transitively owned by the chain starting at `id`, including
    /// `id` itself, in pre-order.
    pub fn owned_closure(&self, id: BlockId) -> Result<Vec<BlockId>, LowerError> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(b) = stack.pop() {
            out.push(b);
            for instr in &self.block(b)?.instructions {
                let owned = instr.owned_blocks();
                stack.extend(owned.into_iter().rev());
            }
        }
        Ok(out)
    }

    /// Map from each owned block to the block whose ending instruction owns it.
    pub fn owners(&self) -> IndexMap<BlockId, BlockId> {
        let mut owners = IndexMap::new();
        for id in self.block_ids() {
            for instr in &self.blocks[id.index()].instructions {
                for owned in instr.owned_blocks() {
                    owners.insert(owned, id);
                }
            }
        }
        owners
    }

    /// Names defined anywhere in the given blocks.
    pub fn defined_in(&self, blocks: &[BlockId]) -> Result<HashSet<String>, LowerError> {
        let mut names = HashSet::new();
        for &b in blocks {
            for instr in &self.block(b)?.instructions {
                names.extend(instr.outputs().into_iter().map(str::to_string));
            }
        }
        Ok(names)
    }
}

// ── Parallel annotations ────────────────────────────────────────────────────

/// A size given either as a constant or as an SSA name known at launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SizeRef {
    Const(u64),
    Var(String),
}

impl SizeRef {
    pub fn constant(&self) -> Option<u64> {
        match self {
            SizeRef::Const(n) => Some(*n),
            SizeRef::Var(_) => None,
        }
    }
}

impl fmt::Display for SizeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeRef::Const(n) => write!(f, "{n}"),
            SizeRef::Var(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionKind {
    Sum,
    Min,
    Max,
    MatrixSet,
}

impl ReductionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sum" => ReductionKind::Sum,
            "min" => ReductionKind::Min,
            "max" => ReductionKind::Max,
            "matrix_set" => ReductionKind::MatrixSet,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ReductionKind::Sum => "sum",
            ReductionKind::Min => "min",
            ReductionKind::Max => "max",
            ReductionKind::MatrixSet => "matrix_set",
        }
    }

    pub fn is_scalar(self) -> bool {
        !matches!(self, ReductionKind::MatrixSet)
    }
}

impl fmt::Display for ReductionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction attached by the front end: the value entering the nest and the
/// value leaving it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionDecl {
    pub kind: ReductionKind,
    pub initial: String,
    pub final_name: String,
}

/// Requested parallelization settings for one nest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParallelRegionSettings {
    /// `None` lets the planner choose.
    pub schedule: Option<ScheduleKind>,
    pub schedule_params: Vec<SizeRef>,
    pub local_sizes: Vec<SizeRef>,
    /// Overrides the ranked global reduction strategies when non-empty.
    pub reduction_strategies: Vec<GlobalStrategyKind>,
    /// Overrides the ranked local reduction strategies when non-empty.
    pub local_reduction_strategies: Vec<LocalStrategyKind>,
}

/// A parallelizable loop nest, outermost loop first. Each entry is the block
/// whose ending instruction is the loop's `For`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelLoopDescriptor {
    pub loops: Vec<BlockId>,
    pub reductions: Vec<ReductionDecl>,
    pub settings: ParallelRegionSettings,
}

// ── Functions and programs ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TypedFunction {
    pub name: String,
    /// SSA names bound by `Argument` instructions, in parameter order.
    pub params: Vec<String>,
    pub outputs: Vec<String>,
    pub types: IndexMap<String, VarType>,
    pub parallel: Vec<ParallelLoopDescriptor>,
    pub body: FunctionBody,
}

impl TypedFunction {
    pub fn type_of(&self, name: &str) -> Result<&VarType, LowerError> {
        self.types
            .get(name)
            .ok_or_else(|| LowerError::MissingType(name.to_string()))
    }

    pub fn raw_type(&self, name: &str) -> Option<&VarType> {
        self.types.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedProgram {
    pub functions: Vec<TypedFunction>,
}

impl TypedProgram {
    pub fn function(&self, name: &str) -> Option<&TypedFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

// ── Display (listing format) ────────────────────────────────────────────────

fn join(items: &[String]) -> String {
    items.join(", ")
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{v}"),
            Operand::Int(v) => write!(f, "{v}"),
            Operand::Float(v) => write!(f, "{v:?}"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Argument { output, index } => write!(f, "{output} = arg {index}"),
            Instruction::Assignment { output, input } => write!(f, "{output} = {input}"),
            Instruction::Builtin { output, which } => {
                write!(f, "{output} = builtin {}", which.name())
            }
            Instruction::Comment(text) => {
                write!(f, "comment \"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
            }
            Instruction::Line(n) => write!(f, "line {n}"),
            Instruction::Call {
                outputs,
                callee,
                inputs,
            } => {
                match outputs.len() {
                    0 => {}
                    1 => write!(f, "{} = ", outputs[0])?,
                    _ => write!(f, "[{}] = ", join(outputs))?,
                }
                write!(f, "call {callee}({})", join(inputs))
            }
            Instruction::MatrixGet {
                output,
                matrix,
                indices,
            } => write!(f, "{output} = get {matrix}[{}]", join(indices)),
            Instruction::MatrixSet {
                output,
                matrix,
                indices,
                value,
            } => write!(f, "{output} = set {matrix}[{}] = {value}", join(indices)),
            Instruction::SimpleGet {
                output,
                matrix,
                indices,
            } => write!(f, "{output} = simple_get {matrix}[{}]", join(indices)),
            Instruction::SimpleSet {
                output,
                matrix,
                indices,
                value,
            } => write!(f, "{output} = simple_set {matrix}[{}] = {value}", join(indices)),
            Instruction::GetOrFirst {
                output,
                matrix,
                index,
            } => write!(f, "{output} = get_or_first {matrix}[{index}]"),
            Instruction::Branch {
                condition,
                true_block,
                false_block,
                end_block,
            } => write!(
                f,
                "branch {condition} then {true_block} else {false_block} end {end_block}"
            ),
            Instruction::For {
                start,
                interval,
                end,
                loop_block,
                end_block,
            } => write!(
                f,
                "for {start}, {interval}, {end} loop {loop_block} end {end_block}"
            ),
            Instruction::Iter { output } => write!(f, "{output} = iter"),
            Instruction::While {
                loop_block,
                end_block,
            } => write!(f, "while loop {loop_block} end {end_block}"),
            Instruction::Phi { output, sources } => {
                write!(f, "{output} = phi ")?;
                for (i, (block, name)) in sources.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{block}:{name}")?;
                }
                Ok(())
            }
            Instruction::ParallelCopy { copies } => {
                let dsts: Vec<String> = copies.iter().map(|(d, _)| d.clone()).collect();
                let srcs: Vec<String> = copies.iter().map(|(_, s)| s.clone()).collect();
                write!(f, "pcopy {} <- {}", join(&dsts), join(&srcs))
            }
            Instruction::Break => write!(f, "break"),
            Instruction::Initialization { name } => write!(f, "init {name}"),
        }
    }
}

impl fmt::Display for ParallelLoopDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parallel ")?;
        for (i, b) in self.loops.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{b}")?;
        }
        let s = &self.settings;
        match s.schedule {
            Some(kind) => write!(f, " schedule({}", kind.name())?,
            None => write!(f, " schedule(auto")?,
        }
        for p in &s.schedule_params {
            write!(f, ", {p}")?;
        }
        write!(f, ")")?;
        if !s.local_sizes.is_empty() {
            let sizes: Vec<String> = s.local_sizes.iter().map(ToString::to_string).collect();
            write!(f, " local_size({})", join(&sizes))?;
        }
        if !s.reduction_strategies.is_empty() {
            let names: Vec<String> = s
                .reduction_strategies
                .iter()
                .map(|k| k.name().to_string())
                .collect();
            write!(f, " strategies({})", join(&names))?;
        }
        if !s.local_reduction_strategies.is_empty() {
            let names: Vec<String> = s
                .local_reduction_strategies
                .iter()
                .map(|k| k.name().to_string())
                .collect();
            write!(f, " local_strategies({})", join(&names))?;
        }
        for r in &self.reductions {
            write!(f, " reduce {}({} -> {})", r.kind, r.initial, r.final_name)?;
        }
        Ok(())
    }
}

impl fmt::Display for TypedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function {}({}) -> ({})",
            self.name,
            join(&self.params),
            join(&self.outputs)
        )?;
        writeln!(f, "  types {{")?;
        for (name, ty) in &self.types {
            writeln!(f, "    {name}: {ty}")?;
        }
        writeln!(f, "  }}")?;
        for descriptor in &self.parallel {
            writeln!(f, "  {descriptor}")?;
        }
        for (i, block) in self.body.blocks.iter().enumerate() {
            writeln!(f, "  block #{i} {{")?;
            for instr in &block.instructions {
                writeln!(f, "    {instr}")?;
            }
            writeln!(f, "  }}")?;
        }
        writeln!(f, "end")
    }
}

impl fmt::Display for TypedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn inputs_and_outputs_are_exact() {
        let set = Instruction::SimpleSet {
            output: s("B$2"),
            matrix: s("B$1"),
            indices: vec![s("i$1")],
            value: s("$v"),
        };
        assert_eq!(set.outputs(), vec!["B$2"]);
        assert_eq!(set.inputs(), vec!["B$1", "i$1", "$v"]);

        let pc = Instruction::ParallelCopy {
            copies: vec![(s("a"), s("b")), (s("b"), s("a"))],
        };
        assert_eq!(pc.outputs(), vec!["a", "b"]);
        assert_eq!(pc.inputs(), vec!["b", "a"]);

        let lit = Instruction::Assignment {
            output: s("x"),
            input: Operand::Int(3),
        };
        assert!(lit.inputs().is_empty());
    }

    #[test]
    fn for_owns_loop_and_end() {
        let f = Instruction::For {
            start: s("a"),
            interval: s("b"),
            end: s("c"),
            loop_block: BlockId(1),
            end_block: BlockId(2),
        };
        assert_eq!(f.owned_blocks(), vec![BlockId(1), BlockId(2)]);
        assert_eq!(f.end_block(), Some(BlockId(2)));
        assert_eq!(f.effect(), Effect::Control);
        assert_eq!(f.to_string(), "for a, b, c loop #1 end #2");
    }

    #[test]
    fn chain_end_follows_constructs() {
        let body = FunctionBody::new(vec![
            Block::new(vec![Instruction::While {
                loop_block: BlockId(1),
                end_block: BlockId(2),
            }]),
            Block::new(vec![Instruction::Break]),
            Block::new(vec![Instruction::Branch {
                condition: s("c"),
                true_block: BlockId(3),
                false_block: BlockId(4),
                end_block: BlockId(5),
            }]),
            Block::default(),
            Block::default(),
            Block::default(),
        ]);
        assert_eq!(body.chain_end(BlockId(0)).unwrap(), BlockId(5));
        assert_eq!(body.owners().get(&BlockId(4)), Some(&BlockId(2)));
        assert_eq!(body.owned_closure(BlockId(2)).unwrap().len(), 4);
    }

    #[test]
    fn unknown_calls_have_side_effects() {
        let pure = Instruction::Call {
            outputs: vec![s("x")],
            callee: s("plus"),
            inputs: vec![s("a"), s("b")],
        };
        let user = Instruction::Call {
            outputs: vec![s("x")],
            callee: s("my_helper"),
            inputs: vec![s("a")],
        };
        assert_eq!(pure.effect(), Effect::None);
        assert_eq!(user.effect(), Effect::SideEffect);
    }

    #[test]
    fn display_phi_and_pcopy() {
        let phi = Instruction::Phi {
            output: s("x$3"),
            sources: vec![(BlockId(0), s("x$1")), (BlockId(1), s("x$2"))],
        };
        assert_eq!(phi.to_string(), "x$3 = phi #0:x$1, #1:x$2");
        let pc = Instruction::ParallelCopy {
            copies: vec![(s("a"), s("b")), (s("c"), s("d"))],
        };
        assert_eq!(pc.to_string(), "pcopy a, c <- b, d");
    }
}
