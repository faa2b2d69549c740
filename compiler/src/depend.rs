// depend.rs — Loop-carried dependence analysis for innermost loops
//
// Decides whether iterations of a `For` loop may run in any order. The
// analysis is conservative: `Independent` is only returned when every
// indexed write is proven not to meet another access to the same storage in
// a different iteration, and no value computed in the loop escapes except a
// matrix updated through element writes.
//
// Preconditions: `loop_block` is the loop block of a `For` whose end block is
//                `end_block`.
// Postconditions: a `Dependent` verdict names the first reason found.
// Failure modes: `LowerError` only for malformed bodies (missing blocks).
// Side effects: none.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::affine::{may_collide, Affine, AffineContext};
use crate::alloc::VariableNames;
use crate::error::LowerError;
use crate::id::BlockId;
use crate::ssa::{Effect, InstrTag, Instruction, Operand, TypedFunction};

/// Maps SSA names to the storage they live in.
pub trait StorageNames {
    fn storage(&self, ssa: &str) -> Option<String>;
}

impl StorageNames for VariableNames {
    fn storage(&self, ssa: &str) -> Option<String> {
        self.try_final_name(ssa).map(str::to_string)
    }
}

/// Storage identity of matrices before allocation: names connected by
/// element writes, phis and copies share one buffer.
#[derive(Debug, Clone, Default)]
pub struct MatrixLineage {
    parent: HashMap<String, String>,
}

impl MatrixLineage {
    pub fn build(function: &TypedFunction) -> Self {
        let mut lineage = Self::default();
        let is_matrix = |n: &str| function.raw_type(n).is_some_and(|t| t.is_matrix());
        for block in &function.body.blocks {
            for instr in &block.instructions {
                match instr {
                    Instruction::SimpleSet { output, matrix, .. }
                    | Instruction::MatrixSet { output, matrix, .. } => {
                        lineage.union(output, matrix)
                    }
                    Instruction::Phi { output, sources } if is_matrix(output) => {
                        for (_, s) in sources {
                            lineage.union(output, s);
                        }
                    }
                    Instruction::ParallelCopy { copies } => {
                        for (d, s) in copies {
                            if is_matrix(d) {
                                lineage.union(d, s);
                            }
                        }
                    }
                    Instruction::Assignment {
                        output,
                        input: Operand::Var(src),
                    } if is_matrix(output) => lineage.union(output, src),
                    _ => {}
                }
            }
        }
        lineage
    }

    fn find(&self, name: &str) -> String {
        let mut current = name;
        while let Some(p) = self.parent.get(current) {
            if p == current {
                break;
            }
            current = p;
        }
        current.to_string()
    }

    fn union(&mut self, a: &str, b: &str) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the lexicographically smaller root so lineage is stable.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(child, root.clone());
            self.parent.entry(root.clone()).or_insert(root);
        }
    }
}

impl StorageNames for MatrixLineage {
    fn storage(&self, ssa: &str) -> Option<String> {
        Some(self.find(ssa))
    }
}

// ── Verdicts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependenceReason {
    NestedBlock,
    SideEffect(InstrTag),
    UnsupportedInstruction(InstrTag),
    NoInductionVariable,
    Collision { storage: String },
    EscapingValue(String),
    NonSetExit(String),
}

impl fmt::Display for DependenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependenceReason::NestedBlock => write!(f, "loop body contains nested blocks"),
            DependenceReason::SideEffect(tag) => write!(f, "`{tag}` has an observable side effect"),
            DependenceReason::UnsupportedInstruction(tag) => {
                write!(f, "`{tag}` is not analyzable")
            }
            DependenceReason::NoInductionVariable => {
                write!(f, "indexed writes without an induction variable")
            }
            DependenceReason::Collision { storage } => {
                write!(f, "accesses to `{storage}` may meet across iterations")
            }
            DependenceReason::EscapingValue(name) => {
                write!(f, "`{name}` is computed in the loop and read after it")
            }
            DependenceReason::NonSetExit(name) => {
                write!(f, "`{name}` is carried between iterations")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependenceVerdict {
    Independent,
    Dependent(DependenceReason),
}

impl DependenceVerdict {
    pub fn is_independent(&self) -> bool {
        matches!(self, DependenceVerdict::Independent)
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

struct Access<'a> {
    storage: String,
    indices: &'a [String],
    write: bool,
}

fn safe(instr: &Instruction) -> bool {
    matches!(
        instr.tag(),
        InstrTag::Assignment
            | InstrTag::Builtin
            | InstrTag::Comment
            | InstrTag::Line
            | InstrTag::Call
            | InstrTag::SimpleGet
            | InstrTag::SimpleSet
            | InstrTag::Iter
            | InstrTag::Phi
            | InstrTag::ParallelCopy
    )
}

/// Names whose value is a matrix threaded through element writes.
fn set_derived(instrs: &[Instruction], defined: &HashSet<&str>) -> HashSet<String> {
    let mut derived: HashSet<String> = HashSet::new();
    loop {
        let before = derived.len();
        for instr in instrs {
            match instr {
                Instruction::SimpleSet { output, .. } => {
                    derived.insert(output.clone());
                }
                Instruction::Phi { output, sources } => {
                    let inner: Vec<&String> = sources
                        .iter()
                        .map(|(_, s)| s)
                        .filter(|s| defined.contains(s.as_str()))
                        .collect();
                    if !inner.is_empty() && inner.iter().all(|s| derived.contains(*s)) {
                        derived.insert(output.clone());
                    }
                }
                Instruction::ParallelCopy { copies } => {
                    for (d, s) in copies {
                        if derived.contains(s) {
                            derived.insert(d.clone());
                        }
                    }
                }
                Instruction::Assignment {
                    output,
                    input: Operand::Var(s),
                } if derived.contains(s) => {
                    derived.insert(output.clone());
                }
                _ => {}
            }
        }
        if derived.len() == before {
            return derived;
        }
    }
}

/// Classify the loop whose body is `loop_block`. Names in `ignored`
/// (recognized reductions) are exempt from the escape checks.
pub fn analyze_loop(
    function: &TypedFunction,
    loop_block: BlockId,
    end_block: BlockId,
    storage: &dyn StorageNames,
    ignored: &HashSet<String>,
) -> Result<DependenceVerdict, LowerError> {
    let verdict = classify(function, loop_block, end_block, storage, ignored)?;
    match &verdict {
        DependenceVerdict::Independent => {
            debug!(function = %function.name, %loop_block, "loop iterations are independent")
        }
        DependenceVerdict::Dependent(reason) => {
            debug!(function = %function.name, %loop_block, %reason, "loop-carried dependence")
        }
    }
    Ok(verdict)
}

fn classify(
    function: &TypedFunction,
    loop_block: BlockId,
    end_block: BlockId,
    storage: &dyn StorageNames,
    ignored: &HashSet<String>,
) -> Result<DependenceVerdict, LowerError> {
    use DependenceReason as R;
    let dependent = |r| Ok(DependenceVerdict::Dependent(r));

    let instrs = &function.body.block(loop_block)?.instructions;
    for instr in instrs {
        if !instr.owned_blocks().is_empty() {
            return dependent(R::NestedBlock);
        }
        if !safe(instr) {
            return dependent(R::UnsupportedInstruction(instr.tag()));
        }
        if instr.effect() == Effect::SideEffect {
            return dependent(R::SideEffect(instr.tag()));
        }
    }

    let defs: HashMap<&str, &Instruction> = instrs
        .iter()
        .flat_map(|i| i.outputs().into_iter().map(move |o| (o, i)))
        .collect();
    let defined: HashSet<&str> = defs.keys().copied().collect();
    let iter = instrs.iter().find_map(|i| match i {
        Instruction::Iter { output } => Some(output.as_str()),
        _ => None,
    });

    // Indexed accesses.
    let mut accesses = Vec::new();
    for instr in instrs {
        let (matrix, indices, write) = match instr {
            Instruction::SimpleGet {
                matrix, indices, ..
            } => (matrix, indices, false),
            Instruction::SimpleSet {
                matrix, indices, ..
            } => (matrix, indices, true),
            _ => continue,
        };
        let Some(storage) = storage.storage(matrix) else {
            return Err(LowerError::malformed(
                "variable",
                format!("`{matrix}` has no storage"),
            ));
        };
        accesses.push(Access {
            storage,
            indices,
            write,
        });
    }
    if accesses.iter().any(|a| a.write) {
        let Some(iter) = iter else {
            return dependent(R::NoInductionVariable);
        };
        let ctx = AffineContext {
            function,
            defs: &defs,
            iter,
        };
        let forms: Vec<Vec<Option<Affine>>> = accesses
            .iter()
            .map(|a| a.indices.iter().map(|i| ctx.eval(i)).collect())
            .collect();
        for (w, write) in accesses.iter().enumerate().filter(|(_, a)| a.write) {
            for (o, other) in accesses.iter().enumerate() {
                // Each write is also paired with itself across iterations.
                if other.storage != write.storage || (other.write && o < w) {
                    continue;
                }
                if may_collide(&forms[w], &forms[o]) {
                    return dependent(R::Collision {
                        storage: write.storage.clone(),
                    });
                }
            }
        }
    }

    // Values carried between iterations or read after the loop.
    let derived = set_derived(instrs, &defined);
    for instr in instrs {
        if let Instruction::Phi { output, .. } = instr {
            if !ignored.contains(output) && !derived.contains(output) {
                return dependent(R::NonSetExit(output.clone()));
            }
        }
    }
    let inside: HashSet<BlockId> = [loop_block].into_iter().collect();
    let exit_phis = exit_phi_inputs(function, end_block)?;
    for b in function.body.block_ids().filter(|b| !inside.contains(b)) {
        for instr in &function.body.block(b)?.instructions {
            for input in instr.inputs() {
                if !defined.contains(input) || ignored.contains(input) {
                    continue;
                }
                let through_exit = b == end_block && exit_phis.contains(input);
                if !through_exit {
                    return dependent(R::EscapingValue(input.to_string()));
                }
                if !derived.contains(input) {
                    return dependent(R::NonSetExit(input.to_string()));
                }
            }
        }
    }
    Ok(DependenceVerdict::Independent)
}

/// Inputs of phis and parallel copies at the head of the end block.
fn exit_phi_inputs(
    function: &TypedFunction,
    end_block: BlockId,
) -> Result<HashSet<&str>, LowerError> {
    let mut names = HashSet::new();
    for instr in &function.body.block(end_block)?.instructions {
        match instr {
            Instruction::Phi { .. } | Instruction::ParallelCopy { .. } => {
                names.extend(instr.inputs());
            }
            Instruction::Line(_) | Instruction::Comment(_) => {}
            _ => break,
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn function(src: &str) -> TypedFunction {
        let result = parse(src);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        result.program.unwrap().functions.remove(0)
    }

    fn verdict(src: &str) -> DependenceVerdict {
        let f = function(src);
        let lineage = MatrixLineage::build(&f);
        analyze_loop(&f, BlockId(1), BlockId(2), &lineage, &HashSet::new()).unwrap()
    }

    fn listing(body: &str, extra_types: &str) -> String {
        format!(
            "\
function f(A$1, n$1) -> (B$3)
  types {{
    A$1: double[?]
    n$1: int32
    B$1: double[?]
    B$2: double[?]
    B$3: double[?]
    B$4: double[?]
    $one: int32(1)
    $two: double(2.0)
    i$1: int32
    $t: double
    $u: double
{extra_types}  }}
  block #0 {{
    A$1 = arg 0
    n$1 = arg 1
    B$1 = call zeros(n$1)
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }}
  block #1 {{
    B$2 = phi #0:B$1, #1:B$4
    i$1 = iter
{body}  }}
  block #2 {{
    B$3 = phi #0:B$1, #1:B$4
  }}
end
"
        )
    }

    #[test]
    fn elementwise_map_is_independent() {
        let src = listing(
            "    $t = simple_get A$1[i$1]\n    $u = call times($t, $two)\n    B$4 = simple_set B$2[i$1] = $u\n",
            "",
        );
        assert_eq!(verdict(&src), DependenceVerdict::Independent);
    }

    #[test]
    fn shifted_read_of_written_matrix_is_dependent() {
        let src = listing(
            "    $k = call minus(i$1, $one)\n    $t = simple_get B$2[$k]\n    $u = call plus($t, $two)\n    B$4 = simple_set B$2[i$1] = $u\n",
            "    $k: int32\n",
        );
        assert!(matches!(
            verdict(&src),
            DependenceVerdict::Dependent(DependenceReason::Collision { .. })
        ));
    }

    #[test]
    fn fixed_slot_accumulation_is_dependent() {
        let src = listing(
            "    $t = simple_get B$2[$one]\n    $s = simple_get A$1[i$1]\n    $u = call plus($t, $s)\n    B$4 = simple_set B$2[$one] = $u\n",
            "    $s: double\n",
        );
        assert!(matches!(
            verdict(&src),
            DependenceVerdict::Dependent(DependenceReason::Collision { .. })
        ));
    }

    #[test]
    fn nested_loop_is_dependent() {
        let src = "\
function f(n$1) -> ()
  types {
    n$1: int32
    $one: int32(1)
    i$1: int32
  }
  block #0 {
    n$1 = arg 0
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    i$1 = iter
    for $one, $one, n$1 loop #3 end #4
  }
  block #2 {
  }
  block #3 {
  }
  block #4 {
  }
end
";
        assert_eq!(
            verdict(src),
            DependenceVerdict::Dependent(DependenceReason::NestedBlock)
        );
    }

    #[test]
    fn scalar_accumulator_is_carried() {
        let src = "\
function total(n$1) -> (acc$4)
  types {
    n$1: int32
    acc$1: double(0.0)
    acc$2: double
    acc$3: double
    acc$4: double
    $one: int32(1)
    i$1: int32
    $x: double
  }
  block #0 {
    n$1 = arg 0
    acc$1 = 0.0
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    acc$2 = phi #0:acc$1, #1:acc$3
    i$1 = iter
    $x = i$1
    acc$3 = call plus(acc$2, $x)
  }
  block #2 {
    acc$4 = phi #0:acc$1, #1:acc$3
  }
end
";
        assert_eq!(
            verdict(src),
            DependenceVerdict::Dependent(DependenceReason::NonSetExit("acc$2".into()))
        );

        let f = function(src);
        let lineage = MatrixLineage::build(&f);
        let ignored: HashSet<String> = ["acc$2", "acc$3"].iter().map(|s| s.to_string()).collect();
        let v = analyze_loop(&f, BlockId(1), BlockId(2), &lineage, &ignored).unwrap();
        assert!(v.is_independent());
    }

    #[test]
    fn lineage_joins_set_chains() {
        let src = listing("    $t = simple_get A$1[i$1]\n    B$4 = simple_set B$2[i$1] = $t\n", "");
        let f = function(&src);
        let lineage = MatrixLineage::build(&f);
        assert_eq!(lineage.storage("B$4"), lineage.storage("B$1"));
        assert_ne!(lineage.storage("A$1"), lineage.storage("B$1"));
    }
}
