// affine.rs — Affine index forms for loop-carried dependence checks
//
// Within one iteration of an innermost loop an index is evaluated to
// `coeff·iter + constant + Σ kₛ·s`, where each `s` is a name defined outside
// the loop. Loop-invariant symbols hold the same value in every iteration, so
// two occurrences collide only through the induction-variable term.
//
// Preconditions: `defs` maps every name defined in the loop block to its
//                defining instruction.
// Postconditions: `None` means the index is not affine in the induction
//                 variable; callers treat it as a possible collision.
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};

use crate::ssa::{Instruction, Operand, TypedFunction};
use crate::types::Constant;

/// `coeff·iter + constant + Σ symbols`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Affine {
    pub coeff: i64,
    pub constant: i64,
    pub symbols: BTreeMap<String, i64>,
}

impl Affine {
    pub fn constant(c: i64) -> Self {
        Self {
            constant: c,
            ..Self::default()
        }
    }

    pub fn induction() -> Self {
        Self {
            coeff: 1,
            ..Self::default()
        }
    }

    pub fn symbol(name: &str) -> Self {
        let mut a = Self::default();
        a.symbols.insert(name.to_string(), 1);
        a
    }

    fn combine(mut self, other: &Affine, sign: i64) -> Option<Self> {
        self.coeff = self.coeff.checked_add(other.coeff.checked_mul(sign)?)?;
        self.constant = self.constant.checked_add(other.constant.checked_mul(sign)?)?;
        for (s, k) in &other.symbols {
            let entry = self.symbols.entry(s.clone()).or_insert(0);
            *entry = entry.checked_add(k.checked_mul(sign)?)?;
        }
        self.symbols.retain(|_, k| *k != 0);
        Some(self)
    }

    pub fn add(self, other: &Affine) -> Option<Self> {
        self.combine(other, 1)
    }

    pub fn sub(self, other: &Affine) -> Option<Self> {
        self.combine(other, -1)
    }

    pub fn scale(mut self, k: i64) -> Option<Self> {
        self.coeff = self.coeff.checked_mul(k)?;
        self.constant = self.constant.checked_mul(k)?;
        for v in self.symbols.values_mut() {
            *v = v.checked_mul(k)?;
        }
        self.symbols.retain(|_, v| *v != 0);
        Some(self)
    }

    fn as_constant(&self) -> Option<i64> {
        (self.coeff == 0 && self.symbols.is_empty()).then_some(self.constant)
    }
}

/// Evaluator for the index names of one loop block.
pub struct AffineContext<'a> {
    pub function: &'a TypedFunction,
    pub defs: &'a HashMap<&'a str, &'a Instruction>,
    pub iter: &'a str,
}

impl AffineContext<'_> {
    pub fn eval(&self, name: &str) -> Option<Affine> {
        self.eval_depth(name, 0)
    }

    fn eval_depth(&self, name: &str, depth: usize) -> Option<Affine> {
        if depth > 64 {
            return None;
        }
        if name == self.iter {
            return Some(Affine::induction());
        }
        if let Some(c) = self.function.raw_type(name).and_then(|t| t.constant_value()) {
            return c.as_i64().map(Affine::constant);
        }
        let Some(instr) = self.defs.get(name) else {
            // Defined outside the loop: invariant across iterations.
            return Some(Affine::symbol(name));
        };
        let operand = |n: &str| self.eval_depth(n, depth + 1);
        match instr {
            Instruction::Assignment { input, .. } => match input {
                Operand::Var(v) => operand(v),
                Operand::Int(v) => Some(Affine::constant(*v)),
                Operand::Float(v) => Constant::Float(*v).as_i64().map(Affine::constant),
            },
            Instruction::Call { callee, inputs, .. } => match (callee.as_str(), inputs.as_slice()) {
                ("plus", [a, b]) => operand(a)?.add(&operand(b)?),
                ("minus", [a, b]) => operand(a)?.sub(&operand(b)?),
                ("uminus", [a]) => operand(a)?.scale(-1),
                ("times" | "mtimes", [a, b]) => {
                    let (a, b) = (operand(a)?, operand(b)?);
                    match (a.as_constant(), b.as_constant()) {
                        (Some(k), _) => b.scale(k),
                        (_, Some(k)) => a.scale(k),
                        _ => None,
                    }
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Whether one index dimension proves the two accesses distinct for any two
/// different values of the induction variable.
pub fn proves_distinct(a: &Affine, b: &Affine) -> bool {
    if a.symbols != b.symbols {
        return false;
    }
    if a.coeff == 0 && b.coeff == 0 {
        return a.constant != b.constant;
    }
    if a.coeff != b.coeff {
        return false;
    }
    match b.constant.checked_sub(a.constant) {
        Some(diff) => diff == 0 || diff.checked_rem(a.coeff).is_some_and(|r| r != 0),
        None => false,
    }
}

/// Whether two index lists may address the same element in two different
/// iterations.
pub fn may_collide(a: &[Option<Affine>], b: &[Option<Affine>]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    !a.iter().zip(b).any(|pair| match pair {
        (Some(x), Some(y)) => proves_distinct(x, y),
        _ => false,
    })
}
