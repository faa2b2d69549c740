// ops.rs — Operator library: lowering of known scalar operators
//
// Maps callee names of pure operators to C / OpenCL C expressions. Matrix
// queries (`numel`, `size`) and allocation (`zeros`) are recognized here but
// need storage knowledge, so `lower.rs` expands them.
//
// Preconditions: argument expressions are already lowered for `target`.
// Postconditions: the returned expression has the output's numeric kind
//                 after C's usual conversions.
// Failure modes: `Malformed` on wrong arity; `Unsupported` on matrix operands.
// Side effects: none.

use crate::codegen::Target;
use crate::error::LowerError;
use crate::lir::{BinOp, CExpr, CType, UnOp};
use crate::types::{NumericKind, VarType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Neg,
    Not,
    Abs,
    Floor,
    Ceil,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Binary(BinOp),
    Unary(UnaryFn),
    MinMax { max: bool },
    Numel,
    Size,
    Zeros,
}

pub fn lookup(name: &str) -> Option<OpKind> {
    Some(match name {
        "plus" => OpKind::Binary(BinOp::Add),
        "minus" => OpKind::Binary(BinOp::Sub),
        "times" | "mtimes" => OpKind::Binary(BinOp::Mul),
        "rdivide" | "mrdivide" => OpKind::Binary(BinOp::Div),
        "lt" => OpKind::Binary(BinOp::Lt),
        "le" => OpKind::Binary(BinOp::Le),
        "gt" => OpKind::Binary(BinOp::Gt),
        "ge" => OpKind::Binary(BinOp::Ge),
        "eq" => OpKind::Binary(BinOp::Eq),
        "ne" => OpKind::Binary(BinOp::Ne),
        "and" => OpKind::Binary(BinOp::And),
        "or" => OpKind::Binary(BinOp::Or),
        "uminus" => OpKind::Unary(UnaryFn::Neg),
        "not" => OpKind::Unary(UnaryFn::Not),
        "abs" => OpKind::Unary(UnaryFn::Abs),
        "floor" => OpKind::Unary(UnaryFn::Floor),
        "ceil" => OpKind::Unary(UnaryFn::Ceil),
        "sqrt" => OpKind::Unary(UnaryFn::Sqrt),
        "min" => OpKind::MinMax { max: false },
        "max" => OpKind::MinMax { max: true },
        "numel" => OpKind::Numel,
        "size" => OpKind::Size,
        "zeros" => OpKind::Zeros,
        _ => return None,
    })
}

/// Operators have no observable side effects.
pub fn is_pure(name: &str) -> bool {
    lookup(name).is_some()
}

/// Number of inputs an operator takes, when fixed.
pub fn arity(op: OpKind) -> Option<usize> {
    match op {
        OpKind::Binary(_) | OpKind::MinMax { .. } | OpKind::Size => Some(2),
        OpKind::Unary(_) | OpKind::Numel => Some(1),
        OpKind::Zeros => None,
    }
}

/// `min(a, b)` / `max(a, b)` in the target's idiom.
pub fn min_max(max: bool, a: CExpr, b: CExpr, elem: NumericKind, target: Target) -> CExpr {
    if elem.is_float() {
        return CExpr::call(if max { "fmax" } else { "fmin" }, vec![a, b]);
    }
    match target {
        Target::OpenCl => CExpr::call(if max { "max" } else { "min" }, vec![a, b]),
        Target::C => {
            let cmp = if max { BinOp::Gt } else { BinOp::Lt };
            CExpr::ternary(CExpr::bin(cmp, a.clone(), b.clone()), a, b)
        }
    }
}

/// A lowered operand together with its source type.
pub struct OpArg<'a> {
    pub expr: CExpr,
    pub ty: &'a VarType,
}

fn check_arity(name: &str, op: OpKind, args: &[OpArg<'_>]) -> Result<(), LowerError> {
    match arity(op) {
        Some(n) if n != args.len() => Err(LowerError::malformed(
            "call",
            format!("`{name}` takes {n} inputs, got {}", args.len()),
        )),
        _ => Ok(()),
    }
}

/// Lower a pure scalar operator call to an expression.
pub fn scalar_expr(
    name: &str,
    op: OpKind,
    args: Vec<OpArg<'_>>,
    out: &VarType,
    target: Target,
) -> Result<CExpr, LowerError> {
    check_arity(name, op, &args)?;
    if out.is_matrix() || args.iter().any(|a| a.ty.is_matrix()) {
        return Err(LowerError::Unsupported(format!(
            "matrix-valued `{name}`"
        )));
    }
    let out_kind = out.elem();
    let mut args = args.into_iter();
    let mut next = || args.next().map(|a| (a.expr, a.ty.elem()));
    let Some((a, ak)) = next() else {
        return Err(LowerError::malformed("call", format!("`{name}` without inputs")));
    };
    let expr = match op {
        OpKind::Binary(bin) => {
            let Some((b, bk)) = next() else {
                return Err(LowerError::malformed("call", format!("`{name}` needs two inputs")));
            };
            let a = if bin == BinOp::Div
                && out_kind.is_float()
                && ak.is_integer()
                && bk.is_integer()
            {
                CExpr::cast(CType::Scalar(out_kind), a)
            } else {
                a
            };
            CExpr::bin(bin, a, b)
        }
        OpKind::MinMax { max } => {
            let Some((b, _)) = next() else {
                return Err(LowerError::malformed("call", format!("`{name}` needs two inputs")));
            };
            min_max(max, a, b, out_kind, target)
        }
        OpKind::Unary(f) => match f {
            UnaryFn::Neg => CExpr::Unary(UnOp::Neg, Box::new(a)),
            UnaryFn::Not => CExpr::Unary(UnOp::Not, Box::new(a)),
            UnaryFn::Abs if ak.is_float() => CExpr::call("fabs", vec![a]),
            UnaryFn::Abs if !ak.is_signed() => a,
            UnaryFn::Abs if ak == NumericKind::Int64 && target == Target::C => {
                CExpr::call("llabs", vec![a])
            }
            UnaryFn::Abs => CExpr::call("abs", vec![a]),
            UnaryFn::Floor | UnaryFn::Ceil if ak.is_integer() => a,
            UnaryFn::Floor => CExpr::call("floor", vec![a]),
            UnaryFn::Ceil => CExpr::call("ceil", vec![a]),
            UnaryFn::Sqrt if ak.is_integer() => {
                CExpr::call("sqrt", vec![CExpr::cast(CType::Scalar(NumericKind::Double), a)])
            }
            UnaryFn::Sqrt => CExpr::call("sqrt", vec![a]),
        },
        OpKind::Numel | OpKind::Size | OpKind::Zeros => {
            return Err(LowerError::malformed(
                "call",
                format!("`{name}` is a matrix operator"),
            ))
        }
    };
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::render_expr;
    use crate::types::Storage;

    fn arg<'a>(name: &str, ty: &'a VarType) -> OpArg<'a> {
        OpArg {
            expr: CExpr::var(name),
            ty,
        }
    }

    #[test]
    fn integer_division_into_double_casts() {
        let int = VarType::scalar(NumericKind::Int32);
        let dbl = VarType::scalar(NumericKind::Double);
        let op = lookup("rdivide").unwrap();
        let e = scalar_expr("rdivide", op, vec![arg("a", &int), arg("b", &int)], &dbl, Target::C)
            .unwrap();
        assert_eq!(render_expr(&e, Target::C), "(double)a / b");
    }

    #[test]
    fn integer_min_depends_on_target() {
        let int = VarType::scalar(NumericKind::Int32);
        let op = lookup("min").unwrap();
        let c =
            scalar_expr("min", op, vec![arg("a", &int), arg("b", &int)], &int, Target::C).unwrap();
        assert_eq!(render_expr(&c, Target::C), "(a < b) ? a : b");
        let cl = scalar_expr("min", op, vec![arg("a", &int), arg("b", &int)], &int, Target::OpenCl)
            .unwrap();
        assert_eq!(render_expr(&cl, Target::OpenCl), "min(a, b)");
    }

    #[test]
    fn abs_and_rounding_follow_kind() {
        let dbl = VarType::scalar(NumericKind::Double);
        let int = VarType::scalar(NumericKind::Int32);
        let abs = scalar_expr("abs", lookup("abs").unwrap(), vec![arg("x", &dbl)], &dbl, Target::C)
            .unwrap();
        assert_eq!(render_expr(&abs, Target::C), "fabs(x)");
        let floor =
            scalar_expr("floor", lookup("floor").unwrap(), vec![arg("n", &int)], &int, Target::C)
                .unwrap();
        assert_eq!(floor, CExpr::var("n"));
    }

    #[test]
    fn matrix_operands_are_unsupported() {
        let m = VarType::matrix(NumericKind::Double, vec![None], Storage::Dynamic);
        let args = vec![arg("A", &m), arg("B", &m)];
        let err = scalar_expr("plus", lookup("plus").unwrap(), args, &m, Target::C).unwrap_err();
        assert!(matches!(err, LowerError::Unsupported(_)));
    }

    #[test]
    fn wrong_arity_is_malformed() {
        let dbl = VarType::scalar(NumericKind::Double);
        let args = vec![arg("a", &dbl)];
        let err = scalar_expr("plus", lookup("plus").unwrap(), args, &dbl, Target::C).unwrap_err();
        assert_eq!(err.to_string(), "malformed call: `plus` takes 2 inputs, got 1");
    }

    #[test]
    fn calls_to_user_functions_are_impure() {
        assert!(is_pure("plus"));
        assert!(!is_pure("helper"));
    }
}
